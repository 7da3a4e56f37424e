// src/core/mod.rs

//! The central module containing the bridge's domain logic: the device hub,
//! the registry, command correlation and telemetry forwarding.

pub mod correlator;
pub mod dispatcher;
pub mod errors;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod publisher;
pub mod registry;

pub use correlator::CommandCorrelator;
pub use dispatcher::TelemetryDispatcher;
pub use errors::{BusError, CommandError, HubError, ProtocolError};
pub use hub::{DeviceHub, HubObserver, HubSettings};
pub use registry::{ClientInfo, DeviceConnection, DeviceRegistry, SessionId};
