// src/server/context.rs

use crate::config::Config;
use crate::core::publisher::{MqttEventLoop, PublisherPool};
use crate::core::{CommandCorrelator, DeviceHub};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Components built during setup that are moved into their own tasks by the spawner.
pub struct ServerInit {
    pub publisher: PublisherPool,
    pub mqtt_eventloop: MqttEventLoop,
    pub http_listener: TcpListener,
}

/// Holds all the initialized state required to run the server's main loop.
pub struct ServerContext {
    pub config: Config,
    pub hub: Arc<DeviceHub>,
    pub correlator: Arc<CommandCorrelator>,
    pub device_listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    pub init: Option<ServerInit>,
}
