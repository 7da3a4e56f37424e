// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection resource management.

use crate::core::hub::DeviceHub;
use crate::core::metrics;
use crate::core::registry::DeviceConnection;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// An RAII guard that performs the Closed-state transition exactly once, however
/// the connection handler's scope is exited (error, shutdown, or task abort).
pub struct ConnectionGuard {
    hub: Arc<DeviceHub>,
    addr: SocketAddr,
    /// Set once the device has identified itself and been registered.
    conn: Option<Arc<DeviceConnection>>,
}

impl ConnectionGuard {
    pub(crate) fn new(hub: Arc<DeviceHub>, addr: SocketAddr) -> Self {
        Self {
            hub,
            addr,
            conn: None,
        }
    }

    /// Marks the connection as registered, so that dropping the guard
    /// deregisters it and notifies observers.
    pub(crate) fn set_registered(&mut self, conn: Arc<DeviceConnection>) {
        metrics::CONNECTED_DEVICES.inc();
        self.conn = Some(conn);
    }
}

impl Drop for ConnectionGuard {
    /// Removes the registry entry first, then notifies observers, so a device
    /// is never listed after its `on_close` has run.
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            info!("[{}]: disconnected", self.addr);
            return;
        };

        conn.mark_closed();
        metrics::CONNECTED_DEVICES.dec();
        if !self
            .hub
            .registry()
            .remove_session(conn.identifier(), conn.session_id())
        {
            debug!(
                "[{}]: registry entry already replaced by a newer session",
                conn.identifier()
            );
        }
        self.hub.notify_close(&conn.info());
        info!("[{}]: disconnected", conn.identifier());
    }
}
