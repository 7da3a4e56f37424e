// src/core/hub.rs

//! The connection hub: accepts device sockets, hands each one to a
//! `ConnectionHandler`, and fans connection lifecycle events out to observers.

use crate::connection::ConnectionHandler;
use crate::core::errors::HubError;
use crate::core::metrics;
use crate::core::protocol::{Packet, TeltonikaCodec};
use crate::core::registry::{ClientInfo, DeviceConnection, DeviceRegistry, SessionId};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// How long `serve` waits for connection handlers to finish after shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A subscriber to connection lifecycle events.
///
/// All methods are invoked synchronously from a connection's handler task and
/// must not block; long work belongs on a separate task.
pub trait HubObserver: Send + Sync {
    /// Called once a device has identified itself, before it is registered.
    fn on_connect(&self, _conn: &DeviceConnection) {}

    /// Called for every decoded packet, in wire order per device.
    fn on_packet(&self, _conn: &DeviceConnection, _packet: &Arc<Packet>) {}

    /// Called once after the read loop ends and the registry entry is removed.
    fn on_close(&self, _info: &ClientInfo) {}
}

/// Per-connection limits applied by the hub.
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub max_frame_size: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            handshake_timeout: Duration::from_secs(15 * 60),
            max_frame_size: crate::core::protocol::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// `DeviceHub` owns the device listener and drives the registry.
pub struct DeviceHub {
    registry: Arc<DeviceRegistry>,
    observers: Vec<Arc<dyn HubObserver>>,
    settings: HubSettings,
    acceptor: Option<TlsAcceptor>,
    session_counter: AtomicU64,
}

impl DeviceHub {
    pub fn new(registry: Arc<DeviceRegistry>, settings: HubSettings) -> Self {
        Self {
            registry,
            observers: Vec::new(),
            settings,
            acceptor: None,
            session_counter: AtomicU64::new(0),
        }
    }

    /// Adds a subscriber. Observers are notified in registration order.
    pub fn with_observer(mut self, observer: Arc<dyn HubObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Terminates TLS on every accepted socket before the handshake.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.acceptor = Some(acceptor);
        self
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    pub(crate) fn codec(&self) -> TeltonikaCodec {
        TeltonikaCodec::new(self.settings.max_frame_size)
    }

    /// Encodes `packet` and writes it to the device registered as `identifier`.
    ///
    /// Returns the session the packet was written to. There is no retry.
    pub async fn send_command(
        &self,
        identifier: &str,
        packet: &Packet,
    ) -> Result<SessionId, HubError> {
        let conn = self
            .registry
            .get(identifier)
            .ok_or_else(|| HubError::NotFound(identifier.to_string()))?;
        conn.send_packet(packet).await?;
        Ok(conn.session_id())
    }

    /// A best-effort snapshot of `addr - identifier` pairs.
    pub fn list_clients(&self) -> Vec<ClientInfo> {
        self.registry.snapshot()
    }

    pub(crate) fn notify_connect(&self, conn: &DeviceConnection) {
        for observer in &self.observers {
            observer.on_connect(conn);
        }
    }

    pub(crate) fn notify_packet(&self, conn: &DeviceConnection, packet: &Arc<Packet>) {
        for observer in &self.observers {
            observer.on_packet(conn, packet);
        }
    }

    pub(crate) fn notify_close(&self, info: &ClientInfo) {
        for observer in &self.observers {
            observer.on_close(info);
        }
    }

    /// Accepts device connections until shutdown is signalled or the listener fails.
    ///
    /// A listener failure is returned, not retried: the process is expected to exit.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<(), HubError> {
        let mut shutdown_rx = shutdown_tx.subscribe();
        let mut client_tasks = JoinSet::new();

        match listener.local_addr() {
            Ok(addr) => info!("tcp server listening at {}", addr),
            Err(e) => warn!("tcp server listening (local address unavailable: {})", e),
        }

        let result = loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.recv() => {
                    info!("Device listener received shutdown signal.");
                    break Ok(());
                }

                res = listener.accept() => {
                    match res {
                        Ok((socket, addr)) => {
                            metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
                            let hub = self.clone();
                            let conn_shutdown_rx = shutdown_tx.subscribe();
                            client_tasks.spawn(async move {
                                hub.handle_socket(socket, addr, conn_shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            error!("tcp connection accept error ({})", e);
                            break Err(HubError::Accept(e));
                        }
                    }
                }

                Some(res) = client_tasks.join_next() => {
                    if let Err(e) = res
                        && e.is_panic()
                    {
                        error!("A device handler panicked: {e:?}");
                    }
                }
            }
        };

        if result.is_ok() {
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                while client_tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("Timed out waiting for device connections to close.");
            }
        }
        // Aborting runs each handler's connection guard, so registry entries are still released.
        client_tasks.shutdown().await;
        info!("All device connections closed.");
        result
    }

    async fn handle_socket(
        self: Arc<Self>,
        socket: TcpStream,
        addr: SocketAddr,
        shutdown_rx: broadcast::Receiver<()>,
    ) {
        let Some(acceptor) = self.acceptor.clone() else {
            self.handle_stream(socket, addr, shutdown_rx).await;
            return;
        };

        match tokio::time::timeout(self.settings.handshake_timeout, acceptor.accept(socket)).await
        {
            Ok(Ok(tls_stream)) => {
                debug!("TLS handshake successful for {addr}");
                self.handle_stream(tls_stream, addr, shutdown_rx).await;
            }
            Ok(Err(e)) => warn!("TLS handshake error for {addr}: {e}"),
            Err(_) => warn!("TLS handshake timed out for {addr}"),
        }
    }

    /// Runs the full connection lifecycle for an already-accepted stream.
    pub async fn handle_stream<S>(
        self: Arc<Self>,
        stream: S,
        addr: SocketAddr,
        shutdown_rx: broadcast::Receiver<()>,
    ) where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let session_id = self.session_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let handler = ConnectionHandler::new(stream, addr, self, session_id, shutdown_rx);
        if let Err(e) = handler.run().await {
            warn!("[{}]: connection terminated ({})", addr, e);
        }
    }
}
