// src/core/registry.rs

//! The live mapping from device identifier to its active connection.

use crate::core::errors::HubError;
use crate::core::protocol::{Packet, TeltonikaCodec};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::codec::Encoder;

/// Distinguishes successive connections that present the same identifier.
pub type SessionId = u64;

/// The write half of a device transport.
pub type DeviceWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A live, identified device connection.
///
/// The read half is owned by the connection's handler task; this handle owns
/// the write half. Every write goes through `writer`, so the handshake ack, the
/// per-frame response and outbound commands never interleave on the wire.
pub struct DeviceConnection {
    identifier: String,
    addr: SocketAddr,
    session_id: SessionId,
    connected_at: DateTime<Utc>,
    codec: TeltonikaCodec,
    writer: Mutex<DeviceWriter>,
    closed: AtomicBool,
}

impl DeviceConnection {
    pub fn new(
        identifier: String,
        addr: SocketAddr,
        session_id: SessionId,
        codec: TeltonikaCodec,
        writer: DeviceWriter,
    ) -> Self {
        Self {
            identifier,
            addr,
            session_id,
            connected_at: Utc::now(),
            codec,
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Set when the read loop has ended, before observers hear of the close.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes raw bytes to the device under the connection's write lock.
    pub async fn write_bytes(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Encodes `packet` and writes it to the device.
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), HubError> {
        let mut buf = BytesMut::new();
        self.codec
            .clone()
            .encode(packet, &mut buf)
            .map_err(HubError::Encode)?;
        self.write_bytes(&buf).await.map_err(HubError::Write)
    }

    /// Shuts the write half down. Errors are returned for logging only.
    pub async fn close(&self) -> std::io::Result<()> {
        self.writer.lock().await.shutdown().await
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            addr: self.addr,
            identifier: self.identifier.clone(),
            session_id: self.session_id,
            connected_at: self.connected_at,
        }
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("identifier", &self.identifier)
            .field("addr", &self.addr)
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// A point-in-time description of a registered device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    pub identifier: String,
    pub session_id: SessionId,
    pub connected_at: DateTime<Utc>,
}

impl fmt::Display for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.addr, self.identifier)
    }
}

/// `DeviceRegistry` holds at most one connection per identifier.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<String, Arc<DeviceConnection>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers `conn`, returning the connection it replaced, if any.
    ///
    /// The replaced connection is not closed here; its own handler tears it down.
    pub fn insert(&self, conn: Arc<DeviceConnection>) -> Option<Arc<DeviceConnection>> {
        self.devices.insert(conn.identifier.clone(), conn)
    }

    pub fn get(&self, identifier: &str) -> Option<Arc<DeviceConnection>> {
        self.devices.get(identifier).map(|entry| entry.value().clone())
    }

    /// Removes the entry for `identifier` only if it still belongs to `session_id`.
    pub fn remove_session(&self, identifier: &str, session_id: SessionId) -> bool {
        self.devices
            .remove_if(identifier, |_, conn| conn.session_id == session_id)
            .is_some()
    }

    /// A best-effort view of the registered devices. Ordering is unspecified.
    pub fn snapshot(&self) -> Vec<ClientInfo> {
        self.devices.iter().map(|entry| entry.value().info()).collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
