// src/connection/handler.rs

//! Defines the `ConnectionHandler` which manages the full lifecycle of a device
//! connection: Connected → Identifying → Active → Closed.

use super::guard::ConnectionGuard;
use crate::core::errors::{HubError, ProtocolError};
use crate::core::hub::DeviceHub;
use crate::core::metrics;
use crate::core::registry::{DeviceConnection, SessionId};
use futures::StreamExt;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, warn};

/// The byte written back once a device has identified itself.
pub const HANDSHAKE_ACK: u8 = 0x01;

/// The largest identifier accepted during the handshake.
pub const MAX_IDENTIFIER_LEN: usize = 1022;

/// Reads the identification message: a 2-byte big-endian length followed by
/// that many bytes of identifier text, trimmed of surrounding whitespace.
pub async fn read_identifier<R>(reader: &mut R) -> Result<String, HubError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 2];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| handshake_read_error(e, "invalid first message"))?;
    let len = usize::from(u16::from_be_bytes(len_buf));
    if len > MAX_IDENTIFIER_LEN {
        return Err(HubError::Handshake(format!(
            "invalid imei size {len} (read: {})",
            hex::encode(len_buf)
        )));
    }

    let mut raw = vec![0u8; len];
    reader
        .read_exact(&mut raw)
        .await
        .map_err(|e| handshake_read_error(e, "invalid imei size"))?;

    let identifier = String::from_utf8_lossy(&raw).trim().to_string();
    if identifier.is_empty() {
        return Err(HubError::Handshake(format!(
            "invalid imei '' (read: {})",
            hex::encode(&raw)
        )));
    }
    Ok(identifier)
}

fn handshake_read_error(e: std::io::Error, what: &str) -> HubError {
    if e.kind() == ErrorKind::UnexpectedEof {
        HubError::Handshake(format!("{what}: connection closed early"))
    } else {
        HubError::Io(e)
    }
}

/// Manages the full lifecycle of a device connection.
pub struct ConnectionHandler<S> {
    stream: S,
    addr: SocketAddr,
    hub: Arc<DeviceHub>,
    session_id: SessionId,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<S> ConnectionHandler<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(
        stream: S,
        addr: SocketAddr,
        hub: Arc<DeviceHub>,
        session_id: SessionId,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            stream,
            addr,
            hub,
            session_id,
            shutdown_rx,
        }
    }

    /// Drives the connection until the peer leaves, an error occurs, or the
    /// server shuts down. Cleanup happens in `ConnectionGuard` on every path.
    pub async fn run(self) -> Result<(), HubError> {
        let ConnectionHandler {
            stream,
            addr,
            hub,
            session_id,
            mut shutdown_rx,
        } = self;
        let settings = hub.settings().clone();
        let (mut reader, writer) = tokio::io::split(stream);
        let mut guard = ConnectionGuard::new(hub.clone(), addr);
        info!("[{}]: connected", addr);

        // --- Identifying ---
        let identified = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return Ok(()),
            res = timeout(settings.handshake_timeout, read_identifier(&mut reader)) => res,
        };
        let identifier = match identified {
            Ok(Ok(identifier)) => identifier,
            Ok(Err(e)) => {
                metrics::HANDSHAKE_FAILURES_TOTAL.inc();
                error!("[{}]: {}", addr, e);
                return Err(e);
            }
            Err(_) => {
                metrics::HANDSHAKE_FAILURES_TOTAL.inc();
                return Err(HubError::Handshake(
                    "no identification before timeout".to_string(),
                ));
            }
        };

        let conn = Arc::new(DeviceConnection::new(
            identifier.clone(),
            addr,
            session_id,
            hub.codec(),
            Box::new(writer),
        ));
        hub.notify_connect(&conn);
        if let Some(previous) = hub.registry().insert(conn.clone()) {
            warn!(
                "[{}]: replacing session {} from {}",
                identifier,
                previous.session_id(),
                previous.addr()
            );
        }
        guard.set_registered(conn.clone());
        info!("[{}]: imei - {}", addr, identifier);

        if let Err(e) = conn.write_bytes(&[HANDSHAKE_ACK]).await {
            error!("[{}]: error writing ack ({})", identifier, e);
            return Err(HubError::Write(e));
        }

        // --- Active ---
        let mut framed = FramedRead::new(reader, hub.codec());
        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("[{}]: closing on server shutdown", identifier);
                    break Ok(());
                }
                next = timeout(settings.idle_timeout, framed.next()) => next,
            };

            let frame = match next {
                Err(_) => {
                    warn!("[{}]: idle for {:?}, closing", identifier, settings.idle_timeout);
                    break Err(HubError::Io(std::io::Error::new(
                        ErrorKind::TimedOut,
                        "read deadline exceeded",
                    )));
                }
                Ok(None) => {
                    debug!("[{}]: connection closed by peer", identifier);
                    break Ok(());
                }
                Ok(Some(Err(e))) => {
                    if is_normal_disconnect(&e) {
                        debug!("[{}]: connection closed by peer ({})", identifier, e);
                        break Ok(());
                    }
                    metrics::DECODE_ERRORS_TOTAL.inc();
                    error!(
                        "[{}]: packet decode error ({}) (buffered: {})",
                        identifier,
                        e,
                        hex::encode(framed.read_buffer())
                    );
                    break Err(HubError::Protocol(e));
                }
                Ok(Some(Ok(frame))) => frame,
            };

            if let Some(response) = &frame.response
                && let Err(e) = conn.write_bytes(response).await
            {
                error!("[{}]: error writing response ({})", identifier, e);
                break Err(HubError::Write(e));
            }

            metrics::PACKETS_DECODED_TOTAL.inc();
            if tracing::enabled!(tracing::Level::DEBUG) {
                debug!("[{}]: message: {}", identifier, hex::encode(&frame.raw));
                match serde_json::to_string(&frame.packet) {
                    Ok(json) => debug!("[{}]: decoded: {}", identifier, json),
                    Err(e) => error!("[{}]: decoder result marshaling error ({})", identifier, e),
                }
            }

            let packet = Arc::new(frame.packet);
            hub.notify_packet(&conn, &packet);
        };

        // --- Closed ---
        drop(guard);
        if let Err(e) = conn.close().await {
            debug!("[{}]: connection close error ({})", identifier, e);
        }
        result
    }
}

/// Helper function to check for non-critical disconnection errors.
fn is_normal_disconnect(e: &ProtocolError) -> bool {
    matches!(e, ProtocolError::Io(arc_err) if matches!(
        arc_err.kind(),
        ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::ConnectionAborted
    ))
}
