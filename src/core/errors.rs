// src/core/errors.rs

//! Defines the error types shared by the hub, the codec, the correlator and the
//! telemetry publisher.

use std::sync::Arc;
use thiserror::Error;

/// Failures raised while decoding or encoding a protocol frame.
///
/// Every variant is fatal to the connection that produced it: the device is
/// expected to reconnect and resend.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("invalid preamble {0:#010x}, expected zero")]
    InvalidPreamble(u32),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("crc mismatch: frame carries {expected:#06x}, computed {actual:#06x}")]
    CrcMismatch { expected: u32, actual: u16 },

    #[error("unknown codec id {0:#04x}")]
    UnknownCodec(u8),

    #[error("record count mismatch: header says {header}, trailer says {trailer}")]
    QuantityMismatch { header: u8, trailer: u8 },

    #[error("unexpected end of payload while reading {0}")]
    Truncated(&'static str),

    #[error("{0} trailing bytes after the last record")]
    TrailingBytes(usize),

    #[error("unknown message type {0:#04x}")]
    UnknownMessageType(u8),

    #[error("message text is not valid utf-8")]
    InvalidText,

    #[error("cannot encode packet: {0}")]
    Unencodable(String),

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(Arc::new(e))
    }
}

/// Failures surfaced by the connection hub.
#[derive(Error, Debug)]
pub enum HubError {
    #[error("client with imei '{0}' not found")]
    NotFound(String),

    #[error("packet encode error: {0}")]
    Encode(ProtocolError),

    #[error("transport write error: {0}")]
    Write(std::io::Error),

    #[error("invalid handshake: {0}")]
    Handshake(String),

    #[error("tcp connection accept error: {0}")]
    Accept(std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

/// The outcome of a failed `send_command_and_wait` call.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("{0}")]
    SendFailed(HubError),

    #[error("tracker disconnected")]
    DeviceDisconnected,

    #[error("tracker response timeout exceeded")]
    ResponseTimeout,
}

impl CommandError {
    /// A short, stable label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            CommandError::SendFailed(_) => "send_failed",
            CommandError::DeviceDisconnected => "disconnected",
            CommandError::ResponseTimeout => "timeout",
        }
    }
}

/// Failures raised by a message bus client.
#[derive(Error, Debug)]
pub enum BusError {
    #[error("message bus client error: {0}")]
    Client(String),

    #[error("event serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
