// src/core/protocol/packet.rs

//! The structured form of a decoded frame: telemetry records and text messages.

use crate::core::errors::ProtocolError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies the payload layout of a frame.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
pub enum CodecId {
    /// AVL records with 1-byte IO ids.
    Codec8,
    /// AVL records with 2-byte IO ids, 2-byte counts and variable-length values.
    Codec8Extended,
    /// AVL records with 2-byte IO ids and a generation type.
    Codec16,
    /// Server commands and device responses as text.
    Codec12,
}

impl CodecId {
    pub fn as_byte(self) -> u8 {
        match self {
            CodecId::Codec8 => 0x08,
            CodecId::Codec8Extended => 0x8E,
            CodecId::Codec16 => 0x10,
            CodecId::Codec12 => 0x0C,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x08 => Ok(CodecId::Codec8),
            0x8E => Ok(CodecId::Codec8Extended),
            0x10 => Ok(CodecId::Codec16),
            0x0C => Ok(CodecId::Codec12),
            other => Err(ProtocolError::UnknownCodec(other)),
        }
    }

    /// True for codecs that carry telemetry records and expect a record-count acknowledgment.
    pub fn is_avl(self) -> bool {
        !matches!(self, CodecId::Codec12)
    }
}

/// One IO element of an AVL record. The value keeps its wire width.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoElement {
    pub id: u16,
    #[serde(with = "hex::serde")]
    pub value: Vec<u8>,
}

/// One timestamped position entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvlRecord {
    pub timestamp_ms: u64,
    pub priority: u8,
    pub lng: f64,
    pub lat: f64,
    pub altitude: i16,
    pub angle: u16,
    pub satellites: u8,
    pub speed: u16,
    pub event_id: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_type: Option<u8>,
    pub elements: Vec<IoElement>,
}

impl AvlRecord {
    /// The record's capture time, if the timestamp is representable.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        i64::try_from(self.timestamp_ms)
            .ok()
            .and_then(DateTime::from_timestamp_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Command,
    Response,
}

impl MessageType {
    pub fn as_byte(self) -> u8 {
        match self {
            MessageType::Command => 0x05,
            MessageType::Response => 0x06,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x05 => Ok(MessageType::Command),
            0x06 => Ok(MessageType::Response),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// A text message exchanged over Codec 12.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub text: String,
}

/// The structured result of decoding one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub codec_id: CodecId,
    #[serde(default)]
    pub data: Vec<AvlRecord>,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Packet {
    /// Builds the packet for a server-to-device command.
    pub fn command(text: impl Into<String>) -> Self {
        Self {
            codec_id: CodecId::Codec12,
            data: Vec::new(),
            messages: vec![Message {
                kind: MessageType::Command,
                text: text.into(),
            }],
        }
    }

    /// Builds a telemetry packet from a set of records.
    pub fn telemetry(codec_id: CodecId, data: Vec<AvlRecord>) -> Self {
        Self {
            codec_id,
            data,
            messages: Vec::new(),
        }
    }

    pub fn has_telemetry(&self) -> bool {
        !self.data.is_empty()
    }
}

/// What the hub receives for every frame read from a device.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub packet: Packet,
    /// Bytes that must be written back to the device before the packet is dispatched.
    pub response: Option<Bytes>,
    /// The complete frame as it arrived on the wire.
    pub raw: Bytes,
}
