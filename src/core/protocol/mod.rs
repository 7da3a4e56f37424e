// src/core/protocol/mod.rs

//! The device-facing wire protocol: packet model and the frame codec.

pub mod packet;
pub mod teltonika;
pub use packet::{AvlRecord, CodecId, DecodedFrame, IoElement, Message, MessageType, Packet};
pub use teltonika::{DEFAULT_MAX_FRAME_SIZE, TeltonikaCodec, encode_packet};
