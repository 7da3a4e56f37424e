// src/connection/mod.rs

//! Manages the lifecycle of a single device TCP connection: identification,
//! the frame read loop, and cleanup on close.

mod guard;
mod handler;

pub use guard::ConnectionGuard;
pub use handler::{ConnectionHandler, HANDSHAKE_ACK, MAX_IDENTIFIER_LEN, read_identifier};
