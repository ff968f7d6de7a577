//! WebSocket transport adapter.

pub mod connection;
pub mod handshake;
