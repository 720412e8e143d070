//! The client-facing RPC layer, served over WebSocket.

pub mod envelope;
pub mod handler;
pub mod history;
pub mod server;
