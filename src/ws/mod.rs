//! WebSocket transport adapter

pub mod handler;
pub mod protocol;
