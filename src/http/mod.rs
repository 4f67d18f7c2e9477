//! HTTP surface: health, match administration and the WebSocket upgrade

pub mod routes;

pub use routes::build_router;
