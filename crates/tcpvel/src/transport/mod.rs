//! Transport layer for tcpvel.
//!
//! Currently provides HTTP and WebSocket transport via axum.

pub mod http;

pub use http::{ServerConfig, serve, serve_listener};
