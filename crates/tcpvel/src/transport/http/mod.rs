//! HTTP + WebSocket transport via axum.

mod routes;
mod server;
mod ws;

pub use routes::{RegisterIndexResponse, SetRegisterIndexRequest, routes};
pub use server::{ServerConfig, serve, serve_listener};
pub use ws::{WS_SEND_TIMEOUT, WsSubscriber};
