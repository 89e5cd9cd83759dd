//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::service::{HealthSnapshot, RegisterIndexError, TelemetryService};

use super::ws::ws_handler;

#[derive(Debug, Deserialize)]
pub struct SetRegisterIndexRequest {
    pub index: i64,
}

#[derive(Debug, Serialize)]
pub struct RegisterIndexResponse {
    pub index: Option<i64>,
}

async fn health_check(State(service): State<Arc<TelemetryService>>) -> Json<HealthSnapshot> {
    Json(service.health().await)
}

async fn set_register_index(
    State(service): State<Arc<TelemetryService>>,
    Json(request): Json<SetRegisterIndexRequest>,
) -> impl IntoResponse {
    match service.set_register_index(request.index) {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "index": request.index })),
        ),
        Err(e @ RegisterIndexError::Negative(_)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}

async fn get_register_index(
    State(service): State<Arc<TelemetryService>>,
) -> Json<RegisterIndexResponse> {
    Json(RegisterIndexResponse {
        index: service.register_index().await,
    })
}

async fn shutdown(State(service): State<Arc<TelemetryService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<TelemetryService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/api/set_tcp_velocity_r_index", post(set_register_index))
        .route("/api/tcp_velocity_r_index", get(get_register_index))
        .route("/shutdown", post(shutdown))
        .with_state(service)
}
