//! GET /health - liveness and dependency status (no identity required).

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub broker_connected: bool,
    pub live_sessions: usize,
    pub model_types: Vec<String>,
}

/// Always 200 while the process serves requests. A lost broker connection
/// reports `degraded`: chat keeps working, but messages published before
/// the consumers reconnect are not stored.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker_connected = state.broker.is_connected();
    let registry = state.registry();

    Json(HealthResponse {
        status: if broker_connected { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        broker_connected,
        live_sessions: registry.len().await,
        model_types: registry.factory().registered_tags(),
    })
}
