//! Session listing and history handlers.
//!
//! Endpoints:
//! - GET  /api/v1/chat/sessions - List the caller's conversations, newest first
//! - POST /api/v1/chat/history  - Ordered history of one conversation

use std::time::Instant;

use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use uuid::Uuid;

use palaver_types::chat::{HistoryEntry, SessionSummary};

use crate::http::error::AppError;
use crate::http::extractors::username::Username;
use crate::http::response::ApiResponse;
use crate::state::AppState;

/// Request body for the history endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    pub session_id: String,
}

/// GET /api/v1/chat/sessions - List sessions for the caller.
pub async fn list_sessions(
    State(state): State<AppState>,
    Username(username): Username,
) -> Result<Json<ApiResponse<Vec<SessionSummary>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let sessions = state.chat_service.list_sessions(&username).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(sessions, request_id, elapsed)
        .with_link("self", "/api/v1/chat/sessions")
        .with_link("history", "/api/v1/chat/history");

    Ok(Json(resp))
}

/// POST /api/v1/chat/history - Messages of one session as `{isUser, content}`.
pub async fn get_history(
    State(state): State<AppState>,
    Username(username): Username,
    Json(body): Json<HistoryRequest>,
) -> Result<Json<ApiResponse<Vec<HistoryEntry>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let history = state
        .chat_service
        .history(&username, body.session_id.trim())
        .await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(history, request_id, elapsed)
        .with_link("sessions", "/api/v1/chat/sessions");

    Ok(Json(resp))
}
