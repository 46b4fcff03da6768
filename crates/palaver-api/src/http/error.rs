//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use palaver_types::error::GatewayError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors raised by the chat core.
    Gateway(GatewayError),
    /// Validation error detected at the HTTP boundary.
    Validation(String),
    /// Generic internal error. The message is logged, never returned.
    Internal(String),
}

impl From<GatewayError> for AppError {
    fn from(e: GatewayError) -> Self {
        AppError::Gateway(e)
    }
}

impl AppError {
    /// Status, machine-readable code and client-facing message.
    pub fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::Validation(msg) | AppError::Gateway(GatewayError::Validation(msg)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
            }
            AppError::Gateway(GatewayError::UnsupportedModelType(tag)) => (
                StatusCode::BAD_REQUEST,
                "UNSUPPORTED_MODEL_TYPE",
                format!("Unsupported model type '{tag}'"),
            ),
            AppError::Gateway(GatewayError::BackendConfig { tag, .. }) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "BACKEND_CONFIG_ERROR",
                format!("Backend '{tag}' is not configured correctly"),
            ),
            AppError::Gateway(GatewayError::SessionNotFound(id)) => (
                StatusCode::NOT_FOUND,
                "SESSION_NOT_FOUND",
                format!("Session '{id}' not found"),
            ),
            AppError::Gateway(GatewayError::ModelInvocation { .. }) => (
                StatusCode::BAD_GATEWAY,
                "MODEL_ERROR",
                "Failed to generate response".to_string(),
            ),
            AppError::Gateway(_) | AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "Internal server error".to_string(),
            ),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            match &self {
                AppError::Gateway(e) => tracing::error!(code, error = %e, "request failed"),
                AppError::Internal(e) => tracing::error!(code, error = %e, "request failed"),
                AppError::Validation(_) => {}
            }
        }

        (status, Json(ApiResponse::error(code, &message))).into_response()
    }
}
