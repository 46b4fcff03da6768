//! Axum router configuration with middleware.
//!
//! All chat routes are under `/api/v1/chat`.
//! Middleware: CORS, tracing.

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::http::handlers;
use crate::state::AppState;

/// Build the complete API router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let chat_routes = Router::new()
        .route(
            "/sessions/stream",
            post(handlers::chat::create_session_stream),
        )
        .route("/send-stream", post(handlers::chat::send_stream))
        .route("/sessions", get(handlers::session::list_sessions))
        .route("/history", post(handlers::session::get_history));

    Router::new()
        .nest("/api/v1/chat", chat_routes)
        .route("/health", get(handlers::health::health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
