//! HTTP/REST API layer for Palaver.
//!
//! Axum-based API at `/api/v1/` with caller identity taken from the
//! `X-Username` header, SSE chat streaming, envelope responses for
//! everything else, and CORS support.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
