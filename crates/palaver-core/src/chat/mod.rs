//! Request-level chat orchestration.

pub mod service;

pub use service::{ChatOutcome, ChatRequest, ChatService};
