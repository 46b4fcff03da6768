//! Conversation sessions and their registry.
//!
//! - `ConversationSession`: ordered buffer + bound backend + streaming algorithm
//! - `SessionRegistry`: `(username, session_id)` directory with get-or-create-once
//! - `ChunkSink`: transport boundary for streamed reply text

pub mod conversation;
pub mod registry;
pub mod sink;
