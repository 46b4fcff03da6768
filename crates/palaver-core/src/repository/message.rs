//! Message store trait definition.
//!
//! Storage interface for conversation messages and session records. The
//! queue consumer writes messages through it, the chat service reads
//! history and session listings, and startup rehydration reads everything.

use palaver_types::chat::{ConversationMessage, SessionRecord};
use palaver_types::error::RepositoryError;

/// Repository trait for conversation persistence.
///
/// Implementations live in palaver-infra (e.g., `SqliteMessageStore`).
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait MessageStore: Send + Sync {
    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Append one message.
    fn insert_message(
        &self,
        message: &ConversationMessage,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Messages of one session in insertion order.
    fn find_messages_by_session(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationMessage>, RepositoryError>> + Send;

    /// Every stored message in insertion order.
    fn find_all_messages(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<ConversationMessage>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    fn insert_session(
        &self,
        session: &SessionRecord,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn find_session(
        &self,
        session_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<SessionRecord>, RepositoryError>> + Send;

    /// Sessions owned by `username`, newest first.
    fn find_sessions_by_user(
        &self,
        username: &str,
    ) -> impl std::future::Future<Output = Result<Vec<SessionRecord>, RepositoryError>> + Send;
}
