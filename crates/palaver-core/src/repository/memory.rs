//! In-memory [`MessageStore`] for tests and `memory://` development setups.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use palaver_types::chat::{ConversationMessage, SessionRecord};
use palaver_types::error::RepositoryError;

use super::message::MessageStore;

#[derive(Default)]
struct StoreState {
    messages: Vec<ConversationMessage>,
    sessions: Vec<SessionRecord>,
}

/// Cloneable in-memory store. Clones share the same data.
#[derive(Clone, Default)]
pub struct InMemoryMessageStore {
    state: Arc<Mutex<StoreState>>,
    fail_next: Arc<AtomicUsize>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` message inserts fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Injected failures not yet consumed by an insert.
    pub fn pending_failures(&self) -> usize {
        self.fail_next.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("message store lock poisoned")
    }

    fn take_failure(&self) -> bool {
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl MessageStore for InMemoryMessageStore {
    async fn insert_message(&self, message: &ConversationMessage) -> Result<(), RepositoryError> {
        if self.take_failure() {
            return Err(RepositoryError::Query("injected write failure".to_string()));
        }
        self.lock().messages.push(message.clone());
        Ok(())
    }

    async fn find_messages_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn find_all_messages(&self) -> Result<Vec<ConversationMessage>, RepositoryError> {
        Ok(self.lock().messages.clone())
    }

    async fn insert_session(&self, session: &SessionRecord) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        if state.sessions.iter().any(|s| s.id == session.id) {
            return Err(RepositoryError::Conflict(format!(
                "session {} already exists",
                session.id
            )));
        }
        state.sessions.push(session.clone());
        Ok(())
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<SessionRecord>, RepositoryError> {
        Ok(self.lock().sessions.iter().find(|s| s.id == session_id).cloned())
    }

    async fn find_sessions_by_user(&self, username: &str) -> Result<Vec<SessionRecord>, RepositoryError> {
        let mut sessions: Vec<SessionRecord> = self
            .lock()
            .sessions
            .iter()
            .filter(|s| s.username == username)
            .cloned()
            .collect();
        // Stable sort keeps later inserts first among equal timestamps.
        sessions.reverse();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_messages_keep_insertion_order() {
        let store = InMemoryMessageStore::new();
        for (sid, content) in [("a", "1"), ("b", "2"), ("a", "3")] {
            store
                .insert_message(&ConversationMessage::new(sid, content, "u", true))
                .await
                .unwrap();
        }
        let a: Vec<_> = store
            .find_messages_by_session("a")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(a, vec!["1", "3"]);
        assert_eq!(store.find_all_messages().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let store = InMemoryMessageStore::new();
        store.fail_next(1);
        let msg = ConversationMessage::new("a", "x", "u", true);
        assert!(store.insert_message(&msg).await.is_err());
        assert!(store.insert_message(&msg).await.is_ok());
        assert_eq!(store.message_count(), 1);
    }

    #[tokio::test]
    async fn test_sessions_newest_first_and_unique() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        let older = SessionRecord {
            id: "s1".to_string(),
            username: "alice".to_string(),
            title: "first".to_string(),
            created_at: now - Duration::minutes(5),
        };
        let newer = SessionRecord {
            id: "s2".to_string(),
            created_at: now,
            title: "second".to_string(),
            ..older.clone()
        };
        store.insert_session(&older).await.unwrap();
        store.insert_session(&newer).await.unwrap();
        assert!(matches!(
            store.insert_session(&older).await,
            Err(RepositoryError::Conflict(_))
        ));

        let listed: Vec<_> = store
            .find_sessions_by_user("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(listed, vec!["s2", "s1"]);
        assert!(store.find_sessions_by_user("bob").await.unwrap().is_empty());
        assert_eq!(store.find_session("s1").await.unwrap().unwrap().title, "first");
    }
}
