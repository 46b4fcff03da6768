//! SQLite message store implementation.
//!
//! Implements `MessageStore` from `palaver-core` using sqlx with split
//! read/write pools. Messages are ordered by their autoincrement id, which
//! is the order the queue consumers wrote them.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;

use palaver_core::repository::MessageStore;
use palaver_types::chat::{ConversationMessage, SessionRecord};
use palaver_types::error::RepositoryError;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `MessageStore`.
#[derive(Clone)]
pub struct SqliteMessageStore {
    pool: DatabasePool,
}

impl SqliteMessageStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Private Row types for SQLite-to-domain mapping
// ---------------------------------------------------------------------------

struct MessageRow {
    session_id: String,
    username: String,
    content: String,
    is_user: bool,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            session_id: row.try_get("session_id")?,
            username: row.try_get("username")?,
            content: row.try_get("content")?,
            is_user: row.try_get("is_user")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_message(self) -> Result<ConversationMessage, RepositoryError> {
        Ok(ConversationMessage {
            session_id: self.session_id,
            content: self.content,
            username: self.username,
            is_user: self.is_user,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

struct SessionRow {
    id: String,
    username: String,
    title: String,
    created_at: String,
}

impl SessionRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            title: row.try_get("title")?,
            created_at: row.try_get("created_at")?,
        })
    }

    fn into_record(self) -> Result<SessionRecord, RepositoryError> {
        Ok(SessionRecord {
            id: self.id,
            username: self.username,
            title: self.title,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

/// Fixed-width so that text ordering matches time ordering.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn map_messages(rows: Vec<sqlx::sqlite::SqliteRow>) -> Result<Vec<ConversationMessage>, RepositoryError> {
    rows.iter()
        .map(|row| {
            MessageRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_message()
        })
        .collect()
}

// ---------------------------------------------------------------------------
// MessageStore implementation
// ---------------------------------------------------------------------------

impl MessageStore for SqliteMessageStore {
    async fn insert_message(&self, message: &ConversationMessage) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"INSERT INTO messages (session_id, username, content, is_user, created_at)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(&message.session_id)
        .bind(&message.username)
        .bind(&message.content)
        .bind(message.is_user)
        .bind(format_datetime(&message.created_at))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(())
    }

    async fn find_messages_by_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM messages WHERE session_id = ? ORDER BY id ASC")
            .bind(session_id)
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        map_messages(rows)
    }

    async fn find_all_messages(&self) -> Result<Vec<ConversationMessage>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM messages ORDER BY id ASC")
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        map_messages(rows)
    }

    async fn insert_session(&self, session: &SessionRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO sessions (id, username, title, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.username)
        .bind(&session.title)
        .bind(format_datetime(&session.created_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE") => {
                Err(RepositoryError::Conflict(format!(
                    "session {} already exists",
                    session.id
                )))
            }
            Err(e) => Err(RepositoryError::Query(e.to_string())),
        }
    }

    async fn find_session(&self, session_id: &str) -> Result<Option<SessionRecord>, RepositoryError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match row {
            Some(row) => {
                let session_row =
                    SessionRow::from_row(&row).map_err(|e| RepositoryError::Query(e.to_string()))?;
                Ok(Some(session_row.into_record()?))
            }
            None => Ok(None),
        }
    }

    async fn find_sessions_by_user(&self, username: &str) -> Result<Vec<SessionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM sessions WHERE username = ? ORDER BY created_at DESC, rowid DESC",
        )
        .bind(username)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        rows.iter()
            .map(|row| {
                SessionRow::from_row(row)
                    .map_err(|e| RepositoryError::Query(e.to_string()))?
                    .into_record()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn test_pool() -> DatabasePool {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        // Leak tempdir so it lives for the test
        std::mem::forget(dir);
        DatabasePool::new(&url).await.unwrap()
    }

    fn session(id: &str, username: &str, created_at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            id: id.to_string(),
            username: username.to_string(),
            title: format!("title of {id}"),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_insert_and_find_messages_in_order() {
        let store = SqliteMessageStore::new(test_pool().await);
        for (sid, content, is_user) in [("a", "q1", true), ("b", "other", true), ("a", "r1", false)] {
            store
                .insert_message(&ConversationMessage::new(sid, content, "alice", is_user))
                .await
                .unwrap();
        }

        let a = store.find_messages_by_session("a").await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].content, "q1");
        assert!(a[0].is_user);
        assert_eq!(a[1].content, "r1");
        assert!(!a[1].is_user);
        assert_eq!(a[1].username, "alice");

        let all: Vec<_> = store
            .find_all_messages()
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(all, vec!["q1", "other", "r1"]);
        assert!(store.find_messages_by_session("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_timestamp_survives_storage() {
        let store = SqliteMessageStore::new(test_pool().await);
        let msg = ConversationMessage::new("a", "hello", "alice", true);
        store.insert_message(&msg).await.unwrap();

        let stored = &store.find_messages_by_session("a").await.unwrap()[0];
        let drift = (stored.created_at - msg.created_at).num_microseconds().unwrap();
        assert!(drift.abs() <= 1, "drift {drift}us");
    }

    #[tokio::test]
    async fn test_sessions_newest_first() {
        let store = SqliteMessageStore::new(test_pool().await);
        let now = Utc::now();
        store
            .insert_session(&session("s1", "alice", now - Duration::minutes(10)))
            .await
            .unwrap();
        store.insert_session(&session("s2", "alice", now)).await.unwrap();
        store
            .insert_session(&session("s3", "bob", now - Duration::minutes(1)))
            .await
            .unwrap();

        let ids: Vec<_> = store
            .find_sessions_by_user("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["s2", "s1"]);
        assert!(store.find_sessions_by_user("carol").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_session_is_conflict() {
        let store = SqliteMessageStore::new(test_pool().await);
        let record = session("s1", "alice", Utc::now());
        store.insert_session(&record).await.unwrap();
        let err = store.insert_session(&record).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_find_session() {
        let store = SqliteMessageStore::new(test_pool().await);
        store
            .insert_session(&session("s1", "alice", Utc::now()))
            .await
            .unwrap();
        let found = store.find_session("s1").await.unwrap().unwrap();
        assert_eq!(found.username, "alice");
        assert_eq!(found.title, "title of s1");
        assert!(store.find_session("nope").await.unwrap().is_none());
    }

    #[test]
    fn test_format_datetime_is_fixed_width() {
        let a = format_datetime(&"2026-01-01T00:00:00Z".parse().unwrap());
        let b = format_datetime(&"2026-01-01T00:00:00.123456Z".parse().unwrap());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_datetime(&b).unwrap().timestamp_subsec_micros(), 123456);
    }
}
