//! Conversation message and session record types for Palaver.
//!
//! A conversation is keyed by `(username, session_id)`. Messages are
//! append-only: once created they are never mutated or removed, and their
//! position in a session's buffer is the conversation order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::{Message, MessageRole};

/// Title used when the opening question is blank.
pub const DEFAULT_SESSION_TITLE: &str = "New chat";

/// Titles longer than this many characters are truncated.
const MAX_TITLE_CHARS: usize = 80;

/// Number of characters kept before the ellipsis on truncation.
const TRUNCATED_TITLE_CHARS: usize = 77;

/// A single message within a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub content: String,
    pub username: String,
    pub is_user: bool,
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// Create a message stamped with the current time.
    pub fn new(
        session_id: impl Into<String>,
        content: impl Into<String>,
        username: impl Into<String>,
        is_user: bool,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            content: content.into(),
            username: username.into(),
            is_user,
            created_at: Utc::now(),
        }
    }

    /// Project this message onto the backend prompt format.
    pub fn to_prompt_message(&self) -> Message {
        Message {
            role: if self.is_user {
                MessageRole::User
            } else {
                MessageRole::Assistant
            },
            content: self.content.clone(),
        }
    }
}

/// Durable record of a conversation, created when a user starts a new chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub username: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

/// Entry in a user's session listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub title: String,
}

impl From<SessionRecord> for SessionSummary {
    fn from(record: SessionRecord) -> Self {
        Self {
            session_id: record.id,
            title: record.title,
        }
    }
}

/// One turn of chat history as returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub is_user: bool,
    pub content: String,
}

impl From<&ConversationMessage> for HistoryEntry {
    fn from(msg: &ConversationMessage) -> Self {
        Self {
            is_user: msg.is_user,
            content: msg.content.clone(),
        }
    }
}

/// Derive a session title from the opening question.
///
/// Blank questions get [`DEFAULT_SESSION_TITLE`]. Questions longer than 80
/// characters keep their first 77 characters followed by `...`.
pub fn session_title(question: &str) -> String {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return DEFAULT_SESSION_TITLE.to_string();
    }
    if trimmed.chars().count() > MAX_TITLE_CHARS {
        let mut title: String = trimmed.chars().take(TRUNCATED_TITLE_CHARS).collect();
        title.push_str("...");
        title
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_title_trims_whitespace() {
        assert_eq!(session_title("  Hello there \n"), "Hello there");
    }

    #[test]
    fn test_title_blank_uses_default() {
        assert_eq!(session_title("   "), DEFAULT_SESSION_TITLE);
        assert_eq!(session_title(""), DEFAULT_SESSION_TITLE);
    }

    #[test]
    fn test_title_at_limit_is_kept() {
        let q = "a".repeat(80);
        assert_eq!(session_title(&q), q);
    }

    #[test]
    fn test_title_over_limit_is_truncated() {
        let q = "b".repeat(81);
        let title = session_title(&q);
        assert_eq!(title.chars().count(), 80);
        assert!(title.ends_with("..."));
        assert!(title.starts_with(&"b".repeat(77)));
    }

    #[test]
    fn test_title_truncation_respects_char_boundaries() {
        let q = "会".repeat(100);
        let title = session_title(&q);
        assert_eq!(title.chars().count(), 80);
        assert!(title.starts_with(&"会".repeat(77)));
    }

    #[test]
    fn test_message_prompt_role() {
        let user = ConversationMessage::new("s1", "hi", "alice", true);
        let bot = ConversationMessage::new("s1", "hello", "alice", false);
        assert_eq!(user.to_prompt_message().role, MessageRole::User);
        assert_eq!(bot.to_prompt_message().role, MessageRole::Assistant);
        assert_eq!(bot.to_prompt_message().content, "hello");
    }

    #[test]
    fn test_message_serializes_camel_case() {
        let msg = ConversationMessage::new("s1", "hi", "alice", true);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["sessionID"], "s1");
        assert_eq!(json["isUser"], true);
        assert!(json.get("createdAt").is_some());
    }

    #[test]
    fn test_summary_from_record() {
        let record = SessionRecord {
            id: "abc".to_string(),
            username: "alice".to_string(),
            title: "Hi".to_string(),
            created_at: Utc::now(),
        };
        let summary = SessionSummary::from(record);
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["sessionId"], "abc");
        assert_eq!(json["title"], "Hi");
    }
}
