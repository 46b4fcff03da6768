//! Wire format for the write-behind persistence queue.
//!
//! A [`PersistenceEvent`] is the storage-agnostic projection of a
//! [`ConversationMessage`] that travels through the durable queue. Its JSON
//! field names are part of the wire contract shared with other producers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::chat::ConversationMessage;

/// A message queued for durable storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceEvent {
    pub session_id: String,
    pub content: String,
    pub username: String,
    pub is_user: bool,
}

impl PersistenceEvent {
    /// Serialize to the queue body.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a queue body. Any failure marks the delivery as poison.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Rebuild the stored message, stamped with the time it was received.
    pub fn into_message(self, received_at: DateTime<Utc>) -> ConversationMessage {
        ConversationMessage {
            session_id: self.session_id,
            content: self.content,
            username: self.username,
            is_user: self.is_user,
            created_at: received_at,
        }
    }
}

impl From<&ConversationMessage> for PersistenceEvent {
    fn from(msg: &ConversationMessage) -> Self {
        Self {
            session_id: msg.session_id.clone(),
            content: msg.content.clone(),
            username: msg.username.clone(),
            is_user: msg.is_user,
        }
    }
}
