use thiserror::Error;

use crate::llm::LlmError;

/// Gateway error taxonomy surfaced by the conversation core.
///
/// Every variant that reaches the HTTP boundary is mapped to a fixed
/// response code there; raw messages of internal failures never leak.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or missing request fields. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// No backend constructor is registered for this tag.
    #[error("unsupported model type: {0}")]
    UnsupportedModelType(String),

    /// The backend constructor rejected its configuration.
    #[error("backend config error ({tag}): {message}")]
    BackendConfig { tag: String, message: String },

    /// The backend call failed or was cancelled mid-stream.
    #[error("model invocation failed for session {session_id}: {source}")]
    ModelInvocation {
        session_id: String,
        #[source]
        source: LlmError,
    },

    /// Publishing to the queue or writing to storage failed.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl GatewayError {
    /// Whether the failure was the caller going away rather than the backend.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            GatewayError::ModelInvocation {
                source: LlmError::Cancelled | LlmError::SinkClosed(_),
                ..
            }
        )
    }
}

/// Errors from repository operations (used by trait definitions in palaver-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors from the durable broker.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("acknowledgement error: {0}")]
    Ack(String),

    #[error("unsupported broker url: {0}")]
    UnsupportedUrl(String),

    #[error("circuit open, broker attempts suspended")]
    CircuitOpen,
}

impl From<QueueError> for GatewayError {
    fn from(e: QueueError) -> Self {
        GatewayError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Query("syntax error".to_string());
        assert_eq!(err.to_string(), "query error: syntax error");
    }

    #[test]
    fn test_unsupported_model_display() {
        let err = GatewayError::UnsupportedModelType("unknown-x".to_string());
        assert_eq!(err.to_string(), "unsupported model type: unknown-x");
    }

    #[test]
    fn test_cancellation_classification() {
        let cancelled = GatewayError::ModelInvocation {
            session_id: "s".to_string(),
            source: LlmError::Cancelled,
        };
        let failed = GatewayError::ModelInvocation {
            session_id: "s".to_string(),
            source: LlmError::Stream("reset".to_string()),
        };
        assert!(cancelled.is_cancellation());
        assert!(!failed.is_cancellation());
    }

    #[test]
    fn test_queue_error_becomes_persistence_error() {
        let err: GatewayError = QueueError::Publish("nack".to_string()).into();
        assert!(matches!(err, GatewayError::Persistence(_)));
    }
}
