//! One conversation: its ordered message buffer, bound backend and
//! persistence capability, and the streaming response algorithm.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use palaver_types::chat::ConversationMessage;
use palaver_types::error::GatewayError;
use palaver_types::llm::{CompletionRequest, LlmError, StreamEvent};
use palaver_types::persistence::PersistenceEvent;

use crate::llm::box_provider::BoxLlmProvider;
use crate::persist::BoxMessagePersister;

use super::sink::{ChunkSink, SinkError};

/// Per-(user, conversation) state.
///
/// The buffer lock makes each append and snapshot atomic. Two concurrent
/// [`stream_response`](Self::stream_response) calls on the same session may
/// interleave their question/answer pairs.
pub struct ConversationSession {
    session_id: String,
    model_type: String,
    backend: BoxLlmProvider,
    persister: Arc<BoxMessagePersister>,
    messages: RwLock<Vec<ConversationMessage>>,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("session_id", &self.session_id)
            .field("model_type", &self.model_type)
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

impl ConversationSession {
    pub fn new(
        session_id: impl Into<String>,
        model_type: impl Into<String>,
        backend: BoxLlmProvider,
        persister: Arc<BoxMessagePersister>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            model_type: model_type.into(),
            backend,
            persister,
            messages: RwLock::new(Vec::with_capacity(20)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    pub fn backend(&self) -> &BoxLlmProvider {
        &self.backend
    }

    /// Append a message and, if `persist` is set, hand it to the persister.
    ///
    /// The append always succeeds. Persistence failures are logged and
    /// swallowed; the buffer lock is released before persisting.
    pub async fn add_message(
        &self,
        content: impl Into<String>,
        username: &str,
        is_user: bool,
        persist: bool,
    ) -> ConversationMessage {
        let message = ConversationMessage::new(&self.session_id, content, username, is_user);
        self.messages.write().await.push(message.clone());

        if persist {
            let event = PersistenceEvent::from(&message);
            if let Err(e) = self.persister.persist(&event).await {
                warn!(
                    session_id = %self.session_id,
                    username = %username,
                    is_user,
                    error = %e,
                    "message persistence failed"
                );
            }
        }

        message
    }

    /// Copy of the buffer, oldest first.
    pub async fn snapshot_messages(&self) -> Vec<ConversationMessage> {
        self.messages.read().await.clone()
    }

    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }

    /// Append the question, stream the backend reply into `sink`, and on
    /// success append the full answer.
    ///
    /// On backend failure or cancellation nothing beyond the question is
    /// appended. A sink error cancels the backend call and is reported as a
    /// model invocation error carrying [`LlmError::SinkClosed`].
    pub async fn stream_response<K: ChunkSink>(
        &self,
        username: &str,
        cancel: &CancellationToken,
        sink: &mut K,
        question: &str,
    ) -> Result<ConversationMessage, GatewayError> {
        self.add_message(question, username, true, true).await;

        let prompt = self
            .snapshot_messages()
            .await
            .iter()
            .map(ConversationMessage::to_prompt_message)
            .collect();
        let request = CompletionRequest::from_messages(prompt);

        let call = cancel.child_token();
        let mut stream = self.backend.stream(request, call.clone());
        let mut answer = String::new();

        while let Some(event) = stream.next().await {
            match event {
                Ok(StreamEvent::TextDelta { text }) => {
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = deliver(sink, &text).await {
                        call.cancel();
                        return Err(self.invocation_failed(username, LlmError::SinkClosed(e.to_string())));
                    }
                    answer.push_str(&text);
                }
                Ok(StreamEvent::Done) => break,
                Ok(_) => {}
                Err(e) => {
                    call.cancel();
                    return Err(self.invocation_failed(username, e));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(self.invocation_failed(username, LlmError::Cancelled));
        }

        debug!(
            session_id = %self.session_id,
            answer_len = answer.len(),
            "backend reply complete"
        );

        Ok(self.add_message(answer, username, false, true).await)
    }

    fn invocation_failed(&self, username: &str, source: LlmError) -> GatewayError {
        match source {
            LlmError::Cancelled | LlmError::SinkClosed(_) => warn!(
                session_id = %self.session_id,
                username = %username,
                model_type = %self.model_type,
                reason = %source,
                "reply stream abandoned"
            ),
            _ => error!(
                session_id = %self.session_id,
                username = %username,
                model_type = %self.model_type,
                error = %source,
                "backend stream failed"
            ),
        }
        GatewayError::ModelInvocation {
            session_id: self.session_id.clone(),
            source,
        }
    }
}

async fn deliver<K: ChunkSink>(sink: &mut K, text: &str) -> Result<(), SinkError> {
    sink.send(text).await?;
    sink.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::llm::scripted::ScriptedProvider;
    use crate::persist::RecordingPersister;
    use crate::session::sink::{ChannelSink, StreamFrame};

    fn session_with(provider: ScriptedProvider, recorder: &RecordingPersister) -> ConversationSession {
        ConversationSession::new(
            "s-1",
            "scripted",
            BoxLlmProvider::new(provider),
            Arc::new(BoxMessagePersister::new(recorder.clone())),
        )
    }

    /// Sink that collects chunks, optionally failing after `fail_after` sends.
    #[derive(Default)]
    struct VecSink {
        chunks: Vec<String>,
        fail_after: Option<usize>,
        flushes: usize,
    }

    impl ChunkSink for VecSink {
        async fn send(&mut self, chunk: &str) -> Result<(), SinkError> {
            if self.fail_after == Some(self.chunks.len()) {
                return Err(SinkError::Write("broken pipe".to_string()));
            }
            self.chunks.push(chunk.to_string());
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), SinkError> {
            self.flushes += 1;
            Ok(())
        }

        async fn finish(&mut self) -> Result<(), SinkError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_snapshot_preserves_append_order() {
        let recorder = RecordingPersister::new();
        let session = session_with(ScriptedProvider::new(["x"]), &recorder);

        for i in 0..50 {
            session
                .add_message(format!("m{i}"), "alice", i % 2 == 0, false)
                .await;
        }

        let snapshot = session.snapshot_messages().await;
        assert_eq!(snapshot.len(), 50);
        for (i, msg) in snapshot.iter().enumerate() {
            assert_eq!(msg.content, format!("m{i}"));
            assert_eq!(msg.is_user, i % 2 == 0);
        }
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_does_not_fail_append() {
        let recorder = RecordingPersister::new();
        recorder.set_failing(true);
        let session = session_with(ScriptedProvider::new(["x"]), &recorder);

        let msg = session.add_message("hello", "alice", true, true).await;
        assert_eq!(msg.content, "hello");
        assert_eq!(session.message_count().await, 1);
    }

    #[tokio::test]
    async fn test_stream_response_success() {
        let recorder = RecordingPersister::new();
        let provider = ScriptedProvider::new(["Hel", "lo", "!"]);
        let session = session_with(provider.clone(), &recorder);
        let mut sink = VecSink::default();

        let answer = session
            .stream_response("alice", &CancellationToken::new(), &mut sink, "Hi")
            .await
            .unwrap();

        assert_eq!(answer.content, "Hello!");
        assert!(!answer.is_user);
        assert_eq!(sink.chunks, vec!["Hel", "lo", "!"]);
        assert_eq!(sink.flushes, 3);

        let buffer = session.snapshot_messages().await;
        assert_eq!(buffer.len(), 2);
        assert!(buffer[0].is_user);
        assert_eq!(buffer[0].content, "Hi");
        assert_eq!(buffer[1].content, "Hello!");

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].is_user);
        assert!(!events[1].is_user);
        assert_eq!(events[1].content, "Hello!");

        // The question was part of the prompt.
        assert_eq!(provider.prompt_sizes(), vec![1]);
    }

    #[tokio::test]
    async fn test_prompt_includes_history() {
        let recorder = RecordingPersister::new();
        let provider = ScriptedProvider::new(["ok"]);
        let session = session_with(provider.clone(), &recorder);
        let cancel = CancellationToken::new();

        session
            .stream_response("alice", &cancel, &mut VecSink::default(), "one")
            .await
            .unwrap();
        session
            .stream_response("alice", &cancel, &mut VecSink::default(), "two")
            .await
            .unwrap();

        assert_eq!(provider.prompt_sizes(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_backend_failure_appends_only_question() {
        let recorder = RecordingPersister::new();
        let session = session_with(ScriptedProvider::new(["a", "b", "c"]).failing_after(2), &recorder);
        session.add_message("earlier", "alice", true, false).await;
        let before = session.message_count().await;

        let mut sink = VecSink::default();
        let err = session
            .stream_response("alice", &CancellationToken::new(), &mut sink, "q")
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::ModelInvocation { .. }));
        assert!(!err.is_cancellation());
        assert_eq!(session.message_count().await, before + 1);
        // Chunks already sent are not retracted.
        assert_eq!(sink.chunks, vec!["a", "b"]);
        // Only the question was persisted.
        assert_eq!(recorder.events().len(), 1);
        assert!(recorder.events()[0].is_user);
    }

    #[tokio::test]
    async fn test_sink_failure_stops_backend() {
        let recorder = RecordingPersister::new();
        let provider = ScriptedProvider::new((0..100).map(|i| i.to_string()));
        let session = session_with(provider.clone(), &recorder);
        let mut sink = VecSink {
            fail_after: Some(2),
            ..Default::default()
        };

        let err = session
            .stream_response("alice", &CancellationToken::new(), &mut sink, "q")
            .await
            .unwrap_err();

        assert!(err.is_cancellation());
        assert_eq!(session.message_count().await, 1);
        assert!(provider.produced() <= 3, "backend kept producing after sink closed");
    }

    #[tokio::test]
    async fn test_cancellation_stops_stream_promptly() {
        let recorder = RecordingPersister::new();
        let provider = ScriptedProvider::new((0..1000).map(|i| i.to_string()))
            .with_delay(Duration::from_millis(10));
        let session = Arc::new(session_with(provider.clone(), &recorder));
        let cancel = CancellationToken::new();
        let (mut sink, mut rx) = ChannelSink::channel(1024);

        let task = {
            let session = session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                session
                    .stream_response("alice", &cancel, &mut sink, "q")
                    .await
            })
        };

        // Wait for the first chunk, then cancel.
        assert!(matches!(rx.recv().await, Some(StreamFrame::Chunk(_))));
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("stream_response should return promptly")
            .unwrap();
        assert!(matches!(
            result,
            Err(GatewayError::ModelInvocation {
                source: LlmError::Cancelled,
                ..
            })
        ));
        assert_eq!(session.message_count().await, 1);
        assert!(provider.produced() < 1000);
    }
}
