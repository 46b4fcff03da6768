//! Chat service: the request-level orchestration above the registry.
//!
//! ChatService coordinates the SessionRegistry and the MessageStore to
//! manage the conversation lifecycle: starting sessions with a durable
//! record, streaming replies into live sessions, resuming sessions that
//! are no longer live, reading history, and rehydrating at startup.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use palaver_types::backend::BackendConfig;
use palaver_types::chat::{
    ConversationMessage, HistoryEntry, SessionRecord, SessionSummary, session_title,
};
use palaver_types::error::GatewayError;
use palaver_types::llm::LlmError;

use crate::repository::MessageStore;
use crate::session::conversation::ConversationSession;
use crate::session::registry::SessionRegistry;
use crate::session::sink::ChunkSink;

/// One chat turn as requested by a client.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub username: String,
    pub question: String,
    /// Backend tag; the configured default when absent.
    pub model_type: Option<String>,
    /// Existing conversation; a new one is started when absent.
    pub session_id: Option<String>,
}

/// Result of a completed chat turn.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub session_id: String,
    pub created: bool,
    pub answer: ConversationMessage,
}

/// Orchestrates chat sessions over a registry and a message store.
///
/// Generic over `MessageStore` to maintain clean architecture
/// (palaver-core never depends on palaver-infra).
pub struct ChatService<S: MessageStore> {
    registry: Arc<SessionRegistry>,
    store: Arc<S>,
    backends: HashMap<String, BackendConfig>,
    default_model_type: String,
    /// Serializes resumption of sessions that are not live, so history is
    /// replayed into a fresh session exactly once.
    resume: Mutex<()>,
}

impl<S: MessageStore> ChatService<S> {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<S>,
        backends: HashMap<String, BackendConfig>,
        default_model_type: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            store,
            backends,
            default_model_type: default_model_type.into(),
            resume: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn default_model_type(&self) -> &str {
        &self.default_model_type
    }

    fn backend_config(&self, tag: &str) -> BackendConfig {
        self.backends.get(tag).cloned().unwrap_or_default()
    }

    // --- Startup ---

    /// Replay every stored message into fresh sessions.
    ///
    /// Messages are grouped by `(username, session_id)` in stored order and
    /// appended without persisting. A session whose backend cannot be built
    /// is skipped with a warning. Returns the number of sessions restored.
    pub async fn restore_sessions(&self) -> Result<usize, GatewayError> {
        let messages = self.store.find_all_messages().await?;

        let mut order: Vec<(String, String)> = Vec::new();
        let mut groups: HashMap<(String, String), Vec<ConversationMessage>> = HashMap::new();
        for msg in messages {
            let key = (msg.username.clone(), msg.session_id.clone());
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    Vec::new()
                })
                .push(msg);
        }

        let tag = self.default_model_type.clone();
        let config = self.backend_config(&tag);
        let mut restored = 0;

        for key in order {
            let Some(history) = groups.remove(&key) else {
                continue;
            };
            let (username, session_id) = key;
            match self
                .seed_session(&username, &session_id, &tag, &config, history)
                .await
            {
                Ok(_) => restored += 1,
                Err(e) => warn!(
                    username = %username,
                    session_id = %session_id,
                    error = %e,
                    "skipping session restore"
                ),
            }
        }

        info!(sessions = restored, "sessions restored from storage");
        Ok(restored)
    }

    // --- Sessions ---

    /// Start a conversation: build its backend, write the durable record,
    /// then register the session.
    ///
    /// Nothing is stored or registered when the backend cannot be built.
    pub async fn start_session(
        &self,
        username: &str,
        question: &str,
        model_type: &str,
        config: &BackendConfig,
    ) -> Result<Arc<ConversationSession>, GatewayError> {
        let session_id = Uuid::now_v7().to_string();
        let session = self.registry.build_session(&session_id, model_type, config)?;

        let record = SessionRecord {
            id: session_id,
            username: username.to_string(),
            title: session_title(question),
            created_at: Utc::now(),
        };
        self.store.insert_session(&record).await?;
        info!(username = %username, session_id = %record.id, model_type = %model_type, "session started");

        self.registry.insert_if_absent(username, session).await
    }

    /// The user's conversations from storage, newest first.
    pub async fn list_sessions(&self, username: &str) -> Result<Vec<SessionSummary>, GatewayError> {
        require(username, "username")?;
        let records = self.store.find_sessions_by_user(username).await?;
        Ok(records.into_iter().map(SessionSummary::from).collect())
    }

    /// Ordered `{isUser, content}` history of a conversation.
    ///
    /// Served from the live session when there is one, otherwise from
    /// storage.
    pub async fn history(
        &self,
        username: &str,
        session_id: &str,
    ) -> Result<Vec<HistoryEntry>, GatewayError> {
        require(username, "username")?;
        require(session_id, "sessionId")?;

        if let Some(session) = self.registry.get(username, session_id).await {
            let messages = session.snapshot_messages().await;
            return Ok(messages.iter().map(HistoryEntry::from).collect());
        }

        let stored = self.stored_history(username, session_id).await?;
        if stored.is_empty() {
            return Err(GatewayError::SessionNotFound(session_id.to_string()));
        }
        Ok(stored.iter().map(HistoryEntry::from).collect())
    }

    async fn stored_history(
        &self,
        username: &str,
        session_id: &str,
    ) -> Result<Vec<ConversationMessage>, GatewayError> {
        Ok(self
            .store
            .find_messages_by_session(session_id)
            .await?
            .into_iter()
            .filter(|m| m.username == username)
            .collect())
    }

    // --- Streaming ---

    /// Run one chat turn, streaming the reply into `sink`.
    ///
    /// Without a session id a new session is started (and announced on the
    /// sink) before the backend is called. The terminal marker is written
    /// only on success; on failure the caller reports the error on its
    /// transport.
    pub async fn stream_chat<K: ChunkSink>(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
        sink: &mut K,
    ) -> Result<ChatOutcome, GatewayError> {
        require(&request.username, "username")?;
        require(&request.question, "question")?;
        let username = request.username.as_str();
        let tag = request
            .model_type
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(self.default_model_type.as_str())
            .to_string();
        let config = self.backend_config(&tag);

        let (session, created) = match request.session_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => (self.resume_session(username, id, &tag, &config).await?, false),
            Some(_) => {
                return Err(GatewayError::Validation("sessionId must not be blank".to_string()));
            }
            None => (self.start_session(username, &request.question, &tag, &config).await?, true),
        };

        let session_id = session.session_id().to_string();
        if created {
            sink.announce_session(&session_id).await.map_err(|e| {
                GatewayError::ModelInvocation {
                    session_id: session_id.clone(),
                    source: LlmError::SinkClosed(e.to_string()),
                }
            })?;
        }

        let answer = session
            .stream_response(username, cancel, sink, &request.question)
            .await?;

        if let Err(e) = sink.finish().await {
            debug!(session_id = %session_id, error = %e, "client gone before terminal marker");
        }

        Ok(ChatOutcome {
            session_id,
            created,
            answer,
        })
    }

    /// Live session for `session_id`, or a fresh one seeded with the stored
    /// history when it is no longer live.
    async fn resume_session(
        &self,
        username: &str,
        session_id: &str,
        tag: &str,
        config: &BackendConfig,
    ) -> Result<Arc<ConversationSession>, GatewayError> {
        if let Some(session) = self.registry.get(username, session_id).await {
            return Ok(session);
        }

        let _guard = self.resume.lock().await;
        if let Some(session) = self.registry.get(username, session_id).await {
            return Ok(session);
        }

        let history = match self.stored_history(username, session_id).await {
            Ok(history) => history,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "stored history unavailable, resuming empty");
                Vec::new()
            }
        };
        if !history.is_empty() {
            debug!(session_id = %session_id, messages = history.len(), "session resumed from storage");
        }
        self.seed_session(username, session_id, tag, config, history).await
    }

    /// Build a session, replay `history` into it without persisting, and
    /// only then make it visible in the registry.
    async fn seed_session(
        &self,
        username: &str,
        session_id: &str,
        tag: &str,
        config: &BackendConfig,
        history: Vec<ConversationMessage>,
    ) -> Result<Arc<ConversationSession>, GatewayError> {
        let session = self.registry.build_session(session_id, tag, config)?;
        for msg in history {
            session.add_message(msg.content, username, msg.is_user, false).await;
        }
        self.registry.insert_if_absent(username, session).await
    }
}

fn require(value: &str, field: &str) -> Result<(), GatewayError> {
    if value.trim().is_empty() {
        return Err(GatewayError::Validation(format!("{field} is required")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::box_provider::BoxLlmProvider;
    use crate::llm::factory::BackendFactory;
    use crate::llm::scripted::ScriptedProvider;
    use crate::persist::{BoxMessagePersister, RecordingPersister};
    use crate::repository::InMemoryMessageStore;
    use crate::session::registry::RegistryLimits;
    use crate::session::sink::{ChannelSink, StreamFrame};

    struct Harness {
        service: ChatService<InMemoryMessageStore>,
        store: InMemoryMessageStore,
        recorder: RecordingPersister,
    }

    fn harness(limits: RegistryLimits) -> Harness {
        let factory = BackendFactory::new();
        factory.register_backend("openai", |_: &BackendConfig| {
            Ok(BoxLlmProvider::new(ScriptedProvider::new(["Hel", "lo"])))
        });
        factory.register_backend("broken", |_: &BackendConfig| {
            Ok(BoxLlmProvider::new(ScriptedProvider::new(["x"]).failing_after(0)))
        });
        factory.register_backend("needs-key", |config: &BackendConfig| {
            config.require("needs-key", "api_key")?;
            Ok(BoxLlmProvider::new(ScriptedProvider::new(["x"])))
        });

        let recorder = RecordingPersister::new();
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(factory),
            Arc::new(BoxMessagePersister::new(recorder.clone())),
            limits,
        ));
        let store = InMemoryMessageStore::new();
        let service = ChatService::new(registry, Arc::new(store.clone()), HashMap::new(), "openai");
        Harness {
            service,
            store,
            recorder,
        }
    }

    fn request(question: &str, model_type: &str, session_id: Option<&str>) -> ChatRequest {
        ChatRequest {
            username: "alice".to_string(),
            question: question.to_string(),
            model_type: Some(model_type.to_string()),
            session_id: session_id.map(str::to_string),
        }
    }

    async fn collect(mut rx: tokio::sync::mpsc::Receiver<StreamFrame>) -> Vec<StreamFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_new_session_streams_id_chunks_and_done() {
        let h = harness(RegistryLimits::default());
        let (mut sink, rx) = ChannelSink::channel(64);

        let outcome = h
            .service
            .stream_chat(request("Hello", "openai", None), &CancellationToken::new(), &mut sink)
            .await
            .unwrap();
        drop(sink);
        let frames = collect(rx).await;

        assert!(outcome.created);
        assert_eq!(frames[0], StreamFrame::SessionCreated(outcome.session_id.clone()));
        assert!(frames[1..frames.len() - 1]
            .iter()
            .all(|f| matches!(f, StreamFrame::Chunk(_))));
        assert!(frames.len() >= 3);
        assert_eq!(frames.last(), Some(&StreamFrame::Done));
        assert_eq!(outcome.answer.content, "Hello");

        let ids = h.service.registry().list_session_ids("alice").await;
        assert_eq!(ids, vec![outcome.session_id.clone()]);

        let sessions = h.service.list_sessions("alice").await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].title, "Hello");
        assert_eq!(h.recorder.events().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_model_type_leaves_no_trace() {
        let h = harness(RegistryLimits::default());
        let (mut sink, rx) = ChannelSink::channel(8);

        let err = h
            .service
            .stream_chat(request("Hello", "unknown-x", None), &CancellationToken::new(), &mut sink)
            .await
            .unwrap_err();
        drop(sink);

        assert!(matches!(err, GatewayError::UnsupportedModelType(ref t) if t == "unknown-x"));
        assert!(h.service.registry().is_empty().await);
        assert!(h.service.list_sessions("alice").await.unwrap().is_empty());
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_backend_config_error_leaves_no_trace() {
        let h = harness(RegistryLimits::default());
        let (mut sink, rx) = ChannelSink::channel(8);

        let err = h
            .service
            .stream_chat(request("Hello", "needs-key", None), &CancellationToken::new(), &mut sink)
            .await
            .unwrap_err();
        drop(sink);

        assert!(matches!(err, GatewayError::BackendConfig { ref tag, .. } if tag == "needs-key"));
        assert!(h.service.registry().is_empty().await);
        assert!(h.service.list_sessions("alice").await.unwrap().is_empty());
        assert!(collect(rx).await.is_empty());
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_existing_session_is_not_announced() {
        let h = harness(RegistryLimits::default());
        let cancel = CancellationToken::new();
        let (mut sink, _rx) = ChannelSink::channel(64);
        let first = h
            .service
            .stream_chat(request("one", "openai", None), &cancel, &mut sink)
            .await
            .unwrap();

        let (mut sink, rx) = ChannelSink::channel(64);
        let second = h
            .service
            .stream_chat(request("two", "openai", Some(&first.session_id)), &cancel, &mut sink)
            .await
            .unwrap();
        drop(sink);

        assert!(!second.created);
        assert_eq!(second.session_id, first.session_id);
        let frames = collect(rx).await;
        assert!(!frames.iter().any(|f| matches!(f, StreamFrame::SessionCreated(_))));

        let history = h.service.history("alice", &first.session_id).await.unwrap();
        let contents: Vec<_> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "Hello", "two", "Hello"]);
        assert!(history[0].is_user && !history[1].is_user);
    }

    #[tokio::test]
    async fn test_backend_failure_skips_done() {
        let h = harness(RegistryLimits::default());
        let (mut sink, rx) = ChannelSink::channel(64);

        let err = h
            .service
            .stream_chat(request("Hello", "broken", None), &CancellationToken::new(), &mut sink)
            .await
            .unwrap_err();
        drop(sink);

        assert!(matches!(err, GatewayError::ModelInvocation { .. }));
        let frames = collect(rx).await;
        assert!(!frames.contains(&StreamFrame::Done));
        // Only the question was recorded for persistence.
        assert_eq!(h.recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let h = harness(RegistryLimits::default());
        let cancel = CancellationToken::new();
        let (mut sink, _rx) = ChannelSink::channel(8);

        let blank_question = h
            .service
            .stream_chat(request("   ", "openai", None), &cancel, &mut sink)
            .await;
        assert!(matches!(blank_question, Err(GatewayError::Validation(_))));

        let mut no_user = request("hi", "openai", None);
        no_user.username.clear();
        let result = h.service.stream_chat(no_user, &cancel, &mut sink).await;
        assert!(matches!(result, Err(GatewayError::Validation(_))));

        let blank_id = h
            .service
            .stream_chat(request("hi", "openai", Some(" ")), &cancel, &mut sink)
            .await;
        assert!(matches!(blank_id, Err(GatewayError::Validation(_))));
    }

    #[tokio::test]
    async fn test_history_unknown_session() {
        let h = harness(RegistryLimits::default());
        let err = h.service.history("alice", "nope").await.unwrap_err();
        assert!(matches!(err, GatewayError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_restore_sessions_groups_without_republishing() {
        let h = harness(RegistryLimits::default());
        for (user, sid, content, is_user) in [
            ("alice", "s1", "q1", true),
            ("bob", "s2", "hey", true),
            ("alice", "s1", "a1", false),
            ("alice", "s1", "q2", true),
        ] {
            let msg = ConversationMessage::new(sid, content, user, is_user);
            h.store.insert_message(&msg).await.unwrap();
        }

        let restored = h.service.restore_sessions().await.unwrap();
        assert_eq!(restored, 2);

        let history = h.service.history("alice", "s1").await.unwrap();
        let contents: Vec<_> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2"]);
        assert_eq!(h.service.registry().list_session_ids("bob").await, vec!["s2"]);
        assert!(h.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_evicted_session_resumes_with_stored_history() {
        let h = harness(RegistryLimits {
            max_sessions: 1,
            idle_ttl: None,
        });
        for (content, is_user) in [("old q", true), ("old a", false)] {
            let msg = ConversationMessage::new("s-old", content, "alice", is_user);
            h.store.insert_message(&msg).await.unwrap();
        }

        let (mut sink, _rx) = ChannelSink::channel(64);
        h.service
            .stream_chat(request("next", "openai", Some("s-old")), &CancellationToken::new(), &mut sink)
            .await
            .unwrap();

        let history = h.service.history("alice", "s-old").await.unwrap();
        let contents: Vec<_> = history.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["old q", "old a", "next", "Hello"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_resumed_session_is_seeded_before_it_is_visible() {
        let h = harness(RegistryLimits::default());
        const STORED: usize = 2_000;
        for i in 0..STORED {
            let msg = ConversationMessage::new("s-old", format!("m{i}"), "alice", i % 2 == 0);
            h.store.insert_message(&msg).await.unwrap();
        }
        let service = Arc::new(h.service);

        let registry = service.registry().clone();
        let concurrent = tokio::spawn(async move {
            loop {
                if let Some(session) = registry.get("alice", "s-old").await {
                    session.add_message("concurrent", "alice", true, false).await;
                    return;
                }
                tokio::task::yield_now().await;
            }
        });

        let resumer = service.clone();
        let resumed = tokio::spawn(async move {
            let (mut sink, _rx) = ChannelSink::channel(64);
            resumer
                .stream_chat(request("next", "openai", Some("s-old")), &CancellationToken::new(), &mut sink)
                .await
        });

        resumed.await.unwrap().unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), concurrent)
            .await
            .expect("concurrent append should see the session")
            .unwrap();

        let messages = service
            .registry()
            .get("alice", "s-old")
            .await
            .unwrap()
            .snapshot_messages()
            .await;
        assert_eq!(messages.len(), STORED + 3);
        for (i, msg) in messages.iter().take(STORED).enumerate() {
            assert_eq!(msg.content, format!("m{i}"));
        }
        let position = messages.iter().position(|m| m.content == "concurrent").unwrap();
        assert!(position >= STORED, "appended inside the replayed history at {position}");
    }
}
