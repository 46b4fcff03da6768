//! Concurrency-safe directory of live conversation sessions.
//!
//! Two-level map `username -> session_id -> session` behind a single
//! registry lock. Creation holds the write lock across the existence check
//! and the backend construction, so concurrent callers for one key observe
//! exactly one session. Session buffer locks are never taken while the
//! registry lock is held.
//!
//! The directory is bounded: beyond `max_sessions` the least recently used
//! session is evicted, and a sweeper evicts sessions idle longer than the
//! configured TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use palaver_types::backend::BackendConfig;
use palaver_types::config::RegistryConfig;
use palaver_types::error::GatewayError;

use crate::llm::factory::BackendFactory;
use crate::persist::BoxMessagePersister;

use super::conversation::ConversationSession;

/// Size and idle bounds for the registry.
#[derive(Debug, Clone)]
pub struct RegistryLimits {
    pub max_sessions: usize,
    pub idle_ttl: Option<Duration>,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self::from(&RegistryConfig::default())
    }
}

impl From<&RegistryConfig> for RegistryLimits {
    fn from(config: &RegistryConfig) -> Self {
        Self {
            max_sessions: config.max_sessions.max(1),
            idle_ttl: (config.idle_ttl_secs > 0).then(|| Duration::from_secs(config.idle_ttl_secs)),
        }
    }
}

struct RegistryEntry {
    session: Arc<ConversationSession>,
    /// Milliseconds since the registry epoch at last access.
    last_access: AtomicU64,
}

type UserSessions = HashMap<String, RegistryEntry>;

pub struct SessionRegistry {
    factory: Arc<BackendFactory>,
    persister: Arc<BoxMessagePersister>,
    limits: RegistryLimits,
    epoch: Instant,
    users: RwLock<HashMap<String, UserSessions>>,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<BackendFactory>,
        persister: Arc<BoxMessagePersister>,
        limits: RegistryLimits,
    ) -> Self {
        Self {
            factory,
            persister,
            limits,
            epoch: Instant::now(),
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn factory(&self) -> &Arc<BackendFactory> {
        &self.factory
    }

    /// Return the session for `(username, session_id)`, creating it with
    /// the `model_type` backend if absent.
    ///
    /// The factory is not consulted when the session already exists. A
    /// construction failure leaves the registry unchanged.
    pub async fn get_or_create(
        &self,
        username: &str,
        session_id: &str,
        model_type: &str,
        config: &BackendConfig,
    ) -> Result<Arc<ConversationSession>, GatewayError> {
        validate_key(username, session_id)?;

        let mut users = self.users.write().await;
        if let Some(live) = self.touch(&users, username, session_id) {
            return Ok(live);
        }

        let session = self.build_session(session_id, model_type, config)?;
        Ok(self.insert_locked(&mut users, username, session))
    }

    /// Build a session bound to a `model_type` backend without registering
    /// it. Callers seed it privately, then publish it with
    /// [`insert_if_absent`](Self::insert_if_absent).
    pub fn build_session(
        &self,
        session_id: &str,
        model_type: &str,
        config: &BackendConfig,
    ) -> Result<ConversationSession, GatewayError> {
        self.factory
            .create_session(model_type, session_id, config, self.persister.clone())
    }

    /// Register a built session under `username` unless one is already live
    /// for its id, in which case the live one is returned and `session` is
    /// dropped.
    pub async fn insert_if_absent(
        &self,
        username: &str,
        session: ConversationSession,
    ) -> Result<Arc<ConversationSession>, GatewayError> {
        validate_key(username, session.session_id())?;

        let mut users = self.users.write().await;
        if let Some(live) = self.touch(&users, username, session.session_id()) {
            return Ok(live);
        }
        Ok(self.insert_locked(&mut users, username, session))
    }

    /// Look up a live session.
    pub async fn get(&self, username: &str, session_id: &str) -> Option<Arc<ConversationSession>> {
        let users = self.users.read().await;
        self.touch(&users, username, session_id)
    }

    /// Remove a session. The user's bucket is dropped once empty.
    pub async fn remove(&self, username: &str, session_id: &str) -> Option<Arc<ConversationSession>> {
        let mut users = self.users.write().await;
        remove_entry(&mut users, username, session_id)
    }

    /// Ids of the user's live sessions, sorted.
    pub async fn list_session_ids(&self, username: &str) -> Vec<String> {
        let users = self.users.read().await;
        let mut ids: Vec<String> = users
            .get(username)
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Total number of live sessions.
    pub async fn len(&self) -> usize {
        self.users.read().await.values().map(HashMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of users with at least one live session.
    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Evict sessions idle longer than the TTL. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let Some(ttl) = self.limits.idle_ttl else {
            return 0;
        };
        let cutoff = self.now_ms().saturating_sub(ttl.as_millis() as u64);

        let mut users = self.users.write().await;
        let stale: Vec<(String, String)> = users
            .iter()
            .flat_map(|(user, sessions)| {
                sessions
                    .iter()
                    .filter(|(_, e)| e.last_access.load(Ordering::Relaxed) < cutoff)
                    .map(move |(sid, _)| (user.clone(), sid.clone()))
            })
            .collect();

        for (user, sid) in &stale {
            remove_entry(&mut users, user, sid);
            debug!(username = %user, session_id = %sid, "idle session evicted");
        }
        stale.len()
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until `cancel` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = self.evict_idle().await;
                        if evicted > 0 {
                            info!(evicted, "session sweeper evicted idle sessions");
                        }
                    }
                }
            }
        })
    }

    /// Evict least recently used sessions until within capacity, never
    /// evicting the entry that was just inserted.
    fn enforce_capacity(&self, users: &mut HashMap<String, UserSessions>, keep_user: &str, keep_sid: &str) {
        let mut total: usize = users.values().map(HashMap::len).sum();
        while total > self.limits.max_sessions {
            let victim = users
                .iter()
                .flat_map(|(user, sessions)| {
                    sessions.iter().map(move |(sid, e)| {
                        (e.last_access.load(Ordering::Relaxed), user.as_str(), sid.as_str())
                    })
                })
                .filter(|(_, user, sid)| !(*user == keep_user && *sid == keep_sid))
                .min_by_key(|(at, _, _)| *at)
                .map(|(_, user, sid)| (user.to_string(), sid.to_string()));

            let Some((user, sid)) = victim else { break };
            remove_entry(users, &user, &sid);
            debug!(username = %user, session_id = %sid, "session evicted at capacity");
            total -= 1;
        }
    }

    fn touch(
        &self,
        users: &HashMap<String, UserSessions>,
        username: &str,
        session_id: &str,
    ) -> Option<Arc<ConversationSession>> {
        let entry = users.get(username)?.get(session_id)?;
        entry.last_access.store(self.now_ms(), Ordering::Relaxed);
        Some(entry.session.clone())
    }

    fn insert_locked(
        &self,
        users: &mut HashMap<String, UserSessions>,
        username: &str,
        session: ConversationSession,
    ) -> Arc<ConversationSession> {
        let session = Arc::new(session);
        let session_id = session.session_id().to_string();
        users.entry(username.to_string()).or_default().insert(
            session_id.clone(),
            RegistryEntry {
                session: session.clone(),
                last_access: AtomicU64::new(self.now_ms()),
            },
        );
        self.enforce_capacity(users, username, &session_id);
        session
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

fn validate_key(username: &str, session_id: &str) -> Result<(), GatewayError> {
    if username.is_empty() || session_id.is_empty() {
        return Err(GatewayError::Validation(
            "username and session id are required".to_string(),
        ));
    }
    Ok(())
}

fn remove_entry(
    users: &mut HashMap<String, UserSessions>,
    username: &str,
    session_id: &str,
) -> Option<Arc<ConversationSession>> {
    let sessions = users.get_mut(username)?;
    let removed = sessions.remove(session_id).map(|e| e.session);
    if sessions.is_empty() {
        users.remove(username);
    }
    removed
}
