//! Backend factory: maps a model type tag to a backend constructor.
//!
//! The factory is constructed explicitly at startup and shared by reference;
//! there is no process-wide instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use palaver_types::backend::BackendConfig;
use palaver_types::error::GatewayError;

use crate::persist::BoxMessagePersister;
use crate::session::conversation::ConversationSession;

use super::box_provider::BoxLlmProvider;

/// Builds a backend from its configuration map.
pub type BackendConstructor =
    Arc<dyn Fn(&BackendConfig) -> Result<BoxLlmProvider, GatewayError> + Send + Sync>;

/// Registry of backend constructors keyed by model type tag.
#[derive(Default)]
pub struct BackendFactory {
    constructors: RwLock<HashMap<String, BackendConstructor>>,
}

impl BackendFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `tag`.
    ///
    /// An empty tag is ignored with a warning.
    pub fn register_backend<F>(&self, tag: &str, constructor: F)
    where
        F: Fn(&BackendConfig) -> Result<BoxLlmProvider, GatewayError> + Send + Sync + 'static,
    {
        let tag = tag.trim();
        if tag.is_empty() {
            warn!("ignoring backend registration with an empty model type");
            return;
        }

        let replaced = self
            .constructors
            .write()
            .expect("backend factory lock poisoned")
            .insert(tag.to_string(), Arc::new(constructor))
            .is_some();

        if replaced {
            info!(model_type = %tag, "backend constructor replaced");
        } else {
            info!(model_type = %tag, "backend constructor registered");
        }
    }

    /// Whether a constructor is registered for `tag`.
    pub fn is_registered(&self, tag: &str) -> bool {
        self.constructors
            .read()
            .expect("backend factory lock poisoned")
            .contains_key(tag)
    }

    /// All registered tags, sorted.
    pub fn registered_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .constructors
            .read()
            .expect("backend factory lock poisoned")
            .keys()
            .cloned()
            .collect();
        tags.sort();
        tags
    }

    /// Build a backend for `tag` from `config`.
    ///
    /// The constructor runs outside the factory lock.
    pub fn create_backend(
        &self,
        tag: &str,
        config: &BackendConfig,
    ) -> Result<BoxLlmProvider, GatewayError> {
        let constructor = self
            .constructors
            .read()
            .expect("backend factory lock poisoned")
            .get(tag)
            .cloned()
            .ok_or_else(|| GatewayError::UnsupportedModelType(tag.to_string()))?;

        constructor(config).inspect_err(|e| {
            warn!(model_type = %tag, error = %e, "backend construction failed");
        })
    }

    /// Build a backend and bind it to a fresh conversation session.
    pub fn create_session(
        &self,
        tag: &str,
        session_id: &str,
        config: &BackendConfig,
        persister: Arc<BoxMessagePersister>,
    ) -> Result<ConversationSession, GatewayError> {
        let backend = self.create_backend(tag, config)?;
        info!(session_id = %session_id, model_type = %tag, "conversation session created");
        Ok(ConversationSession::new(session_id, tag, backend, persister))
    }
}
