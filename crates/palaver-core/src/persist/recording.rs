use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use palaver_types::error::GatewayError;
use palaver_types::persistence::PersistenceEvent;

use super::MessagePersister;

/// Records every event in memory. Clones share the same log.
///
/// Can be switched into a failing mode to exercise the "persistence
/// failures never fail the append" path.
#[derive(Clone, Default)]
pub struct RecordingPersister {
    events: Arc<Mutex<Vec<PersistenceEvent>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingPersister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent calls fail (nothing is recorded while failing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<PersistenceEvent> {
        self.events.lock().expect("recording persister poisoned").clone()
    }
}

impl MessagePersister for RecordingPersister {
    async fn persist(&self, event: &PersistenceEvent) -> Result<(), GatewayError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Persistence("recording persister set to fail".to_string()));
        }
        self.events
            .lock()
            .expect("recording persister poisoned")
            .push(event.clone());
        Ok(())
    }
}
