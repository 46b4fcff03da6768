//! Persistence capability for conversation messages.
//!
//! A session hands every message it wants stored to a [`MessagePersister`].
//! Production wires in the queue-backed persister (write-behind through the
//! durable broker); tests use [`RecordingPersister`].

mod recording;

use std::future::Future;
use std::pin::Pin;

use palaver_types::error::GatewayError;
use palaver_types::persistence::PersistenceEvent;

pub use recording::RecordingPersister;

/// Capability to durably persist a message, possibly asynchronously.
///
/// Uses native async fn in traits (RPITIT, Rust 2024 edition).
pub trait MessagePersister: Send + Sync {
    fn persist(
        &self,
        event: &PersistenceEvent,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;
}

/// Object-safe version of [`MessagePersister`] with a boxed future.
pub trait MessagePersisterDyn: Send + Sync {
    fn persist_boxed<'a>(
        &'a self,
        event: &'a PersistenceEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>>;
}

impl<T: MessagePersister> MessagePersisterDyn for T {
    fn persist_boxed<'a>(
        &'a self,
        event: &'a PersistenceEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), GatewayError>> + Send + 'a>> {
        Box::pin(self.persist(event))
    }
}

/// Type-erased persister shared by every session.
pub struct BoxMessagePersister {
    inner: Box<dyn MessagePersisterDyn + Send + Sync>,
}

impl BoxMessagePersister {
    pub fn new<T: MessagePersister + 'static>(persister: T) -> Self {
        Self {
            inner: Box::new(persister),
        }
    }

    pub async fn persist(&self, event: &PersistenceEvent) -> Result<(), GatewayError> {
        self.inner.persist_boxed(event).await
    }
}
