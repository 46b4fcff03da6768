//! Publishing side of the persistence queue.
//!
//! Sessions never talk to the broker directly. [`QueuePersister`] hands
//! encoded events to a bounded buffer and returns; a single publisher task
//! drains the buffer in order through [`QueueProducer`]. A slow or absent
//! broker therefore delays persistence, never a reply.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use palaver_types::config::ReconnectConfig;
use palaver_types::error::{GatewayError, QueueError};
use palaver_types::persistence::PersistenceEvent;

use crate::persist::MessagePersister;

use super::breaker::CircuitBreaker;
use super::broker::{Broker, BrokerChannel, ChannelOf};
use super::connection::ConnectionManager;

/// Events buffered between sessions and the publisher task.
pub const PUBLISH_BUFFER: usize = 1024;

/// Publishes persistence events as persistent messages to a durable queue
/// through the default exchange.
pub struct QueueProducer<B: Broker> {
    manager: Arc<ConnectionManager<B>>,
    queue: String,
    channel: Mutex<Option<Arc<ChannelOf<B>>>>,
    breaker: StdMutex<CircuitBreaker>,
}

impl<B: Broker> QueueProducer<B> {
    pub fn new(
        manager: Arc<ConnectionManager<B>>,
        queue: impl Into<String>,
        reconnect: &ReconnectConfig,
    ) -> Self {
        Self {
            manager,
            queue: queue.into(),
            channel: Mutex::new(None),
            breaker: StdMutex::new(CircuitBreaker::from_config(reconnect)),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Publish `body`. The queue is (re)declared durable before each
    /// publish. A failure on a cached channel is retried once on a fresh
    /// channel. While the breaker is open no channel is reopened and the
    /// publish fails with [`QueueError::CircuitOpen`].
    pub async fn publish(&self, body: &[u8]) -> Result<(), QueueError> {
        let cached = self
            .channel
            .lock()
            .await
            .as_ref()
            .filter(|c| c.is_open())
            .cloned();

        if let Some(channel) = cached {
            match self.publish_on(&channel, body).await {
                Ok(()) => return Ok(()),
                Err(e) => warn!(queue = %self.queue, error = %e, "publish failed, reopening channel"),
            }
        }

        let channel = self.reopen().await?;
        self.publish_on(&channel, body).await
    }

    async fn reopen(&self) -> Result<Arc<ChannelOf<B>>, QueueError> {
        if !self.breaker().allow_attempt() {
            return Err(QueueError::CircuitOpen);
        }

        let mut cached = self.channel.lock().await;
        // Another publish may have reopened it while this one waited.
        if let Some(channel) = cached.as_ref().filter(|c| c.is_open()) {
            return Ok(channel.clone());
        }
        *cached = None;

        match self.manager.open_channel(&self.queue).await {
            Ok(channel) => {
                self.breaker().record_success();
                let channel = Arc::new(channel);
                *cached = Some(channel.clone());
                Ok(channel)
            }
            Err(e) => {
                self.breaker().record_failure();
                Err(e)
            }
        }
    }

    async fn publish_on(&self, channel: &ChannelOf<B>, body: &[u8]) -> Result<(), QueueError> {
        channel.queue_declare(&self.queue, true).await?;
        channel.publish("", &self.queue, body, true).await?;
        debug!(queue = %self.queue, bytes = body.len(), "message published");
        Ok(())
    }

    fn breaker(&self) -> std::sync::MutexGuard<'_, CircuitBreaker> {
        self.breaker.lock().expect("producer breaker lock poisoned")
    }
}

/// [`MessagePersister`] that writes behind through the queue: sessions
/// enqueue, the publisher task publishes, and a consumer performs the
/// storage write.
pub struct QueuePersister {
    tx: mpsc::Sender<Vec<u8>>,
}

impl QueuePersister {
    /// Start the publisher task for `producer`.
    ///
    /// On cancellation the task publishes what is already buffered, then
    /// stops.
    pub fn spawn<B: Broker>(
        producer: QueueProducer<B>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_publisher(producer, rx, cancel));
        (Self { tx }, handle)
    }
}

async fn run_publisher<B: Broker>(
    producer: QueueProducer<B>,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            body = rx.recv() => body,
        };
        let Some(body) = body else { break };
        publish_logged(&producer, &body).await;
    }

    rx.close();
    while let Ok(body) = rx.try_recv() {
        publish_logged(&producer, &body).await;
    }
    info!(queue = %producer.queue(), "publisher stopped");
}

async fn publish_logged<B: Broker>(producer: &QueueProducer<B>, body: &[u8]) {
    if let Err(e) = producer.publish(body).await {
        warn!(queue = %producer.queue(), error = %e, "message dropped, publish failed");
    }
}

impl MessagePersister for QueuePersister {
    async fn persist(&self, event: &PersistenceEvent) -> Result<(), GatewayError> {
        let body = event
            .encode()
            .map_err(|e| GatewayError::Persistence(format!("encode failed: {e}")))?;
        self.tx.try_send(body).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                GatewayError::Persistence("publish buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => {
                GatewayError::Persistence("publisher stopped".to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::queue::memory::InMemoryBroker;

    fn event(content: &str) -> PersistenceEvent {
        PersistenceEvent {
            session_id: "s-1".to_string(),
            content: content.to_string(),
            username: "alice".to_string(),
            is_user: true,
        }
    }

    fn producer(broker: &InMemoryBroker) -> QueueProducer<InMemoryBroker> {
        QueueProducer::new(
            Arc::new(ConnectionManager::new(broker.clone())),
            "Message",
            &ReconnectConfig::default(),
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_publish_declares_durable_queue() {
        let broker = InMemoryBroker::new();
        producer(&broker).publish(b"{}").await.unwrap();
        assert_eq!(broker.is_durable("Message"), Some(true));
        assert_eq!(broker.depth("Message"), 1);
    }

    #[tokio::test]
    async fn test_persister_publishes_encoded_events_in_order() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        let (persister, handle) = QueuePersister::spawn(producer(&broker), 16, cancel.clone());

        persister.persist(&event("hello")).await.unwrap();
        persister.persist(&event("again")).await.unwrap();
        eventually(|| broker.depth("Message") == 2).await;

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_recovers_after_disconnect() {
        let broker = InMemoryBroker::new();
        let producer = producer(&broker);
        producer.publish(b"1").await.unwrap();

        broker.disconnect_all();
        producer.publish(b"2").await.unwrap();
        assert_eq!(broker.depth("Message"), 2);
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast_without_dialing() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let producer = producer(&broker);
        let threshold = ReconnectConfig::default().failure_threshold as u64;

        for _ in 0..threshold {
            assert!(matches!(
                producer.publish(b"x").await,
                Err(QueueError::Connection(_))
            ));
        }
        let attempts = broker.connect_attempts();
        assert_eq!(attempts, threshold);

        assert!(matches!(producer.publish(b"x").await, Err(QueueError::CircuitOpen)));
        assert_eq!(broker.connect_attempts(), attempts);
    }

    #[tokio::test]
    async fn test_slow_broker_does_not_delay_persist() {
        let broker = InMemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(300));
        let cancel = CancellationToken::new();
        let (persister, handle) = QueuePersister::spawn(producer(&broker), 16, cancel.clone());

        // Two sessions persisting while the publisher is stuck dialing.
        let appends = async {
            persister.persist(&event("first")).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            persister.persist(&event("second")).await.unwrap();
        };
        tokio::time::timeout(Duration::from_millis(150), appends)
            .await
            .expect("persist must not wait for the broker");

        eventually(|| broker.depth("Message") == 2).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_buffer_is_reported() {
        let broker = InMemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(500));
        let cancel = CancellationToken::new();
        let (persister, handle) = QueuePersister::spawn(producer(&broker), 1, cancel.clone());

        let mut results = Vec::new();
        for i in 0..4 {
            results.push(persister.persist(&event(&format!("m{i}"))).await);
        }
        assert!(results.iter().any(|r| matches!(r, Err(GatewayError::Persistence(_)))));

        cancel.cancel();
        handle.abort();
    }

    #[tokio::test]
    async fn test_buffered_events_are_published_on_shutdown() {
        let broker = InMemoryBroker::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (persister, handle) = QueuePersister::spawn(producer(&broker), 16, cancel);

        // The task may already have stopped accepting; whatever was accepted
        // must reach the queue.
        let accepted = [persister.persist(&event("a")).await, persister.persist(&event("b")).await]
            .iter()
            .filter(|r| r.is_ok())
            .count();
        handle.await.unwrap();
        assert_eq!(broker.depth("Message"), accepted);
    }
}
