//! Consuming side of the persistence queue.
//!
//! Each consumer owns one channel with a bounded prefetch window and
//! writes every delivery to the [`MessageStore`]:
//!
//! - undecodable body: nack without requeue (poison, dropped)
//! - write failure: nack with requeue (retried by redelivery)
//! - write success: ack
//!
//! When the delivery stream ends the consumer reconnects through the shared
//! [`ConnectionManager`], with exponential backoff and a circuit breaker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use palaver_types::config::{BrokerConfig, ReconnectConfig};
use palaver_types::error::QueueError;
use palaver_types::persistence::PersistenceEvent;

use crate::repository::MessageStore;

use super::backoff::Backoff;
use super::breaker::CircuitBreaker;
use super::broker::{Broker, BrokerChannel, ChannelOf, Delivery, DeliveryOf, DeliveryStream};
use super::connection::ConnectionManager;

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Requeued,
    Dropped,
}

/// Decode, write and settle one delivery.
///
/// `Err` only when the settlement itself fails, which means the channel is
/// gone and the broker will redeliver.
pub async fn handle_delivery<D: Delivery, S: MessageStore>(
    delivery: &D,
    store: &S,
) -> Result<DeliveryOutcome, QueueError> {
    let tag = delivery.delivery_tag();

    let event = match PersistenceEvent::decode(delivery.body()) {
        Ok(event) => event,
        Err(e) => {
            warn!(delivery_tag = tag, error = %e, "dropping undecodable message");
            delivery.nack(false).await?;
            return Ok(DeliveryOutcome::Dropped);
        }
    };

    let message = event.into_message(Utc::now());
    match store.insert_message(&message).await {
        Ok(()) => {
            delivery.ack().await?;
            debug!(
                delivery_tag = tag,
                session_id = %message.session_id,
                redelivered = delivery.redelivered(),
                "message stored"
            );
            Ok(DeliveryOutcome::Acked)
        }
        Err(e) => {
            error!(
                delivery_tag = tag,
                session_id = %message.session_id,
                error = %e,
                "message write failed, requeueing"
            );
            delivery.nack(true).await?;
            Ok(DeliveryOutcome::Requeued)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: String,
    pub prefetch: u16,
    pub reconnect: ReconnectConfig,
    /// Pause after a requeue so a failing store is not hammered.
    pub requeue_delay: Duration,
}

impl ConsumerSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            queue: config.queue.clone(),
            prefetch: config.prefetch,
            reconnect: config.reconnect.clone(),
            requeue_delay: Duration::from_millis(config.reconnect.initial_backoff_ms),
        }
    }
}

enum StreamEnd {
    Cancelled,
    Lost,
}

pub struct QueueConsumer<B: Broker, S: MessageStore> {
    id: usize,
    manager: Arc<ConnectionManager<B>>,
    store: Arc<S>,
    settings: ConsumerSettings,
}

impl<B: Broker, S: MessageStore + 'static> QueueConsumer<B, S> {
    pub fn new(
        id: usize,
        manager: Arc<ConnectionManager<B>>,
        store: Arc<S>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            id,
            manager,
            store,
            settings,
        }
    }

    fn consumer_tag(&self) -> String {
        format!("palaver-consumer-{}", self.id)
    }

    /// Consume until `cancel` fires, reconnecting whenever the delivery
    /// stream ends.
    pub async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::from_config(&self.settings.reconnect);
        let mut breaker = CircuitBreaker::from_config(&self.settings.reconnect);

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if !breaker.allow_attempt() {
                let wait = breaker.remaining_open();
                warn!(
                    consumer = self.id,
                    wait_ms = wait.as_millis() as u64,
                    "broker circuit open, pausing reconnect attempts"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => continue,
                }
            }

            match self.attach().await {
                Ok((_channel, stream)) => {
                    breaker.record_success();
                    backoff.reset();
                    info!(consumer = self.id, queue = %self.settings.queue, "consumer attached");

                    match self.drain(stream, &cancel).await {
                        StreamEnd::Cancelled => break,
                        StreamEnd::Lost => {
                            warn!(consumer = self.id, "delivery stream ended, reconnecting")
                        }
                    }
                }
                Err(e) => {
                    breaker.record_failure();
                    warn!(
                        consumer = self.id,
                        error = %e,
                        failures = breaker.total_failures(),
                        "consumer attach failed"
                    );
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!(consumer = self.id, "consumer stopped");
    }

    /// Open a channel, set the prefetch window and start consuming. The
    /// channel is returned so it stays alive for the stream's lifetime.
    async fn attach(&self) -> Result<(ChannelOf<B>, DeliveryStream<DeliveryOf<B>>), QueueError> {
        let channel = self.manager.open_channel(&self.settings.queue).await?;
        channel.basic_qos(self.settings.prefetch).await?;
        let stream = channel
            .consume(&self.settings.queue, &self.consumer_tag())
            .await?;
        Ok((channel, stream))
    }

    async fn drain(
        &self,
        mut stream: DeliveryStream<DeliveryOf<B>>,
        cancel: &CancellationToken,
    ) -> StreamEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                next = stream.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    warn!(consumer = self.id, error = %e, "delivery stream error");
                    return StreamEnd::Lost;
                }
                None => return StreamEnd::Lost,
            };

            match handle_delivery(&delivery, self.store.as_ref()).await {
                Ok(DeliveryOutcome::Requeued) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return StreamEnd::Cancelled,
                        _ = tokio::time::sleep(self.settings.requeue_delay) => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(consumer = self.id, error = %e, "settlement failed");
                    return StreamEnd::Lost;
                }
            }
        }
    }
}

/// Spawn `count` consumers sharing one connection manager and store.
pub fn spawn_consumer_pool<B, S>(
    count: usize,
    manager: Arc<ConnectionManager<B>>,
    store: Arc<S>,
    settings: ConsumerSettings,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>>
where
    B: Broker,
    S: MessageStore + 'static,
{
    (0..count.max(1))
        .map(|id| {
            let consumer = QueueConsumer::new(id, manager.clone(), store.clone(), settings.clone());
            tokio::spawn(consumer.run(cancel.clone()))
        })
        .collect()
}
