//! Asynchronous write-behind persistence queue.
//!
//! Sessions publish [`PersistenceEvent`](palaver_types::persistence::PersistenceEvent)s
//! through a [`QueuePersister`]; a pool of [`QueueConsumer`]s writes them
//! to the message store with at-least-once delivery.

pub mod backoff;
pub mod breaker;
pub mod broker;
pub mod connection;
pub mod consumer;
pub mod memory;
pub mod producer;

pub use connection::{BrokerHealth, ConnectionManager};
pub use consumer::{ConsumerSettings, QueueConsumer, spawn_consumer_pool};
pub use memory::InMemoryBroker;
pub use producer::{PUBLISH_BUFFER, QueuePersister, QueueProducer};
