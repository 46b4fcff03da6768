//! Shared broker connection with serialized redial.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use palaver_types::error::QueueError;

use super::broker::{Broker, BrokerChannel, BrokerConnection, ChannelOf, ConnectionOf};

/// Owns the broker connection used by the producer and every consumer.
///
/// A dead connection is replaced on demand. The mutex makes concurrent
/// callers wait for a single redial instead of racing to open several.
pub struct ConnectionManager<B: Broker> {
    broker: B,
    current: Mutex<Option<Arc<ConnectionOf<B>>>>,
}

impl<B: Broker> ConnectionManager<B> {
    pub fn new(broker: B) -> Self {
        Self {
            broker,
            current: Mutex::new(None),
        }
    }

    pub fn broker(&self) -> &B {
        &self.broker
    }

    /// Return the live connection, dialing a new one if needed.
    pub async fn connection(&self) -> Result<Arc<ConnectionOf<B>>, QueueError> {
        let mut current = self.current.lock().await;
        if let Some(conn) = current.as_ref() {
            if conn.is_connected() {
                return Ok(conn.clone());
            }
            warn!("broker connection lost, redialing");
        }

        *current = None;
        let conn = Arc::new(self.broker.connect().await?);
        info!("broker connection established");
        *current = Some(conn.clone());
        Ok(conn)
    }

    /// Open a channel and declare `queue` durable on it.
    pub async fn open_channel(&self, queue: &str) -> Result<ChannelOf<B>, QueueError> {
        let conn = self.connection().await?;
        let channel = conn.create_channel().await?;
        channel.queue_declare(queue, true).await?;
        Ok(channel)
    }

    /// Whether a live connection is currently held. Never dials.
    pub fn is_connected(&self) -> bool {
        match self.current.try_lock() {
            Ok(current) => current.as_ref().is_some_and(|c| c.is_connected()),
            // A redial is in progress.
            Err(_) => false,
        }
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        if let Some(conn) = self.current.lock().await.take() {
            conn.close().await?;
            info!("broker connection closed");
        }
        Ok(())
    }
}

/// Object-safe view of broker connectivity for health reporting.
pub trait BrokerHealth: Send + Sync {
    fn is_connected(&self) -> bool;
}

impl<B: Broker> BrokerHealth for ConnectionManager<B> {
    fn is_connected(&self) -> bool {
        ConnectionManager::<B>::is_connected(self)
    }
}
