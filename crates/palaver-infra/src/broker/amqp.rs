//! AMQP 0-9-1 broker adapter backed by [`lapin`].
//!
//! Channels are opened in publisher-confirm mode so a publish only returns
//! once the broker has taken responsibility for the message.

use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, ConnectionProperties};
use tracing::debug;

use palaver_core::queue::broker::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream};
use palaver_types::error::QueueError;

/// AMQP delivery mode for messages that survive a broker restart.
const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;
const CONTENT_TYPE: &str = "application/json";

/// Dials an `amqp://` or `amqps://` URL.
#[derive(Clone)]
pub struct AmqpBroker {
    url: String,
}

impl AmqpBroker {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Broker for AmqpBroker {
    type Connection = AmqpConnection;

    async fn connect(&self) -> Result<AmqpConnection, QueueError> {
        let inner = lapin::Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        debug!("amqp connection established");
        Ok(AmqpConnection { inner })
    }
}

pub struct AmqpConnection {
    inner: lapin::Connection,
}

impl BrokerConnection for AmqpConnection {
    type Channel = AmqpChannel;

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }

    async fn create_channel(&self) -> Result<AmqpChannel, QueueError> {
        let inner = self
            .inner
            .create_channel()
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;
        inner
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;
        Ok(AmqpChannel { inner })
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.inner
            .close(200, "shutdown")
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))
    }
}

pub struct AmqpChannel {
    inner: lapin::Channel,
}

fn publish_properties(persistent: bool) -> BasicProperties {
    let mode = if persistent {
        PERSISTENT_DELIVERY_MODE
    } else {
        TRANSIENT_DELIVERY_MODE
    };
    BasicProperties::default()
        .with_delivery_mode(mode)
        .with_content_type(CONTENT_TYPE.into())
}

impl BrokerChannel for AmqpChannel {
    type Delivery = AmqpDelivery;

    async fn queue_declare(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;
        Ok(())
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), QueueError> {
        self.inner
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), QueueError> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                publish_properties(persistent),
            )
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| QueueError::Publish(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(QueueError::Publish("broker rejected message".to_string()));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<AmqpDelivery>, QueueError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Channel(e.to_string()))?;

        Ok(Box::pin(consumer.map(|item| {
            item.map(|inner| AmqpDelivery { inner })
                .map_err(|e| QueueError::Channel(e.to_string()))
        })))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

pub struct AmqpDelivery {
    inner: lapin::message::Delivery,
}

impl Delivery for AmqpDelivery {
    fn body(&self) -> &[u8] {
        &self.inner.data
    }

    fn delivery_tag(&self) -> u64 {
        self.inner.delivery_tag
    }

    fn redelivered(&self) -> bool {
        self.inner.redelivered
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.inner
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        self.inner
            .acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(|e| QueueError::Ack(e.to_string()))
    }
}
