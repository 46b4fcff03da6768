//! Broker abstraction for the durable persistence queue.
//!
//! The shape follows AMQP 0-9-1: a connection opens channels, a channel
//! declares queues, publishes, sets a prefetch window and consumes. Every
//! delivery must be acknowledged or negatively acknowledged exactly once.
//! Deliveries left unacknowledged when their connection drops are
//! redelivered by the broker.

use std::future::Future;
use std::pin::Pin;

use futures_util::Stream;

use palaver_types::error::QueueError;

/// Stream of deliveries from one consumer. Ends when the underlying
/// connection or channel goes away.
pub type DeliveryStream<D> = Pin<Box<dyn Stream<Item = Result<D, QueueError>> + Send>>;

/// A broker endpoint that can be dialed.
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    fn connect(&self) -> impl Future<Output = Result<Self::Connection, QueueError>> + Send;
}

pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    fn is_connected(&self) -> bool;

    fn create_channel(&self) -> impl Future<Output = Result<Self::Channel, QueueError>> + Send;

    fn close(&self) -> impl Future<Output = Result<(), QueueError>> + Send;
}

pub trait BrokerChannel: Send + Sync + 'static {
    type Delivery: Delivery;

    /// Declare `queue`. Idempotent for matching arguments.
    fn queue_declare(
        &self,
        queue: &str,
        durable: bool,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    /// Cap the number of unacknowledged deliveries on this channel.
    fn basic_qos(&self, prefetch: u16) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        persistent: bool,
    ) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> impl Future<Output = Result<DeliveryStream<Self::Delivery>, QueueError>> + Send;

    fn is_open(&self) -> bool;
}

/// One message handed to a consumer.
pub trait Delivery: Send + Sync + 'static {
    fn body(&self) -> &[u8];

    fn delivery_tag(&self) -> u64;

    /// Whether the broker delivered this message before.
    fn redelivered(&self) -> bool;

    fn ack(&self) -> impl Future<Output = Result<(), QueueError>> + Send;

    fn nack(&self, requeue: bool) -> impl Future<Output = Result<(), QueueError>> + Send;
}

pub type ConnectionOf<B> = <B as Broker>::Connection;
pub type ChannelOf<B> = <ConnectionOf<B> as BrokerConnection>::Channel;
pub type DeliveryOf<B> = <ChannelOf<B> as BrokerChannel>::Delivery;
