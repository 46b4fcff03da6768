//! In-process broker with AMQP-like delivery semantics.
//!
//! Used for development (`memory://` broker URL) and for tests. Messages
//! live only as long as the broker value, but acknowledgement, requeue,
//! prefetch and redelivery-after-disconnect behave like a real broker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use palaver_types::error::QueueError;

use super::broker::{Broker, BrokerChannel, BrokerConnection, Delivery, DeliveryStream};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    durable: bool,
    messages: VecDeque<StoredMessage>,
}

struct Unacked {
    queue: String,
    message: StoredMessage,
}

struct ConnectionShared {
    id: u64,
    closed: CancellationToken,
    unacked: Mutex<HashMap<u64, Unacked>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    connections: Vec<Arc<ConnectionShared>>,
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
    reachable: AtomicBool,
    next_id: AtomicU64,
    connect_attempts: AtomicU64,
    connect_delay_ms: AtomicU64,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().expect("in-memory broker lock poisoned")
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn requeue_front(&self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(q) = self.lock().queues.get_mut(queue) {
            q.messages.push_front(message);
        }
        self.notify.notify_waiters();
    }
}

/// Cloneable handle to one in-process broker. Clones share all state.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                reachable: AtomicBool::new(true),
                next_id: AtomicU64::new(0),
                connect_attempts: AtomicU64::new(0),
                connect_delay_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Make subsequent connects fail (or succeed again).
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make each connect take `delay` before it succeeds or fails.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drop every open connection. Unacknowledged deliveries go back to
    /// the head of their queues, flagged as redelivered.
    pub fn disconnect_all(&self) {
        let connections = std::mem::take(&mut self.shared.lock().connections);
        for conn in connections {
            close_connection(&self.shared, &conn);
        }
    }

    /// Messages ready for delivery in `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Deliveries handed out but not yet acknowledged, across connections.
    pub fn unacked_count(&self) -> usize {
        self.shared
            .lock()
            .connections
            .iter()
            .map(|c| c.unacked.lock().expect("unacked lock poisoned").len())
            .sum()
    }

    pub fn is_durable(&self, queue: &str) -> Option<bool> {
        self.shared.lock().queues.get(queue).map(|q| q.durable)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }
}

fn close_connection(shared: &Shared, conn: &ConnectionShared) {
    conn.closed.cancel();
    let pending: Vec<(u64, Unacked)> = conn
        .unacked
        .lock()
        .expect("unacked lock poisoned")
        .drain()
        .collect();

    // Requeue newest first so the oldest ends up at the head.
    let mut pending = pending;
    pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
    for (_, u) in pending {
        shared.requeue_front(&u.queue, u.message);
    }
    shared.notify.notify_waiters();
    debug!(connection = conn.id, "in-memory broker connection closed");
}

impl Broker for InMemoryBroker {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, QueueError> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.shared.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("broker unreachable".to_string()));
        }

        let conn = Arc::new(ConnectionShared {
            id: self.shared.next_id(),
            closed: CancellationToken::new(),
            unacked: Mutex::new(HashMap::new()),
        });
        self.shared.lock().connections.push(conn.clone());
        Ok(MemoryConnection {
            shared: self.shared.clone(),
            conn,
        })
    }
}

pub struct MemoryConnection {
    shared: Arc<Shared>,
    conn: Arc<ConnectionShared>,
}

impl BrokerConnection for MemoryConnection {
    type Channel = MemoryChannel;

    fn is_connected(&self) -> bool {
        !self.conn.closed.is_cancelled()
    }

    async fn create_channel(&self) -> Result<MemoryChannel, QueueError> {
        if !self.is_connected() {
            return Err(QueueError::Channel("connection closed".to_string()));
        }
        Ok(MemoryChannel {
            shared: self.shared.clone(),
            conn: self.conn.clone(),
            prefetch: Mutex::new(None),
        })
    }

    async fn close(&self) -> Result<(), QueueError> {
        let id = self.conn.id;
        self.shared.lock().connections.retain(|c| c.id != id);
        close_connection(&self.shared, &self.conn);
        Ok(())
    }
}

pub struct MemoryChannel {
    shared: Arc<Shared>,
    conn: Arc<ConnectionShared>,
    prefetch: Mutex<Option<Arc<Semaphore>>>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.conn.closed.is_cancelled() {
            return Err(QueueError::Channel("connection closed".to_string()));
        }
        Ok(())
    }
}

impl BrokerChannel for MemoryChannel {
    type Delivery = MemoryDelivery;

    async fn queue_declare(&self, queue: &str, durable: bool) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        let q = state.queues.entry(queue.to_string()).or_insert_with(|| QueueState {
            durable,
            ..Default::default()
        });
        if q.durable != durable {
            return Err(QueueError::Channel(format!(
                "queue {queue} already declared with durable={}",
                q.durable
            )));
        }
        Ok(())
    }

    async fn basic_qos(&self, prefetch: u16) -> Result<(), QueueError> {
        self.ensure_open()?;
        let limit = (prefetch > 0).then(|| Arc::new(Semaphore::new(prefetch as usize)));
        *self.prefetch.lock().expect("prefetch lock poisoned") = limit;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        _persistent: bool,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        if !exchange.is_empty() {
            return Err(QueueError::Publish(format!("no exchange '{exchange}'")));
        }

        // Unroutable messages on the default exchange are dropped, as in AMQP.
        if let Some(q) = self.shared.lock().queues.get_mut(routing_key) {
            q.messages.push_back(StoredMessage {
                body: body.to_vec(),
                redelivered: false,
            });
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream<MemoryDelivery>, QueueError> {
        self.ensure_open()?;
        if !self.shared.lock().queues.contains_key(queue) {
            return Err(QueueError::Channel(format!("no queue '{queue}'")));
        }

        let shared = self.shared.clone();
        let conn = self.conn.clone();
        let queue = queue.to_string();
        let prefetch = self.prefetch.lock().expect("prefetch lock poisoned").clone();

        Ok(Box::pin(async_stream::stream! {
            loop {
                let permit = match &prefetch {
                    Some(sem) => tokio::select! {
                        p = sem.clone().acquire_owned() => match p {
                            Ok(p) => Some(p),
                            Err(_) => break,
                        },
                        _ = conn.closed.cancelled() => break,
                    },
                    None => None,
                };

                let delivery = loop {
                    let notified = shared.notify.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    if conn.closed.is_cancelled() {
                        break None;
                    }
                    let next = shared
                        .lock()
                        .queues
                        .get_mut(&queue)
                        .and_then(|q| q.messages.pop_front());
                    if let Some(message) = next {
                        let tag = shared.next_id();
                        conn.unacked.lock().expect("unacked lock poisoned").insert(
                            tag,
                            Unacked { queue: queue.clone(), message: message.clone() },
                        );
                        break Some(MemoryDelivery {
                            shared: shared.clone(),
                            conn: conn.clone(),
                            tag,
                            body: message.body,
                            redelivered: message.redelivered,
                            permit: Mutex::new(permit),
                        });
                    }

                    tokio::select! {
                        _ = &mut notified => {}
                        _ = conn.closed.cancelled() => {}
                    }
                };

                match delivery {
                    Some(d) => yield Ok(d),
                    None => break,
                }
            }
        }))
    }

    fn is_open(&self) -> bool {
        !self.conn.closed.is_cancelled()
    }
}

pub struct MemoryDelivery {
    shared: Arc<Shared>,
    conn: Arc<ConnectionShared>,
    tag: u64,
    body: Vec<u8>,
    redelivered: bool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryDelivery {
    fn settle(&self) -> Result<Unacked, QueueError> {
        let settled = self
            .conn
            .unacked
            .lock()
            .expect("unacked lock poisoned")
            .remove(&self.tag)
            .ok_or_else(|| {
                QueueError::Ack(format!("unknown delivery tag {} (channel closed)", self.tag))
            });
        // Frees one prefetch slot.
        self.permit.lock().expect("permit lock poisoned").take();
        settled
    }
}

impl Delivery for MemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    fn delivery_tag(&self) -> u64 {
        self.tag
    }

    fn redelivered(&self) -> bool {
        self.redelivered
    }

    async fn ack(&self) -> Result<(), QueueError> {
        self.settle().map(|_| ())
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        let unacked = self.settle()?;
        if requeue {
            self.shared.requeue_front(&unacked.queue, unacked.message);
        }
        Ok(())
    }
}
