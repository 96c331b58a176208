//! In-process broker for tests, development and single-process deployments.
//!
//! Models the subset of AMQP 0-9-1 the bus relies on: direct exchanges, queues with bindings,
//! manual acknowledgment with prefetch, auto-deleted queues and dead-letter exchanges. Faults can be
//! injected with [`MemoryBroker::set_reachable`] and [`MemoryBroker::close_channels`].
//!
//! Deliveries left unsettled when their channel closes are dropped rather than requeued. Published,
//! unroutable, dead-lettered and settled messages are journaled for inspection; each journal keeps only
//! the most recent [`DEFAULT_JOURNAL_CAPACITY`] entries unless configured otherwise.

use crate::transport::{
    Acker, Broker, Channel, Delivery, DeliveryStream, ExchangeSpec, OutgoingMessage, QueueSpec, Result,
    TransportError,
};
use async_trait::async_trait;
use futures::stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_JOURNAL_CAPACITY: usize = 1024;

/// Memory-based broker. Clones share the same broker state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    connections: usize,
    next_channel_id: u64,
    next_delivery_tag: u64,
    channels: HashMap<u64, watch::Sender<bool>>,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    published: Journal<PublishedMessage>,
    unroutable: Journal<PublishedMessage>,
    dead_lettered: Journal<PublishedMessage>,
    acked: Journal<SettledDelivery>,
    rejected: Journal<SettledDelivery>,
}

/// Ring buffer of the most recent entries.
struct Journal<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> Default for Journal<T> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: DEFAULT_JOURNAL_CAPACITY,
        }
    }
}

impl<T: Clone> Journal<T> {
    fn push(&mut self, entry: T) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }

    fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }
}

struct QueueState {
    spec: QueueSpec,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: Option<mpsc::UnboundedReceiver<QueuedMessage>>,
    consumer: Option<ConsumerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub consumer_tag: String,
    pub channel_id: u64,
    pub prefetch: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    exchange: String,
    routing_key: String,
    message: OutgoingMessage,
    redelivered: bool,
}

/// A message as the broker accepted it.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutgoingMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettledDelivery {
    pub queue: String,
    pub routing_key: String,
    pub delivery_tag: u64,
    pub requeued: bool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` entries in each inspection journal; `0` disables journaling.
    #[must_use]
    pub fn with_journal_capacity(self, capacity: usize) -> Self {
        {
            let mut state = self.lock();
            state.published.set_capacity(capacity);
            state.unroutable.set_capacity(capacity);
            state.dead_lettered.set_capacity(capacity);
            state.acked.set_capacity(capacity);
            state.rejected.set_capacity(capacity);
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// An unreachable broker refuses new connections and drops every open channel.
    pub fn set_reachable(&self, reachable: bool) {
        let mut state = self.lock();
        state.unreachable = !reachable;
        if !reachable {
            state.close_all_channels();
        }
    }

    /// Closes every open channel, as a broker restart or network partition would.
    pub fn close_channels(&self) {
        self.lock().close_all_channels();
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections
    }

    pub fn open_channel_count(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.lock().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn consumer(&self, queue: &str) -> Option<ConsumerInfo> {
        self.lock().queues.get(queue).and_then(|q| q.consumer.clone())
    }

    /// Routing keys bound to `queue` through `exchange`.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.queue == queue)
            .map(|b| b.routing_key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.snapshot()
    }

    pub fn unroutable(&self) -> Vec<PublishedMessage> {
        self.lock().unroutable.snapshot()
    }

    pub fn dead_lettered(&self) -> Vec<PublishedMessage> {
        self.lock().dead_lettered.snapshot()
    }

    pub fn acked(&self) -> Vec<SettledDelivery> {
        self.lock().acked.snapshot()
    }

    pub fn rejected(&self) -> Vec<SettledDelivery> {
        self.lock().rejected.snapshot()
    }

    /// Publishes a raw payload, bypassing any codec. Useful to simulate foreign or malformed producers.
    pub fn publish_raw(&self, exchange: &str, routing_key: &str, payload: impl Into<Vec<u8>>) -> Result<()> {
        let message = OutgoingMessage::new(payload.into(), "application/json");
        self.lock().publish(exchange, routing_key, message)
    }

    fn release_consumer(&self, queue: &str, rx: Option<mpsc::UnboundedReceiver<QueuedMessage>>) {
        let mut state = self.lock();
        let auto_delete = match state.queues.get_mut(queue) {
            Some(q) => {
                q.consumer = None;
                if !q.spec.auto_delete {
                    q.rx = rx;
                }
                q.spec.auto_delete
            }
            None => return,
        };
        if auto_delete {
            state.queues.remove(queue);
            state.bindings.retain(|b| b.queue != queue);
        }
    }

    fn settle(&self, queue: &str, routing_key: &str, delivery_tag: u64, outcome: Settlement) {
        let mut state = self.lock();
        match outcome {
            Settlement::Ack => state.acked.push(SettledDelivery {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
                delivery_tag,
                requeued: false,
            }),
            Settlement::Reject { requeue, message } => {
                state.rejected.push(SettledDelivery {
                    queue: queue.to_string(),
                    routing_key: routing_key.to_string(),
                    delivery_tag,
                    requeued: requeue,
                });
                state.after_reject(queue, requeue, message);
            }
        }
    }
}

enum Settlement {
    Ack,
    Reject { requeue: bool, message: QueuedMessage },
}

impl BrokerState {
    fn close_all_channels(&mut self) {
        for (_, closed) in self.channels.drain() {
            let _ = closed.send(true);
        }
    }

    fn publish(&mut self, exchange: &str, routing_key: &str, message: OutgoingMessage) -> Result<()> {
        if !self.exchanges.contains_key(exchange) {
            return Err(TransportError::Topology(format!("no exchange '{exchange}'")));
        }
        let published = PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        };
        self.published.push(published.clone());
        if self.route(&published, false) == 0 {
            self.unroutable.push(published);
        }
        Ok(())
    }

    fn route(&self, published: &PublishedMessage, redelivered: bool) -> usize {
        let mut routed = 0;
        for binding in self
            .bindings
            .iter()
            .filter(|b| b.exchange == published.exchange && b.routing_key == published.routing_key)
        {
            if let Some(queue) = self.queues.get(&binding.queue) {
                let queued = QueuedMessage {
                    exchange: published.exchange.clone(),
                    routing_key: published.routing_key.clone(),
                    message: published.message.clone(),
                    redelivered,
                };
                if queue.tx.send(queued).is_ok() {
                    routed += 1;
                }
            }
        }
        routed
    }

    fn after_reject(&mut self, queue: &str, requeue: bool, mut message: QueuedMessage) {
        let Some(state) = self.queues.get(queue) else {
            return;
        };
        if requeue {
            message.redelivered = true;
            let _ = state.tx.send(message);
            return;
        }
        let Some(dlx) = state.spec.dead_letter_exchange.clone() else {
            return;
        };
        if !self.exchanges.contains_key(&dlx) {
            return;
        }
        let dead = PublishedMessage {
            exchange: dlx,
            routing_key: message.routing_key,
            message: message.message,
        };
        self.route(&dead, false);
        self.dead_lettered.push(dead);
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn Channel>> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(TransportError::Connectivity("memory broker is unreachable".to_string()));
        }
        state.connections += 1;
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        let (closed_tx, closed_rx) = watch::channel(false);
        state.channels.insert(id, closed_tx);

        Ok(Arc::new(MemoryChannel {
            id,
            broker: self.clone(),
            closed: closed_rx,
        }))
    }
}

fn is_closed(closed: &watch::Receiver<bool>) -> bool {
    *closed.borrow() || closed.has_changed().is_err()
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    closed: watch::Receiver<bool>,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if is_closed(&self.closed) {
            return Err(TransportError::ChannelClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn is_open(&self) -> bool {
        !is_closed(&self.closed)
    }

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => Err(TransportError::Topology(format!(
                "exchange '{}' already declared with different properties",
                exchange.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => Err(TransportError::Topology(format!(
                "queue '{}' already declared with different properties",
                queue.name
            ))),
            Some(_) => Ok(()),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                state.queues.insert(
                    queue.name.clone(),
                    QueueState {
                        spec: queue.clone(),
                        tx,
                        rx: Some(rx),
                        consumer: None,
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::Topology(format!("no exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::Topology(format!("no queue '{queue}'")));
        }
        let binding = Binding {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queue: queue.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .lock()
            .bindings
            .retain(|b| !(b.queue == queue && b.exchange == exchange && b.routing_key == routing_key));
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, message: OutgoingMessage) -> Result<()> {
        self.ensure_open()?;
        self.broker.lock().publish(exchange, routing_key, message)
    }

    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let rx = {
            let mut state = self.broker.lock();
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::Topology(format!("no queue '{queue}'")))?;
            let rx = q
                .rx
                .take()
                .ok_or_else(|| TransportError::Topology(format!("queue '{queue}' already has a consumer")))?;
            q.consumer = Some(ConsumerInfo {
                consumer_tag: consumer_tag.to_string(),
                channel_id: self.id,
                prefetch,
            });
            rx
        };

        let permits = if prefetch == 0 {
            Semaphore::MAX_PERMITS
        } else {
            usize::from(prefetch)
        };
        let consumer = ConsumerState {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            rx: Some(rx),
            closed: self.closed.clone(),
            permits: Arc::new(Semaphore::new(permits)),
        };

        Ok(Box::pin(stream::unfold(consumer, |mut consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((Ok(delivery), consumer))
        })))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        if let Some(closed) = state.channels.remove(&self.id) {
            let _ = closed.send(true);
        }
        Ok(())
    }
}

struct ConsumerState {
    broker: MemoryBroker,
    queue: String,
    rx: Option<mpsc::UnboundedReceiver<QueuedMessage>>,
    closed: watch::Receiver<bool>,
    permits: Arc<Semaphore>,
}

impl ConsumerState {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
            _ = wait_closed(&mut self.closed) => return None,
        };
        let rx = self.rx.as_mut()?;
        let queued = tokio::select! {
            queued = rx.recv() => queued?,
            _ = wait_closed(&mut self.closed) => return None,
        };

        let delivery_tag = {
            let mut state = self.broker.lock();
            state.next_delivery_tag += 1;
            state.next_delivery_tag
        };

        Some(Delivery {
            delivery_tag,
            routing_key: queued.routing_key.clone(),
            payload: queued.message.payload.clone(),
            redelivered: queued.redelivered,
            acker: Box::new(MemoryAcker {
                broker: self.broker.clone(),
                queue: self.queue.clone(),
                delivery_tag,
                message: queued,
                closed: self.closed.clone(),
                settled: AtomicBool::new(false),
                permit: Mutex::new(Some(permit)),
            }),
        })
    }
}

impl Drop for ConsumerState {
    fn drop(&mut self) {
        self.broker.release_consumer(&self.queue, self.rx.take());
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    delivery_tag: u64,
    message: QueuedMessage,
    closed: watch::Receiver<bool>,
    settled: AtomicBool,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl MemoryAcker {
    fn begin_settle(&self) -> Result<()> {
        if is_closed(&self.closed) {
            return Err(TransportError::ChannelClosed);
        }
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Protocol(format!(
                "delivery {} already settled",
                self.delivery_tag
            )));
        }
        self.permit.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.begin_settle()?;
        self.broker
            .settle(&self.queue, &self.message.routing_key, self.delivery_tag, Settlement::Ack);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.begin_settle()?;
        self.broker.settle(
            &self.queue,
            &self.message.routing_key,
            self.delivery_tag,
            Settlement::Reject {
                requeue,
                message: self.message.clone(),
            },
        );
        Ok(())
    }
}
