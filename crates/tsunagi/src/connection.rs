use crate::transport::{
    Broker, Channel, DeliveryStream, ExchangeSpec, OutgoingMessage, QueueSpec, Result, TransportError,
};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Owns the single broker channel of a bus instance.
///
/// Every operation runs while holding the channel lock, so publishes from concurrent tasks and
/// topology changes from the consumer never interleave on the channel. A missing or closed channel is
/// replaced lazily on the next operation; the exchange is redeclared each time.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    exchange: ExchangeSpec,
    dead_letter_exchange: Option<ExchangeSpec>,
    channel: Mutex<Option<Arc<dyn Channel>>>,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: ExchangeSpec::durable_direct(exchange),
            dead_letter_exchange: None,
            channel: Mutex::new(None),
        }
    }

    /// Also declares `exchange` whenever the channel is (re)established.
    #[must_use]
    pub fn with_dead_letter_exchange(mut self, exchange: Option<String>) -> Self {
        self.dead_letter_exchange = exchange.map(ExchangeSpec::durable_direct);
        self
    }

    pub fn exchange(&self) -> &str {
        &self.exchange.name
    }

    pub async fn is_connected(&self) -> bool {
        matches!(&*self.channel.lock().await, Some(channel) if channel.is_open())
    }

    /// Returns an open channel, reconnecting and redeclaring the exchange when needed.
    pub async fn ensure_ready(&self) -> Result<Arc<dyn Channel>> {
        let mut slot = self.channel.lock().await;
        self.ready(&mut slot).await
    }

    async fn ready(&self, slot: &mut MutexGuard<'_, Option<Arc<dyn Channel>>>) -> Result<Arc<dyn Channel>> {
        if let Some(channel) = &**slot {
            if channel.is_open() {
                return Ok(Arc::clone(channel));
            }
            warn!("Broker channel is closed, reconnecting");
            **slot = None;
        }

        let channel = self.broker.connect().await?;
        channel.declare_exchange(&self.exchange).await?;
        if let Some(dlx) = &self.dead_letter_exchange {
            channel.declare_exchange(dlx).await?;
        }
        info!("Connected to broker, exchange '{}' declared", self.exchange.name);

        **slot = Some(Arc::clone(&channel));
        Ok(channel)
    }

    pub async fn publish(&self, routing_key: &str, message: OutgoingMessage) -> Result<()> {
        let mut slot = self.channel.lock().await;
        let channel = self.ready(&mut slot).await?;
        let result = channel.publish(&self.exchange.name, routing_key, message).await;
        if matches!(result, Err(TransportError::ChannelClosed)) {
            *slot = None;
        }
        result
    }

    pub async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let mut slot = self.channel.lock().await;
        self.ready(&mut slot).await?.declare_queue(queue).await
    }

    pub async fn bind(&self, queue: &str, routing_key: &str) -> Result<()> {
        let mut slot = self.channel.lock().await;
        let channel = self.ready(&mut slot).await?;
        channel.bind_queue(queue, &self.exchange.name, routing_key).await?;
        debug!("Bound '{}' to queue '{}'", routing_key, queue);
        Ok(())
    }

    pub async fn unbind(&self, queue: &str, routing_key: &str) -> Result<()> {
        let mut slot = self.channel.lock().await;
        let channel = self.ready(&mut slot).await?;
        channel.unbind_queue(queue, &self.exchange.name, routing_key).await?;
        debug!("Unbound '{}' from queue '{}'", routing_key, queue);
        Ok(())
    }

    pub async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream> {
        let mut slot = self.channel.lock().await;
        self.ready(&mut slot).await?.consume(queue, consumer_tag, prefetch).await
    }

    pub async fn close(&self) -> Result<()> {
        let mut slot = self.channel.lock().await;
        match slot.take() {
            Some(channel) if channel.is_open() => channel.close().await,
            _ => Ok(()),
        }
    }
}
