//! Broker port.
//!
//! The bus talks to a message broker only through these traits. A [`Broker`] opens channels, a
//! [`Channel`] declares topology, publishes and starts consumers, and every [`Delivery`] carries an
//! [`Acker`] that settles it. Implementations live in [`crate::mem_broker`] and in the
//! `tsunagi-amqp` crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::{fmt, sync::Arc};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("broker unreachable: {0}")]
    Connectivity(String),
    #[error("channel is closed")]
    ChannelClosed,
    #[error("broker rejected the message: {0}")]
    Rejected(String),
    #[error("topology error: {0}")]
    Topology(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// True when the failure means the broker or channel is gone rather than an operation being refused.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::ChannelClosed)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable, never auto-deleted, direct routing.
    pub fn durable_direct(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    /// Non-durable, auto-deleted, non-exclusive queue owned by one running process.
    pub fn ephemeral(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: true,
            exclusive: false,
            dead_letter_exchange: None,
        }
    }

    #[must_use]
    pub fn with_dead_letter_exchange(mut self, exchange: Option<String>) -> Self {
        self.dead_letter_exchange = exchange;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub payload: Vec<u8>,
    pub content_type: String,
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub persistent: bool,
}

impl OutgoingMessage {
    pub fn new(payload: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            payload,
            content_type: content_type.into(),
            message_id: None,
            message_type: None,
            timestamp: None,
            persistent: false,
        }
    }

    #[must_use]
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    #[must_use]
    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_message_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    pub acker: Box<dyn Acker>,
}

impl Delivery {
    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Ends when the consumer is cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Channel: Send + Sync {
    fn is_open(&self) -> bool;

    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn unbind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Resolves once the broker has accepted the message, not once a consumer has seen it.
    async fn publish(&self, exchange: &str, routing_key: &str, message: OutgoingMessage) -> Result<()>;

    /// Starts a manually acknowledged consumer with at most `prefetch` unsettled deliveries.
    async fn consume(&self, queue: &str, consumer_tag: &str, prefetch: u16) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Opens a fresh connection and channel. Fails fast when the broker cannot be reached.
    async fn connect(&self) -> Result<Arc<dyn Channel>>;
}
