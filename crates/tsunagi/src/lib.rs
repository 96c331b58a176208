//! Tsunagi connects services through integration events carried by a message broker.
//!
//! Events are published to one shared direct exchange, routed by their type name, and delivered to
//! a private queue per running process. Handlers are registered as descriptors and resolved from a
//! [`ServiceContainer`] on every delivery.

pub mod bus;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod connection;
mod consumer;
pub mod container;
pub mod dispatcher;
pub mod error;
pub mod event_id;
pub mod handler;
pub mod integration_event;
pub mod mem_broker;
pub mod publisher;
pub mod registry;
pub mod serde;
pub mod transport;

pub use bus::EventBus;
pub use config::{ConfigError, EventBusConfig, EventBusConfigBuilder};
pub use container::ServiceContainer;
pub use dispatcher::{DeliveryOutcome, DispatchError, DispatchStats, RejectedDelivery, RejectionHook};
pub use error::{EventBusError, Result};
pub use event_id::EventId;
pub use handler::{HandlerDescriptor, HandlerError, IntegrationEventHandler};
pub use integration_event::{EventHeader, IntegrationEvent};
pub use mem_broker::MemoryBroker;
pub use transport::{Broker, Channel, TransportError};
