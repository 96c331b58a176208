//! RabbitMQ transport for Tsunagi, built on `lapin`.
//!
//! ```no_run
//! # async fn run() -> tsunagi::Result<()> {
//! use std::sync::Arc;
//! use tsunagi::{EventBus, EventBusConfig, ServiceContainer};
//! use tsunagi_amqp::AmqpBroker;
//!
//! let config = EventBusConfig::from_env()?;
//! let broker = AmqpBroker::new(config.connection_string.clone());
//! let _bus = EventBus::new(config, Arc::new(broker), ServiceContainer::new())?;
//! # Ok(())
//! # }
//! ```

mod broker;
mod error;
mod properties;

pub use broker::{AmqpBroker, AmqpChannel};
pub use error::map_lapin_error;
