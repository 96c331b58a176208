use crate::{
    config::EventBusConfig,
    connection::ConnectionManager,
    consumer::Consumer,
    container::ServiceContainer,
    dispatcher::{DispatchStats, Dispatcher, RejectionHook},
    error::{EventBusError, Result},
    handler::{HandlerDescriptor, IntegrationEventHandler},
    integration_event::IntegrationEvent,
    publisher::Publisher,
    registry::{HandlerRegistry, Registration, Removal},
    transport::{Broker, QueueSpec},
};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Publishes integration events and delivers them to the handlers subscribed in this process.
///
/// Clones share one broker channel, one handler registry and one consumer.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    connection: Arc<ConnectionManager>,
    publisher: Publisher,
    registry: Arc<RwLock<HandlerRegistry>>,
    dispatcher: Arc<Dispatcher>,
    consumer: Consumer,
}

impl EventBus {
    pub fn new(config: EventBusConfig, broker: Arc<dyn Broker>, container: ServiceContainer) -> Result<Self> {
        config.validate()?;

        let connection = Arc::new(
            ConnectionManager::new(broker, config.exchange.clone())
                .with_dead_letter_exchange(config.dead_letter_exchange.clone()),
        );
        let registry = Arc::new(RwLock::new(HandlerRegistry::new()));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            container,
            config.handler_timeout,
        ));
        let queue = QueueSpec::ephemeral(config.queue_name()).with_dead_letter_exchange(config.dead_letter_exchange);
        let consumer = Consumer::new(
            Arc::clone(&connection),
            Arc::clone(&dispatcher),
            Arc::clone(&registry),
            queue,
            config.prefetch_count,
            config.reconnect_delay,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                publisher: Publisher::new(Arc::clone(&connection)),
                connection,
                registry,
                dispatcher,
                consumer,
            }),
        })
    }

    /// Name of the queue this process consumes from. Fixed for the lifetime of the bus.
    pub fn queue_name(&self) -> &str {
        self.inner.consumer.queue_name()
    }

    pub fn exchange(&self) -> &str {
        self.inner.connection.exchange()
    }

    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<()> {
        self.ensure_open().await?;
        self.inner.publisher.publish(event).await
    }

    pub async fn publish_batch<E: IntegrationEvent>(&self, events: &[E]) -> Result<()> {
        self.ensure_open().await?;
        self.inner.publisher.publish_batch(events).await
    }

    /// Registers `H` for events of kind `E` and starts consuming on first use.
    ///
    /// Subscribing the same pair twice is a no-op. When the broker cannot be reached the registration is
    /// rolled back and the error returned, so the call can be retried.
    pub async fn subscribe<E, H>(&self) -> Result<()>
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        self.ensure_open().await?;
        let descriptor = HandlerDescriptor::of::<E, H>();

        let registration = self.inner.registry.write().await.add(descriptor.clone());
        let first_for_kind = match registration {
            Registration::Added { first_for_kind } => first_for_kind,
            Registration::AlreadyRegistered => {
                warn!("{} is already subscribed to {}", descriptor.handler_name(), E::NAME);
                return Ok(());
            }
        };

        if let Err(err) = self.activate(E::NAME, first_for_kind).await {
            self.inner.registry.write().await.remove(&descriptor);
            return Err(err);
        }
        info!("Subscribed {} to {}", descriptor.handler_name(), E::NAME);
        Ok(())
    }

    async fn activate(&self, kind: &str, first_for_kind: bool) -> Result<()> {
        let started = self.inner.consumer.start().await?;
        if !started && first_for_kind {
            self.inner.connection.bind(self.queue_name(), kind).await?;
        }
        Ok(())
    }

    /// Removes `H` from kind `E`; the kind's routing key is unbound once no handler remains.
    pub async fn unsubscribe<E, H>(&self)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        let descriptor = HandlerDescriptor::of::<E, H>();
        let removal = self.inner.registry.write().await.remove(&descriptor);

        match removal {
            Removal::NotFound => {
                warn!("{} is not subscribed to {}", descriptor.handler_name(), E::NAME);
            }
            Removal::Removed { last_for_kind: false } => {
                info!("Unsubscribed {} from {}", descriptor.handler_name(), E::NAME);
            }
            Removal::Removed { last_for_kind: true } => {
                info!("Unsubscribed {} from {}", descriptor.handler_name(), E::NAME);
                if self.inner.consumer.is_consuming().await {
                    match self.inner.connection.unbind(self.queue_name(), E::NAME).await {
                        Ok(()) => debug!("No handlers left for {}", E::NAME),
                        Err(err) => warn!("Failed to unbind {} from '{}': {}", E::NAME, self.queue_name(), err),
                    }
                }
            }
        }
    }

    pub async fn has_subscriptions_for(&self, kind: &str) -> bool {
        self.inner.registry.read().await.has_subscriptions_for(kind)
    }

    pub async fn subscribed_kinds(&self) -> Vec<&'static str> {
        self.inner.registry.read().await.subscribed_kinds()
    }

    pub async fn is_consuming(&self) -> bool {
        self.inner.consumer.is_consuming().await
    }

    pub fn set_rejection_hook(&self, hook: Arc<dyn RejectionHook>) {
        self.inner.dispatcher.set_rejection_hook(hook);
    }

    pub fn stats(&self) -> DispatchStats {
        self.inner.dispatcher.stats()
    }

    /// Stops consuming, clears every subscription and closes the channel. Later calls fail with
    /// [`EventBusError::Closed`].
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.consumer.stop().await;
        self.inner.registry.write().await.clear();
        self.inner.connection.close().await?;
        info!("Event bus on exchange '{}' shut down", self.exchange());
        Ok(())
    }

    async fn ensure_open(&self) -> Result<()> {
        if self.inner.consumer.is_stopped().await {
            return Err(EventBusError::Closed);
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("exchange", &self.exchange())
            .field("queue", &self.queue_name())
            .finish_non_exhaustive()
    }
}
