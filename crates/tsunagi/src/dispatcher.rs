use crate::{
    container::ServiceContainer,
    handler::{DecodedEvent, HandlerDescriptor, HandlerError},
    registry::HandlerRegistry,
    serde::SerdeError,
    transport::Delivery,
};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock as StdRwLock},
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("failed to decode {kind}: {source}")]
    Deserialization {
        kind: String,
        #[source]
        source: SerdeError,
    },
    #[error("handler {handler} failed: {source}")]
    Handler {
        handler: &'static str,
        #[source]
        source: HandlerError,
    },
}

/// What the dispatcher decided for one delivery.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// Every handler succeeded; the delivery is acked.
    Acknowledged,
    /// No handler is registered for the routing key; the delivery is acked and dropped.
    Unroutable,
    /// Decoding or at least one handler failed; the delivery is rejected without requeue.
    Rejected(Vec<DispatchError>),
}

impl DeliveryOutcome {
    pub fn is_acked(&self) -> bool {
        matches!(self, Self::Acknowledged | Self::Unroutable)
    }
}

/// A delivery the dispatcher rejected, handed to the [`RejectionHook`].
#[derive(Debug)]
pub struct RejectedDelivery<'a> {
    pub kind: &'a str,
    pub payload: &'a [u8],
    /// Present when the payload could be decoded.
    pub event_id: Option<String>,
    pub errors: &'a [DispatchError],
}

/// Observes rejected deliveries, for example to park them somewhere an operator can inspect.
#[async_trait]
pub trait RejectionHook: Send + Sync + 'static {
    async fn on_rejected(&self, rejected: RejectedDelivery<'_>);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub received: u64,
    pub acknowledged: u64,
    pub unroutable: u64,
    pub rejected: u64,
    pub received_by_kind: HashMap<String, u64>,
}

/// Routes decoded deliveries to the handlers registered for their kind.
pub struct Dispatcher {
    registry: Arc<RwLock<HandlerRegistry>>,
    container: ServiceContainer,
    handler_timeout: Duration,
    hook: StdRwLock<Option<Arc<dyn RejectionHook>>>,
    stats: Mutex<DispatchStats>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RwLock<HandlerRegistry>>, container: ServiceContainer, handler_timeout: Duration) -> Self {
        Self {
            registry,
            container,
            handler_timeout,
            hook: StdRwLock::new(None),
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    pub fn set_rejection_hook(&self, hook: Arc<dyn RejectionHook>) {
        *self.hook.write().unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Dispatches and settles one delivery: acked unless it was rejected.
    pub async fn handle_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        let outcome = self.dispatch(&delivery.routing_key, &delivery.payload).await;

        let settled = if outcome.is_acked() {
            delivery.ack().await
        } else {
            delivery.reject(false).await
        };
        if let Err(err) = settled {
            error!(
                "Failed to settle delivery {} of {}: {}",
                delivery.delivery_tag, delivery.routing_key, err
            );
        }
        outcome
    }

    pub async fn dispatch(&self, kind_name: &str, payload: &[u8]) -> DeliveryOutcome {
        self.record(|stats| {
            stats.received += 1;
            *stats.received_by_kind.entry(kind_name.to_string()).or_default() += 1;
        });

        let (kind, handlers) = {
            let registry = self.registry.read().await;
            (registry.kind(kind_name), registry.handlers_for(kind_name))
        };
        let Some(kind) = kind.filter(|_| !handlers.is_empty()) else {
            warn!("No handler registered for {}, dropping delivery", kind_name);
            self.record(|stats| stats.unroutable += 1);
            return DeliveryOutcome::Unroutable;
        };

        let event = match kind.decode(payload) {
            Ok(event) => event,
            Err(source) => {
                error!("Failed to decode {}: {}", kind_name, source);
                let errors = vec![DispatchError::Deserialization {
                    kind: kind_name.to_string(),
                    source,
                }];
                return self.reject(kind_name, payload, None, errors).await;
            }
        };
        let event_id = handlers.first().and_then(|descriptor| descriptor.event_id(&event));

        let mut errors = Vec::new();
        for descriptor in &handlers {
            if let Err(source) = self.invoke(descriptor, &event).await {
                error!(
                    "Handler {} failed for {} {}: {}",
                    descriptor.handler_name(),
                    kind_name,
                    event_id.as_deref().unwrap_or("-"),
                    source
                );
                errors.push(DispatchError::Handler {
                    handler: descriptor.handler_name(),
                    source,
                });
            }
        }

        if !errors.is_empty() {
            return self.reject(kind_name, payload, event_id, errors).await;
        }

        debug!("Dispatched {} to {} handler(s)", kind_name, handlers.len());
        self.record(|stats| stats.acknowledged += 1);
        DeliveryOutcome::Acknowledged
    }

    async fn invoke(&self, descriptor: &HandlerDescriptor, event: &DecodedEvent) -> Result<(), HandlerError> {
        match tokio::time::timeout(self.handler_timeout, descriptor.invoke(&self.container, event)).await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::TimedOut(self.handler_timeout)),
        }
    }

    async fn reject(
        &self,
        kind: &str,
        payload: &[u8],
        event_id: Option<String>,
        errors: Vec<DispatchError>,
    ) -> DeliveryOutcome {
        self.record(|stats| stats.rejected += 1);

        let hook = self.hook.read().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(hook) = hook {
            hook.on_rejected(RejectedDelivery {
                kind,
                payload,
                event_id,
                errors: &errors,
            })
            .await;
        }
        DeliveryOutcome::Rejected(errors)
    }

    fn record(&self, update: impl FnOnce(&mut DispatchStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}
