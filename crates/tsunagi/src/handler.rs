use crate::{codec, container::ServiceContainer, integration_event::IntegrationEvent, serde::SerdeError};
use async_trait::async_trait;
use std::{
    any::{type_name, Any, TypeId},
    error::Error as StdError,
    fmt,
    marker::PhantomData,
    sync::Arc,
    time::Duration,
};

#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),
    #[error("{0}")]
    Other(Box<dyn StdError + Send + Sync>),
    #[error("no instance of {0} is registered in the service container")]
    Unresolved(&'static str),
    #[error("handler did not finish within {0:?}")]
    TimedOut(Duration),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Other(Box::new(err))
    }
}

/// Reacts to integration events of kind `E`.
#[async_trait]
pub trait IntegrationEventHandler<E>: Send + Sync + 'static
where
    E: IntegrationEvent,
{
    async fn handle(&self, event: E) -> Result<(), HandlerError>;
}

type DecodeFn = fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>, SerdeError>;

/// Type-erased token for one event kind: its routing name and how to decode it.
#[derive(Clone, Copy)]
pub struct EventKind {
    name: &'static str,
    type_id: TypeId,
    decode: DecodeFn,
}

impl EventKind {
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::NAME,
            type_id: TypeId::of::<E>(),
            decode: decode_erased::<E>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn decode(&self, payload: &[u8]) -> Result<DecodedEvent, SerdeError> {
        Ok(DecodedEvent {
            kind: self.name,
            event: (self.decode)(payload)?,
        })
    }
}

impl fmt::Debug for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventKind").field(&self.name).finish()
    }
}

impl PartialEq for EventKind {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for EventKind {}

fn decode_erased<E: IntegrationEvent>(payload: &[u8]) -> Result<Arc<dyn Any + Send + Sync>, SerdeError> {
    let event: E = codec::decode(E::NAME, payload)?;
    Ok(Arc::new(event))
}

/// An event decoded once per delivery and shared by every handler of its kind.
#[derive(Clone)]
pub struct DecodedEvent {
    kind: &'static str,
    event: Arc<dyn Any + Send + Sync>,
}

impl DecodedEvent {
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn downcast_ref<E: IntegrationEvent>(&self) -> Option<&E> {
        self.event.downcast_ref::<E>()
    }

    /// Event id of the decoded value, when it is of kind `E`.
    pub fn event_id<E: IntegrationEvent>(&self) -> Option<String> {
        self.downcast_ref::<E>().map(|event| event.id().to_string())
    }
}

impl fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedEvent").field("kind", &self.kind).finish_non_exhaustive()
    }
}

#[async_trait]
trait ErasedHandler: Send + Sync {
    async fn invoke(&self, container: &ServiceContainer, event: &DecodedEvent) -> Result<(), HandlerError>;

    fn event_id(&self, event: &DecodedEvent) -> Option<String>;
}

struct TypedHandler<E, H>(PhantomData<fn() -> (E, H)>);

#[async_trait]
impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E>,
{
    async fn invoke(&self, container: &ServiceContainer, event: &DecodedEvent) -> Result<(), HandlerError> {
        let event = event
            .downcast_ref::<E>()
            .cloned()
            .ok_or_else(|| HandlerError::failed(format!("delivery of kind {} is not a {}", event.kind, E::NAME)))?;
        let handler = container
            .resolve::<H>()
            .ok_or(HandlerError::Unresolved(type_name::<H>()))?;
        handler.handle(event).await
    }

    fn event_id(&self, event: &DecodedEvent) -> Option<String> {
        event.event_id::<E>()
    }
}

/// Identifies one handler type subscribed to one event kind.
///
/// A descriptor holds no handler instance. The handler is resolved from the [`ServiceContainer`] on
/// every invocation. Two descriptors are equal when they name the same kind and the same handler type.
#[derive(Clone)]
pub struct HandlerDescriptor {
    kind: EventKind,
    handler_type: TypeId,
    handler_name: &'static str,
    invoker: Arc<dyn ErasedHandler>,
}

impl HandlerDescriptor {
    pub fn of<E, H>() -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E>,
    {
        Self {
            kind: EventKind::of::<E>(),
            handler_type: TypeId::of::<H>(),
            handler_name: type_name::<H>(),
            invoker: Arc::new(TypedHandler::<E, H>(PhantomData)),
        }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn handler_type(&self) -> TypeId {
        self.handler_type
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler_name
    }

    pub async fn invoke(&self, container: &ServiceContainer, event: &DecodedEvent) -> Result<(), HandlerError> {
        self.invoker.invoke(container, event).await
    }

    pub fn event_id(&self, event: &DecodedEvent) -> Option<String> {
        self.invoker.event_id(event)
    }
}

impl PartialEq for HandlerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.handler_type == other.handler_type
    }
}

impl Eq for HandlerDescriptor {}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("kind", &self.kind.name())
            .field("handler", &self.handler_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ProductCreatedEvent, ProductDeletedEvent};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CatalogProjection {
        seen: Mutex<Vec<ProductCreatedEvent>>,
    }

    #[async_trait]
    impl IntegrationEventHandler<ProductCreatedEvent> for CatalogProjection {
        async fn handle(&self, event: ProductCreatedEvent) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(event);
            Ok(())
        }
    }

    #[async_trait]
    impl IntegrationEventHandler<ProductDeletedEvent> for CatalogProjection {
        async fn handle(&self, _event: ProductDeletedEvent) -> Result<(), HandlerError> {
            Err(HandlerError::failed("catalog is read-only"))
        }
    }

    struct SearchIndexer;

    #[async_trait]
    impl IntegrationEventHandler<ProductCreatedEvent> for SearchIndexer {
        async fn handle(&self, _event: ProductCreatedEvent) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn payload(event: &ProductCreatedEvent) -> Vec<u8> {
        codec::encode(event).unwrap().payload
    }

    #[test]
    fn test_descriptor_equality_is_by_kind_and_handler() {
        let a = HandlerDescriptor::of::<ProductCreatedEvent, CatalogProjection>();
        let b = HandlerDescriptor::of::<ProductCreatedEvent, CatalogProjection>();
        let other_handler = HandlerDescriptor::of::<ProductCreatedEvent, SearchIndexer>();
        let other_kind = HandlerDescriptor::of::<ProductDeletedEvent, CatalogProjection>();

        assert_eq!(a, b);
        assert_ne!(a, other_handler);
        assert_ne!(a, other_kind);
        assert_eq!(a.kind_name(), "ProductCreatedEvent");
        assert!(a.handler_name().ends_with("CatalogProjection"));
    }

    #[test]
    fn test_kind_decodes_payload() {
        let event = ProductCreatedEvent::new("P1", "Castle", 149.99, 12, "c-1");
        let decoded = EventKind::of::<ProductCreatedEvent>().decode(&payload(&event)).unwrap();

        assert_eq!(decoded.kind(), "ProductCreatedEvent");
        assert_eq!(decoded.downcast_ref::<ProductCreatedEvent>(), Some(&event));
        assert!(decoded.downcast_ref::<ProductDeletedEvent>().is_none());
    }

    #[test]
    fn test_kind_reports_malformed_payload() {
        let result = EventKind::of::<ProductCreatedEvent>().decode(b"not json");
        assert!(matches!(result, Err(SerdeError::JsonError(_))));
    }

    #[tokio::test]
    async fn test_invoke_resolves_handler_from_container() {
        let container = ServiceContainer::new();
        container.register_singleton(CatalogProjection::default());

        let event = ProductCreatedEvent::new("P1", "Castle", 149.99, 12, "c-1");
        let decoded = EventKind::of::<ProductCreatedEvent>().decode(&payload(&event)).unwrap();
        let descriptor = HandlerDescriptor::of::<ProductCreatedEvent, CatalogProjection>();

        descriptor.invoke(&container, &decoded).await.unwrap();

        let projection = container.resolve::<CatalogProjection>().unwrap();
        assert_eq!(*projection.seen.lock().unwrap(), vec![event.clone()]);
        assert_eq!(descriptor.event_id(&decoded), Some(event.id().to_string()));
    }

    #[tokio::test]
    async fn test_invoke_without_registration_is_unresolved() {
        let container = ServiceContainer::new();
        let event = ProductCreatedEvent::new("P1", "Castle", 149.99, 12, "c-1");
        let decoded = EventKind::of::<ProductCreatedEvent>().decode(&payload(&event)).unwrap();

        let err = HandlerDescriptor::of::<ProductCreatedEvent, SearchIndexer>()
            .invoke(&container, &decoded)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Unresolved(name) if name.ends_with("SearchIndexer")));
    }

    #[tokio::test]
    async fn test_handler_failure_is_returned() {
        let container = ServiceContainer::new();
        container.register_singleton(CatalogProjection::default());
        let event = ProductDeletedEvent::new("P1");
        let decoded = EventKind::of::<ProductDeletedEvent>()
            .decode(&codec::encode(&event).unwrap().payload)
            .unwrap();

        let err = HandlerDescriptor::of::<ProductDeletedEvent, CatalogProjection>()
            .invoke(&container, &decoded)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "catalog is read-only");
    }
}
