use crate::{
    integration_event::IntegrationEvent,
    serde::{Deserializer, Json, SerdeError, Serializer},
};

pub const CONTENT_TYPE: &str = "application/json";

/// Transport payload of one event, tagged with its kind name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedEvent {
    pub kind: &'static str,
    pub event_id: String,
    pub payload: Vec<u8>,
}

pub fn encode<E: IntegrationEvent>(event: &E) -> Result<EncodedEvent, SerdeError> {
    Ok(EncodedEvent {
        kind: E::NAME,
        event_id: event.id().to_string(),
        payload: Json::<E>::default().serialize(event)?,
    })
}

/// Decodes `payload` as `E`, refusing payloads whose routing kind names a different event type.
pub fn decode<E: IntegrationEvent>(kind: &str, payload: &[u8]) -> Result<E, SerdeError> {
    if kind != E::NAME {
        return Err(SerdeError::KindMismatch {
            expected: E::NAME,
            actual: kind.to_string(),
        });
    }
    Json::<E>::default().deserialize(payload)
}
