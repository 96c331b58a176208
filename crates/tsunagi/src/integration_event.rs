use crate::event_id::EventId;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

/// Identity and creation time shared by every integration event.
///
/// Fields are private: once an event is constructed neither value can be reassigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventHeader {
    id: EventId,
    created_at: DateTime<Utc>,
}

impl EventHeader {
    pub fn new() -> Self {
        Self {
            id: EventId::new(),
            created_at: Utc::now(),
        }
    }

    /// Rebuilds a header from values supplied by the caller, e.g. when re-emitting a known fact.
    pub fn with_identity(id: EventId, created_at: DateTime<Utc>) -> Self {
        Self { id, created_at }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl Default for EventHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// Facts that cross service boundaries through the event bus.
///
/// `NAME` is the unqualified kind name. It is used as the routing key on the broker and as the key
/// of the handler registry, so it must be unique across the catalog.
pub trait IntegrationEvent: fmt::Debug + Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    fn header(&self) -> &EventHeader;

    fn id(&self) -> EventId {
        self.header().id()
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.header().created_at()
    }

    fn event_type(&self) -> &'static str {
        Self::NAME
    }
}
