use crate::{
    codec::{self, CONTENT_TYPE},
    connection::ConnectionManager,
    error::Result,
    integration_event::IntegrationEvent,
    transport::OutgoingMessage,
};
use std::sync::Arc;
use tracing::debug;

/// Sends integration events to the shared exchange, routed by kind name.
#[derive(Clone)]
pub struct Publisher {
    connection: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    /// Returns once the broker has accepted the message. Nothing is retried here.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<()> {
        let encoded = codec::encode(event)?;
        let message = OutgoingMessage::new(encoded.payload, CONTENT_TYPE)
            .persistent()
            .with_message_id(encoded.event_id.clone())
            .with_message_type(encoded.kind)
            .with_timestamp(event.created_at());

        self.connection.publish(encoded.kind, message).await?;
        debug!("Published {} {}", encoded.kind, encoded.event_id);
        Ok(())
    }

    /// Publishes in order and stops at the first failure.
    pub async fn publish_batch<E: IntegrationEvent>(&self, events: &[E]) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}
