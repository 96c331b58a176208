use crate::{config::ConfigError, serde::SerdeError, transport::TransportError};

#[derive(thiserror::Error, Debug)]
pub enum EventBusError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("serialization error: {0}")]
    Serialization(#[from] SerdeError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("event bus has been shut down")]
    Closed,
}

impl EventBusError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Transport(err) if err.is_connectivity())
    }
}

pub type Result<T> = std::result::Result<T, EventBusError>;
