use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

#[derive(Debug, thiserror::Error)]
pub enum SerdeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("payload tagged as '{actual}' cannot be decoded as '{expected}'")]
    KindMismatch { expected: &'static str, actual: String },
}

pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerdeError>;
}

pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, data: &[u8]) -> Result<T, SerdeError>;
}

/// UTF-8 JSON body. Field naming follows the type's own `serde` attributes.
#[derive(Debug, Clone, Copy)]
pub struct Json<T>(PhantomData<fn() -> T>)
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>;

impl<T> Default for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serializer<T> for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerdeError> {
        Ok(serde_json::to_vec(value)?)
    }
}

impl<T> Deserializer<T> for Json<T>
where
    T: Serialize + Send + Sync,
    for<'d> T: Deserialize<'d>,
{
    fn deserialize(&self, data: &[u8]) -> Result<T, SerdeError> {
        let text = std::str::from_utf8(data)?;
        Ok(serde_json::from_str(text)?)
    }
}
