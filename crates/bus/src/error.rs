use thiserror::Error;

use concord_core::{ConfigError, Conflict, RetryError, ValidationError};
use concord_store::StoreError;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error("envelope carries '{found}', expected '{expected}'")]
    TypeMismatch { expected: String, found: String },

    #[error("payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Conflict for BusError {
    fn is_conflict(&self) -> bool {
        matches!(self, BusError::Store(e) if e.is_conflict())
    }

    fn is_transient(&self) -> bool {
        matches!(self, BusError::Store(e) if e.is_transient())
    }
}

impl From<RetryError<BusError>> for BusError {
    fn from(value: RetryError<BusError>) -> Self {
        value.into_inner().unwrap_or(BusError::Cancelled)
    }
}

impl From<RetryError<StoreError>> for BusError {
    fn from(value: RetryError<StoreError>) -> Self {
        value.into_inner().map_or(BusError::Cancelled, BusError::Store)
    }
}
