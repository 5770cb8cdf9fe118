use thiserror::Error;

use concord_core::{ConfigError, Conflict, ValidationError};
use concord_store::StoreError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("item carries job type '{found}', expected '{expected}'")]
    TypeMismatch { expected: String, found: String },

    #[error("job payload encoding failed: {0}")]
    Payload(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Conflict for SchedulerError {
    fn is_conflict(&self) -> bool {
        matches!(self, SchedulerError::Store(e) if e.is_conflict())
    }

    fn is_transient(&self) -> bool {
        matches!(self, SchedulerError::Store(e) if e.is_transient())
    }
}
