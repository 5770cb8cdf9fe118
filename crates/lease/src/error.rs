use thiserror::Error;

use concord_core::{ConfigError, ValidationError};
use concord_store::StoreError;

#[derive(Debug, Error)]
pub enum LeaseError {
    /// Renewal failed past its retry bound, or the store shows another owner.
    /// The holder must stop assuming exclusivity.
    #[error("lease '{name}' abandoned: {reason}")]
    Abandoned { name: String, reason: String },

    #[error("lease '{name}' is not held")]
    NotHeld { name: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
