use thiserror::Error;

use concord_core::Conflict;

/// Document store operation error.
///
/// These are infrastructure errors. `Concurrency` is the distinguishable
/// optimistic-write failure every caller treats as an expected, retryable
/// outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("optimistic concurrency check failed for {collection}/{key}")]
    Concurrency { collection: String, key: String },

    #[error("document not found: {collection}/{key}")]
    NotFound { collection: String, key: String },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("document serialization failed: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn concurrency(collection: &str, key: &str) -> Self {
        Self::Concurrency {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }

    pub fn not_found(collection: &str, key: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }
}

impl Conflict for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Concurrency { .. })
    }

    fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Concurrency { .. } | StoreError::Unavailable(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        StoreError::Serialization(value.to_string())
    }
}
