//! Shared error vocabulary.

use thiserror::Error;

/// Classifies an error as an optimistic-concurrency conflict.
///
/// Conflicts are an expected outcome of racing writers and are retried by
/// [`crate::retry`]; everything else is treated as a real failure unless the
/// caller opts into retrying it.
pub trait Conflict {
    fn is_conflict(&self) -> bool;

    /// Whether the failure is worth another attempt at all (conflicts and
    /// transient unavailability).
    fn is_transient(&self) -> bool {
        self.is_conflict()
    }
}

/// A value failed validation (names, durations, probabilities).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("validation failed: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Validate a coordination name (lock, exchange, queue, unique schedule).
///
/// Names become document keys, so they must be non-empty and free of the
/// key separator.
pub fn validate_name(kind: &str, name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::new(format!("{kind} name cannot be empty")));
    }
    if name.contains('/') {
        return Err(ValidationError::new(format!(
            "{kind} name '{name}' must not contain '/'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_separator_names() {
        assert!(validate_name("lock", "").is_err());
        assert!(validate_name("lock", "   ").is_err());
        assert!(validate_name("lock", "a/b").is_err());
        assert!(validate_name("lock", "nightly-reindex").is_ok());
    }
}
