use std::sync::Arc;

use serde_json::Value as JsonValue;

use crate::document::{ExpectedVersion, RawDocument};
use crate::error::StoreError;

/// One write in an atomic change set.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Put {
        collection: String,
        key: String,
        body: JsonValue,
        expected: ExpectedVersion,
    },
    Delete {
        collection: String,
        key: String,
        expected: ExpectedVersion,
    },
}

impl Change {
    pub fn collection(&self) -> &str {
        match self {
            Change::Put { collection, .. } | Change::Delete { collection, .. } => collection,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Change::Put { key, .. } | Change::Delete { key, .. } => key,
        }
    }

    pub fn expected(&self) -> ExpectedVersion {
        match self {
            Change::Put { expected, .. } | Change::Delete { expected, .. } => *expected,
        }
    }
}

/// Optimistically-concurrent document store.
///
/// ## Contract
///
/// - `load` returns the current body and version of one document
/// - `scan` returns every document of a collection; predicates are applied by
///   [`crate::Session::query`] (a durable backend may push them down)
/// - `commit` applies a change set **atomically**: every expectation is checked
///   first, and a single mismatch rejects the whole set with
///   [`StoreError::Concurrency`]
///
/// Implementations must be safe to share across threads; every coordination
/// component talks to the same handle concurrently.
pub trait DocumentStore: Send + Sync {
    fn load(&self, collection: &str, key: &str) -> Result<Option<RawDocument>, StoreError>;

    fn scan(&self, collection: &str) -> Result<Vec<RawDocument>, StoreError>;

    fn commit(&self, changes: Vec<Change>) -> Result<(), StoreError>;
}

impl<S> DocumentStore for Arc<S>
where
    S: DocumentStore + ?Sized,
{
    fn load(&self, collection: &str, key: &str) -> Result<Option<RawDocument>, StoreError> {
        (**self).load(collection, key)
    }

    fn scan(&self, collection: &str) -> Result<Vec<RawDocument>, StoreError> {
        (**self).scan(collection)
    }

    fn commit(&self, changes: Vec<Change>) -> Result<(), StoreError> {
        (**self).commit(changes)
    }
}
