//! Unit-of-work over a [`DocumentStore`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use crate::document::{Document, ExpectedVersion, RawDocument};
use crate::error::StoreError;
use crate::r#trait::{Change, DocumentStore};

/// Typed unit of work.
///
/// The session remembers the version of every document it loaded or queried.
/// `store` of a tracked document writes with `ExpectedVersion::Exact`, so the
/// commit fails if anyone changed it since; `store` of an untracked document
/// is an insert (`Absent`). `delete` of an untracked document is
/// unconditional.
///
/// Sessions are short-lived: one read-modify-write, then `save_changes`.
pub struct Session {
    store: Arc<dyn DocumentStore>,
    tracked: HashMap<(&'static str, String), u64>,
    changes: Vec<Change>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tracked", &self.tracked.len())
            .field("pending_changes", &self.changes.len())
            .finish()
    }
}

impl Session {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            tracked: HashMap::new(),
            changes: Vec::new(),
        }
    }

    pub fn load<T: Document>(&mut self, key: &str) -> Result<Option<T>, StoreError> {
        match self.store.load(T::COLLECTION, key)? {
            Some(raw) => Ok(Some(self.track(raw)?)),
            None => Ok(None),
        }
    }

    /// Every document of `T`'s collection matching `predicate`.
    ///
    /// Documents that do not decode as `T` are logged and skipped, so one bad
    /// body cannot hide the rest of the collection.
    pub fn query<T, P>(&mut self, predicate: P) -> Result<Vec<T>, StoreError>
    where
        T: Document,
        P: Fn(&T) -> bool,
    {
        let mut matched = Vec::new();
        for raw in self.store.scan(T::COLLECTION)? {
            let version = raw.version;
            let key = raw.key;
            let doc: T = match serde_json::from_value(raw.body) {
                Ok(doc) => doc,
                Err(e) => {
                    warn!(collection = T::COLLECTION, key = %key, error = %e, "skipping undecodable document");
                    continue;
                }
            };
            if predicate(&doc) {
                self.tracked.insert((T::COLLECTION, key), version);
                matched.push(doc);
            }
        }
        Ok(matched)
    }

    /// Queue an insert (untracked) or a version-checked update (tracked).
    pub fn store<T: Document>(&mut self, doc: &T) -> Result<(), StoreError> {
        let key = doc.key();
        let expected = self.expected_for::<T>(&key, ExpectedVersion::Absent);
        self.changes.push(Change::Put {
            collection: T::COLLECTION.to_string(),
            body: serde_json::to_value(doc)?,
            key,
            expected,
        });
        Ok(())
    }

    /// Queue a delete, version-checked if the document was loaded.
    pub fn delete<T: Document>(&mut self, key: &str) {
        let expected = self.expected_for::<T>(key, ExpectedVersion::Any);
        self.changes.push(Change::Delete {
            collection: T::COLLECTION.to_string(),
            key: key.to_string(),
            expected,
        });
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    /// Commit all queued changes atomically.
    pub fn save_changes(self) -> Result<(), StoreError> {
        if self.changes.is_empty() {
            return Ok(());
        }
        self.store.commit(self.changes)
    }

    fn track<T: Document>(&mut self, raw: RawDocument) -> Result<T, StoreError> {
        let doc = serde_json::from_value(raw.body)?;
        self.tracked.insert((T::COLLECTION, raw.key), raw.version);
        Ok(doc)
    }

    fn expected_for<T: Document>(&self, key: &str, untracked: ExpectedVersion) -> ExpectedVersion {
        self.tracked
            .get(&(T::COLLECTION, key.to_string()))
            .map(|v| ExpectedVersion::Exact(*v))
            .unwrap_or(untracked)
    }
}
