use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::debug;

use concord_core::Route;

use crate::document::RawDocument;
use crate::error::StoreError;
use crate::provider::StoreProvider;
use crate::r#trait::{Change, DocumentStore};

#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    body: serde_json::Value,
}

/// In-memory optimistic document store.
///
/// Intended for tests/dev. Writes are serialized behind one lock, which makes
/// every change set trivially atomic. `set_available(false)` makes every call
/// fail with `StoreError::Unavailable` to exercise outage handling.
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Entry>>>,
    available: AtomicBool,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of documents in a collection.
    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store offline".to_string()))
        }
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("lock poisoned".to_string())
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn load(&self, collection: &str, key: &str) -> Result<Option<RawDocument>, StoreError> {
        self.check_available()?;
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;

        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .map(|entry| RawDocument {
                collection: collection.to_string(),
                key: key.to_string(),
                version: entry.version,
                body: entry.body.clone(),
            }))
    }

    fn scan(&self, collection: &str) -> Result<Vec<RawDocument>, StoreError> {
        self.check_available()?;
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;

        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(key, entry)| RawDocument {
                        collection: collection.to_string(),
                        key: key.clone(),
                        version: entry.version,
                        body: entry.body.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    fn commit(&self, changes: Vec<Change>) -> Result<(), StoreError> {
        self.check_available()?;
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;

        // Validate every expectation before touching anything (all or nothing).
        for change in &changes {
            let current = collections
                .get(change.collection())
                .and_then(|docs| docs.get(change.key()))
                .map(|e| e.version);
            if !change.expected().matches(current) {
                debug!(
                    collection = change.collection(),
                    key = change.key(),
                    expected = ?change.expected(),
                    current = ?current,
                    "commit rejected on version mismatch"
                );
                return Err(StoreError::concurrency(change.collection(), change.key()));
            }
        }

        for change in changes {
            match change {
                Change::Put {
                    collection,
                    key,
                    body,
                    ..
                } => {
                    let docs = collections.entry(collection).or_default();
                    let version = docs.get(&key).map_or(1, |e| e.version + 1);
                    docs.insert(key, Entry { version, body });
                }
                Change::Delete {
                    collection, key, ..
                } => {
                    if let Some(docs) = collections.get_mut(&collection) {
                        docs.remove(&key);
                    }
                }
            }
        }

        Ok(())
    }
}

/// One in-memory store per route, created lazily.
#[derive(Debug, Default)]
pub struct InMemoryStoreProvider {
    stores: RwLock<HashMap<Route, Arc<InMemoryDocumentStore>>>,
}

impl InMemoryStoreProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The concrete store behind `route` (tests use it for fault injection).
    pub fn store(&self, route: &Route) -> Result<Arc<InMemoryDocumentStore>, StoreError> {
        if let Some(store) = self
            .stores
            .read()
            .map_err(|_| InMemoryDocumentStore::poisoned())?
            .get(route)
        {
            return Ok(store.clone());
        }

        let mut stores = self
            .stores
            .write()
            .map_err(|_| InMemoryDocumentStore::poisoned())?;
        Ok(stores
            .entry(route.clone())
            .or_insert_with(InMemoryDocumentStore::arc)
            .clone())
    }
}

impl StoreProvider for InMemoryStoreProvider {
    fn open(&self, route: &Route) -> Result<Arc<dyn DocumentStore>, StoreError> {
        let store: Arc<dyn DocumentStore> = self.store(route)?;
        Ok(store)
    }
}
