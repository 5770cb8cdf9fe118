use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// A typed document persisted as JSON under `(COLLECTION, key)`.
pub trait Document: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Collection (table / document type) name.
    const COLLECTION: &'static str;

    /// Unique key within the collection.
    fn key(&self) -> String;
}

/// A stored document as the store sees it: untyped body plus version.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub collection: String,
    pub key: String,
    /// Incremented on every successful write; the optimistic-concurrency token.
    pub version: u64,
    pub body: JsonValue,
}

/// Optimistic concurrency expectation for a single write.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// The document must not exist yet (insert).
    Absent,
    /// The document must be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Check against the current version (`None` when the document is missing).
    pub fn matches(self, current: Option<u64>) -> bool {
        match (self, current) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Absent, Some(_)) => false,
            (ExpectedVersion::Exact(v), Some(actual)) => v == actual,
            (ExpectedVersion::Exact(_), None) => false,
        }
    }
}
