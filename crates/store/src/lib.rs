//! Shared document store contract.
//!
//! The coordination components only need per-document optimistic-concurrency
//! writes, query-by-predicate and load/delete-by-key. This crate defines that
//! contract without making storage assumptions, plus an in-memory
//! implementation for tests/dev.

pub mod document;
pub mod error;
pub mod in_memory;
pub mod provider;
pub mod session;
pub mod r#trait;

pub use document::{Document, ExpectedVersion, RawDocument};
pub use error::StoreError;
pub use in_memory::{InMemoryDocumentStore, InMemoryStoreProvider};
pub use provider::{RoutedStore, StoreProvider};
pub use session::Session;
pub use r#trait::{Change, DocumentStore};
