//! Lease-based distributed mutex.
//!
//! A named lock is a [`LockDocument`] in the shared store. Acquisition is an
//! optimistic write that flips the free sentinel to this instance's identity;
//! a background loop renews the lease while it is held, and a per-process
//! [`LockGroomer`] deletes locks whose holders stopped renewing.
//!
//! This is not a strongly-consistent lock: under pathological clock skew or a
//! store outage two parties may briefly both believe they hold a lease.
//! Holders that need to know call [`LeaseMutex::ensure_held`].

pub mod config;
pub mod document;
pub mod error;
pub mod groomer;
pub mod manager;
pub mod mutex;
mod renewal;

pub use config::LeaseConfig;
pub use document::{LockDocument, lock_key};
pub use error::LeaseError;
pub use groomer::LockGroomer;
pub use manager::LeaseManager;
pub use mutex::LeaseMutex;
