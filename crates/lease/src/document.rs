use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use concord_core::InstanceId;
use concord_store::Document;

/// Normalized document key for a lock name.
pub fn lock_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Persistent state of one named lease.
///
/// `acquirer == None` is the free state. After every successful
/// acquire/renew, `expiration_time == acquired_time + unused_expiration`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDocument {
    pub name: String,
    pub acquirer: Option<InstanceId>,
    pub acquired_time: DateTime<Utc>,
    pub expiration_time: DateTime<Utc>,
    /// Lease duration in milliseconds.
    pub unused_expiration_ms: u64,
}

impl Document for LockDocument {
    const COLLECTION: &'static str = "locks";

    fn key(&self) -> String {
        self.name.clone()
    }
}

impl LockDocument {
    /// A lock nobody holds yet.
    pub fn free(name: &str, lease: Duration, now: DateTime<Utc>) -> Self {
        let lease_ms = lease.as_millis() as u64;
        Self {
            name: lock_key(name),
            acquirer: None,
            acquired_time: now,
            expiration_time: now + chrono::Duration::milliseconds(lease_ms as i64),
            unused_expiration_ms: lease_ms,
        }
    }

    pub fn is_free(&self) -> bool {
        self.acquirer.is_none()
    }

    pub fn is_held_by(&self, instance: InstanceId) -> bool {
        self.acquirer == Some(instance)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.unused_expiration_ms as i64)
    }

    /// Hand the lease to `holder` starting at `now`.
    pub fn grant(&mut self, holder: InstanceId, now: DateTime<Utc>) {
        self.acquirer = Some(holder);
        self.extend(now);
    }

    /// Push the lease window forward from `now`.
    pub fn extend(&mut self, now: DateTime<Utc>) {
        self.acquired_time = now;
        self.expiration_time = now + self.lease();
    }

    pub fn clear(&mut self) {
        self.acquirer = None;
    }

    /// Expired beyond the grace period, i.e. safe to groom.
    pub fn is_stale(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        let grace = chrono::Duration::milliseconds(grace.as_millis() as i64);
        self.expiration_time < now - grace
    }
}
