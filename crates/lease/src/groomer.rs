use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use concord_core::{Clock, Conflict, WorkerHandle};
use concord_store::{RoutedStore, StoreError};

use crate::document::LockDocument;

/// Deletes lock documents whose lease expired more than `grace` ago.
///
/// This is how a lock held by a crashed process becomes acquirable again.
/// Run one per process, independent of holding any lease.
#[derive(Clone)]
pub struct LockGroomer {
    store: RoutedStore,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl std::fmt::Debug for LockGroomer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGroomer")
            .field("route", self.store.route())
            .field("grace", &self.grace)
            .finish()
    }
}

impl LockGroomer {
    pub fn new(store: RoutedStore, clock: Arc<dyn Clock>, grace: Duration) -> Self {
        Self { store, clock, grace }
    }

    /// One sweep. Returns the number of locks deleted.
    pub fn groom_once(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let grace = self.grace;
        let stale: Vec<LockDocument> = self
            .store
            .session()?
            .query(|doc: &LockDocument| doc.is_stale(now, grace))?;

        let mut removed = 0;
        for candidate in stale {
            // One change set per lock: a renewal racing us only spares its own lock.
            let mut session = self.store.session()?;
            match session.load::<LockDocument>(&candidate.name)? {
                Some(doc) if doc.is_stale(now, grace) => {
                    session.delete::<LockDocument>(&doc.name);
                    match session.save_changes() {
                        Ok(()) => {
                            info!(
                                lock = %doc.name,
                                holder = ?doc.acquirer,
                                expired_at = %doc.expiration_time,
                                "groomed expired lock"
                            );
                            removed += 1;
                        }
                        Err(e) if e.is_conflict() => {
                            debug!(lock = %doc.name, "lock changed while grooming; skipped");
                        }
                        Err(e) => return Err(e),
                    }
                }
                _ => {}
            }
        }

        Ok(removed)
    }

    /// Sweep every `interval` on a background thread until the handle drops.
    pub fn spawn(self, interval: Duration) -> WorkerHandle {
        let name = format!("lease-groomer-{}", self.store.route());
        WorkerHandle::spawn(name, move |shutdown| {
            loop {
                if let Err(e) = self.groom_once() {
                    // Swallowed: the next sweep retries.
                    warn!(error = %e, "lock grooming failed");
                }
                if shutdown.wait_timeout(interval) {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{InstanceId, ManualClock, Route};
    use concord_store::InMemoryStoreProvider;

    fn setup() -> (RoutedStore, Arc<ManualClock>, LockGroomer) {
        let store = RoutedStore::new(InMemoryStoreProvider::arc(), Route::new("groom").unwrap());
        let clock = Arc::new(ManualClock::starting_now());
        let groomer = LockGroomer::new(store.clone(), clock.clone(), Duration::from_secs(30));
        (store, clock, groomer)
    }

    fn seed(store: &RoutedStore, name: &str, clock: &ManualClock) {
        let mut doc = LockDocument::free(name, Duration::from_secs(15), clock.now());
        doc.grant(InstanceId::new(), clock.now());
        let mut session = store.session().unwrap();
        session.store(&doc).unwrap();
        session.save_changes().unwrap();
    }

    #[test]
    fn only_locks_past_expiry_plus_grace_are_deleted() {
        let (store, clock, groomer) = setup();
        seed(&store, "old", &clock);
        clock.advance(chrono::Duration::seconds(40));
        seed(&store, "young", &clock);

        // "old" expired 25s ago: still inside the grace period.
        assert_eq!(groomer.groom_once().unwrap(), 0);

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(groomer.groom_once().unwrap(), 1);

        let mut session = store.session().unwrap();
        assert!(session.load::<LockDocument>("old").unwrap().is_none());
        assert!(session.load::<LockDocument>("young").unwrap().is_some());
    }

    #[test]
    fn spawned_groomer_sweeps_in_the_background() {
        let (store, clock, groomer) = setup();
        seed(&store, "old", &clock);
        clock.advance(chrono::Duration::minutes(5));

        let handle = groomer.spawn(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(60));
        handle.shutdown();

        let mut session = store.session().unwrap();
        assert!(session.load::<LockDocument>("old").unwrap().is_none());
    }
}
