use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use concord_core::retry::{self, RetryPolicy};
use concord_core::{Alert, AlertKind, AlertSink, Clock, InstanceId, Shutdown, WorkerHandle};
use concord_store::{RoutedStore, StoreError};

use crate::config::LeaseConfig;
use crate::document::{LockDocument, lock_key};
use crate::error::LeaseError;
use crate::renewal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LeaseState {
    Free,
    Held,
    Abandoned(String),
}

/// Everything the renewal loop shares with its mutex.
pub(crate) struct LeaseShared {
    pub(crate) name: String,
    pub(crate) instance: InstanceId,
    pub(crate) store: RoutedStore,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) alerts: Arc<dyn AlertSink>,
    pub(crate) config: LeaseConfig,
    state: Mutex<LeaseState>,
}

pub(crate) enum Renewal {
    Extended,
    Lost(String),
}

impl LeaseShared {
    fn state(&self) -> MutexGuard<'_, LeaseState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: LeaseState) {
        *self.state() = state;
    }

    /// One acquisition attempt. `Ok(false)` means someone else holds it or won
    /// the race.
    fn try_acquire(&self) -> Result<bool, StoreError> {
        self.ensure_document()?;

        let mut session = self.store.session()?;
        let Some(mut doc) = session.load::<LockDocument>(&self.name)? else {
            // Groomed between create and load; the next attempt recreates it.
            return Ok(false);
        };
        if !(doc.is_free() || doc.is_held_by(self.instance)) {
            return Ok(false);
        }

        doc.grant(self.instance, self.clock.now());
        session.store(&doc)?;
        match session.save_changes() {
            Ok(()) => Ok(true),
            Err(StoreError::Concurrency { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the lock in the free state if nobody has yet.
    fn ensure_document(&self) -> Result<(), StoreError> {
        let mut session = self.store.session()?;
        if session.load::<LockDocument>(&self.name)?.is_some() {
            return Ok(());
        }
        session.store(&LockDocument::free(
            &self.name,
            self.config.lease_duration,
            self.clock.now(),
        ))?;
        match session.save_changes() {
            // Lost a creation race: the document exists, which is all we need.
            Ok(()) | Err(StoreError::Concurrency { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn renew_once(&self) -> Result<Renewal, StoreError> {
        let mut session = self.store.session()?;
        let Some(mut doc) = session.load::<LockDocument>(&self.name)? else {
            return Ok(Renewal::Lost("lock document disappeared".to_string()));
        };
        if !doc.is_held_by(self.instance) {
            return Ok(Renewal::Lost("lock is held by another instance".to_string()));
        }

        doc.extend(self.clock.now());
        session.store(&doc)?;
        session.save_changes()?;
        Ok(Renewal::Extended)
    }

    /// Clear ownership in the store iff this instance holds it.
    fn clear_ownership(&self) -> Result<bool, StoreError> {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));
        retry::on_conflict(&policy, |_| {
            let mut session = self.store.session()?;
            match session.load::<LockDocument>(&self.name)? {
                Some(mut doc) if doc.is_held_by(self.instance) => {
                    doc.clear();
                    session.store(&doc)?;
                    session.save_changes()?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .map_err(|e| match e.into_inner() {
            Some(inner) => inner,
            None => StoreError::Unavailable("release cancelled".to_string()),
        })
    }

    pub(crate) fn abandon(&self, reason: String) {
        error!(
            lock = %self.name,
            instance = %self.instance,
            %reason,
            "lease abandoned; exclusivity can no longer be assumed"
        );
        self.alerts.raise(
            Alert::new(AlertKind::LeaseAbandoned, "lease abandoned")
                .detail("lock", &self.name)
                .detail("instance", self.instance)
                .detail("reason", &reason),
        );
        self.set_state(LeaseState::Abandoned(reason));
    }
}

/// A named, lease-based distributed mutex.
///
/// Obtain one from [`crate::LeaseManager::mutex`]. Each `LeaseMutex` has its
/// own identity, so two handles for the same name exclude each other even in
/// one process. Dropping the mutex releases it.
pub struct LeaseMutex {
    shared: Arc<LeaseShared>,
    cancel: Shutdown,
    renewal: Mutex<Option<WorkerHandle>>,
}

impl std::fmt::Debug for LeaseMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseMutex")
            .field("name", &self.shared.name)
            .field("instance", &self.shared.instance)
            .field("state", &*self.shared.state())
            .finish()
    }
}

impl LeaseMutex {
    pub(crate) fn new(
        name: &str,
        store: RoutedStore,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            shared: Arc::new(LeaseShared {
                name: lock_key(name),
                instance: InstanceId::new(),
                store,
                clock,
                alerts,
                config,
                state: Mutex::new(LeaseState::Free),
            }),
            cancel: Shutdown::new(),
            renewal: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The holder identity this mutex writes into the lock document.
    pub fn instance(&self) -> InstanceId {
        self.shared.instance
    }

    /// Try to acquire without blocking. True iff this mutex now holds the lease.
    pub fn open(&self) -> bool {
        if self.cancel.is_triggered() {
            return false;
        }

        let mut slot = self.renewal_slot();
        if self.is_held() {
            return true;
        }
        // A finished renewal loop from an abandoned lease.
        slot.take();

        match self.shared.try_acquire() {
            Ok(true) => {
                self.shared.set_state(LeaseState::Held);
                *slot = Some(renewal::spawn(self.shared.clone()));
                info!(lock = %self.shared.name, instance = %self.shared.instance, "lease acquired");
                true
            }
            Ok(false) => false,
            Err(e) => {
                debug!(lock = %self.shared.name, error = %e, "lease acquisition attempt failed");
                false
            }
        }
    }

    /// Poll [`open`](Self::open) until acquired, `timeout` elapses, or the
    /// mutex is disposed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.open() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let pause = self.shared.config.poll_interval.min(deadline - now);
            if self.cancel.wait_timeout(pause) {
                return false;
            }
        }
    }

    /// Stop renewing and clear ownership if, per the store, this mutex is the
    /// holder. Returns true if ownership was cleared.
    pub fn release(&self) -> bool {
        // Stop renewing first so the loop cannot re-extend a released lease.
        let worker = self.renewal_slot().take();
        drop(worker);
        self.shared.set_state(LeaseState::Free);

        match self.shared.clear_ownership() {
            Ok(true) => {
                info!(lock = %self.shared.name, instance = %self.shared.instance, "lease released");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(
                    lock = %self.shared.name,
                    error = %e,
                    "failed to release lease; it will expire and be groomed"
                );
                false
            }
        }
    }

    /// Release and refuse further acquisition. Interrupts a concurrent `wait`.
    pub fn dispose(&self) {
        self.cancel.trigger();
        self.release();
    }

    /// Whether this mutex believes it holds the lease.
    pub fn is_held(&self) -> bool {
        *self.shared.state() == LeaseState::Held
    }

    /// `Ok` while held; `Abandoned` once renewal has failed.
    pub fn ensure_held(&self) -> Result<(), LeaseError> {
        match &*self.shared.state() {
            LeaseState::Held => Ok(()),
            LeaseState::Abandoned(reason) => Err(LeaseError::Abandoned {
                name: self.shared.name.clone(),
                reason: reason.clone(),
            }),
            LeaseState::Free => Err(LeaseError::NotHeld {
                name: self.shared.name.clone(),
            }),
        }
    }

    fn renewal_slot(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        match self.renewal.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for LeaseMutex {
    fn drop(&mut self) {
        if self.is_held() || self.renewal_slot().is_some() {
            self.dispose();
        } else {
            self.cancel.trigger();
        }
    }
}
