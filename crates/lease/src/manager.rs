use std::sync::Arc;

use tracing::info;

use concord_core::error::validate_name;
use concord_core::{AlertSink, Clock, SystemClock, TracingAlertSink, WorkerHandle};
use concord_store::RoutedStore;

use crate::config::LeaseConfig;
use crate::document::LockDocument;
use crate::error::LeaseError;
use crate::groomer::LockGroomer;
use crate::mutex::LeaseMutex;

/// Per-process entry point for leases on one route.
///
/// Hands out [`LeaseMutex`]es and owns the route's grooming loop.
pub struct LeaseManager {
    store: RoutedStore,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    config: LeaseConfig,
    groomer: Option<WorkerHandle>,
}

impl std::fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("route", self.store.route())
            .field("config", &self.config)
            .field("grooming", &self.groomer.is_some())
            .finish()
    }
}

impl LeaseManager {
    pub fn new(store: RoutedStore, config: LeaseConfig) -> Result<Self, LeaseError> {
        config.validate()?;
        Ok(Self {
            store,
            clock: Arc::new(SystemClock),
            alerts: Arc::new(TracingAlertSink),
            config,
            groomer: None,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.config
    }

    /// Start the background grooming loop (idempotent).
    pub fn start_grooming(&mut self) {
        if self.groomer.is_none() {
            self.groomer = Some(self.groomer().spawn(self.config.groom_interval));
        }
    }

    /// A new mutex with its own holder identity.
    pub fn mutex(&self, name: &str) -> Result<LeaseMutex, LeaseError> {
        validate_name("lock", name)?;
        Ok(LeaseMutex::new(
            name,
            self.store.clone(),
            self.clock.clone(),
            self.alerts.clone(),
            self.config.clone(),
        ))
    }

    pub fn groomer(&self) -> LockGroomer {
        LockGroomer::new(self.store.clone(), self.clock.clone(), self.config.grace_period)
    }

    /// Delete every lock document on this route, held or not.
    pub fn uninstall(&self) -> Result<usize, LeaseError> {
        let mut session = self.store.session()?;
        let locks: Vec<LockDocument> = session.query(|_: &LockDocument| true)?;
        for lock in &locks {
            session.delete::<LockDocument>(&lock.name);
        }
        session.save_changes()?;
        info!(route = %self.store.route(), removed = locks.len(), "lease documents uninstalled");
        Ok(locks.len())
    }

    /// Stop grooming and wait for the loop to exit.
    pub fn shutdown(mut self) {
        if let Some(groomer) = self.groomer.take() {
            groomer.shutdown();
        }
    }
}
