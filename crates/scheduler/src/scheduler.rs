//! Placing, listing and settling scheduled items.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use concord_core::error::validate_name;
use concord_core::retry::{self, RetryPolicy};
use concord_core::{Alert, AlertKind, AlertSink, Clock, ItemId, Route, SystemClock, TracingAlertSink};
use concord_store::{RoutedStore, Session, StoreError, StoreProvider};

use crate::error::SchedulerError;
use crate::item::{Job, ScheduledItem, UniqueScheduleClaim};
use crate::recurrence::Recurrence;

/// Schedules jobs into the store of a route.
///
/// Settling calls ([`reschedule`](Self::reschedule), [`cancel`](Self::cancel))
/// never fail: errors are logged and raised as alerts, and the item stays due.
#[derive(Clone)]
pub struct JobScheduler {
    provider: Arc<dyn StoreProvider>,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler").finish_non_exhaustive()
    }
}

impl JobScheduler {
    pub fn new(provider: Arc<dyn StoreProvider>) -> Self {
        Self {
            provider,
            clock: Arc::new(SystemClock),
            alerts: Arc::new(TracingAlertSink),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn alerts(&self) -> &Arc<dyn AlertSink> {
        &self.alerts
    }

    fn session(&self, route: &Route) -> Result<Session, StoreError> {
        RoutedStore::new(self.provider.clone(), route.clone()).session()
    }

    /// Insert a new item. Always inserts, even if an equal job is scheduled.
    pub fn schedule_job<J: Job>(
        &self,
        route: &Route,
        job: &J,
        time: DateTime<Utc>,
        recurrence: Option<Recurrence>,
    ) -> Result<ItemId, SchedulerError> {
        let item = ScheduledItem::new(route.clone(), job, time, recurrence)?;
        let mut session = self.session(route)?;
        session.store(&item)?;
        session.save_changes()?;
        info!(route = %route, item_id = %item.id, job_type = J::JOB_TYPE, %time, "job scheduled");
        Ok(item.id)
    }

    /// Insert an item under `unique_name` unless a live item already holds
    /// that name. Returns the new id, or `None` when already scheduled.
    pub fn schedule_job_only_once<J: Job>(
        &self,
        route: &Route,
        unique_name: &str,
        job: &J,
        time: DateTime<Utc>,
        recurrence: Option<Recurrence>,
    ) -> Result<Option<ItemId>, SchedulerError> {
        validate_name("schedule", unique_name)?;
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10));
        let scheduled = retry::on_conflict(&policy, |_| {
            self.try_schedule_unique(route, unique_name, job, time, recurrence)
        })
        .map_err(|e| match e.into_inner() {
            Some(inner) => inner,
            None => SchedulerError::Store(StoreError::Unavailable("scheduling cancelled".to_string())),
        })?;

        match scheduled {
            Some(id) => {
                info!(route = %route, item_id = %id, unique_name, job_type = J::JOB_TYPE, %time, "unique job scheduled");
            }
            None => {
                debug!(route = %route, unique_name, "unique job already scheduled");
            }
        }
        Ok(scheduled)
    }

    fn try_schedule_unique<J: Job>(
        &self,
        route: &Route,
        unique_name: &str,
        job: &J,
        time: DateTime<Utc>,
        recurrence: Option<Recurrence>,
    ) -> Result<Option<ItemId>, SchedulerError> {
        let mut session = self.session(route)?;
        let live = session.query(|i: &ScheduledItem| i.unique_name.as_deref() == Some(unique_name))?;
        if !live.is_empty() {
            return Ok(None);
        }

        // A claim left behind without its item is taken over; loading it makes
        // the overwrite version-checked.
        session.load::<UniqueScheduleClaim>(unique_name)?;

        let item = ScheduledItem::new(route.clone(), job, time, recurrence)?.with_unique_name(unique_name);
        session.store(&UniqueScheduleClaim {
            name: unique_name.to_string(),
            item_id: item.id,
        })?;
        session.store(&item)?;
        session.save_changes()?;
        Ok(Some(item.id))
    }

    /// Items whose fire time has passed, oldest first.
    pub fn get_due(&self, route: &Route) -> Result<Vec<ScheduledItem>, SchedulerError> {
        let now = self.clock.now();
        let mut due = self.session(route)?.query(|i: &ScheduledItem| i.is_due(now))?;
        due.sort_by(|a, b| a.time.cmp(&b.time).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    pub fn get_all(&self, route: &Route) -> Result<Vec<ScheduledItem>, SchedulerError> {
        let mut all = self.session(route)?.query(|_: &ScheduledItem| true)?;
        all.sort_by(|a, b| a.time.cmp(&b.time).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    /// Settle a fired item: replace it with its next occurrence, or delete it
    /// when it has none. False if nothing was applied.
    pub fn reschedule(&self, item: &ScheduledItem) -> bool {
        match self.try_reschedule(item) {
            Ok(applied) => applied,
            Err(e) => {
                self.report_failure("reschedule", item, &e);
                false
            }
        }
    }

    fn try_reschedule(&self, item: &ScheduledItem) -> Result<bool, SchedulerError> {
        let key = item.id.to_string();
        let mut session = self.session(&item.route)?;
        let Some(current) = session.load::<ScheduledItem>(&key)? else {
            debug!(item_id = %item.id, "item already settled");
            return Ok(false);
        };

        let next = current.next_occurrence();
        if let Some(next) = &next {
            session.store(next)?;
        }
        session.delete::<ScheduledItem>(&key);
        if let Some(name) = &current.unique_name {
            self.move_claim(&mut session, name, current.id, next.as_ref().map(|n| n.id))?;
        }
        session.save_changes()?;

        match next {
            Some(next) => info!(
                route = %item.route,
                item_id = %item.id,
                next_item_id = %next.id,
                next_time = %next.time,
                "recurring job rescheduled"
            ),
            None => info!(route = %item.route, item_id = %item.id, "job completed"),
        }
        Ok(true)
    }

    /// Delete the item (and its claim) regardless of its recurrence.
    pub fn cancel(&self, item: &ScheduledItem) -> bool {
        match self.try_cancel(item) {
            Ok(()) => {
                info!(route = %item.route, item_id = %item.id, "job cancelled");
                true
            }
            Err(e) => {
                self.report_failure("cancel", item, &e);
                false
            }
        }
    }

    fn try_cancel(&self, item: &ScheduledItem) -> Result<(), SchedulerError> {
        let mut session = self.session(&item.route)?;
        session.delete::<ScheduledItem>(&item.id.to_string());
        if let Some(name) = &item.unique_name {
            self.move_claim(&mut session, name, item.id, None)?;
        }
        session.save_changes()?;
        Ok(())
    }

    /// Point the claim for `name` at `to`, or remove it, if it still names `from`.
    fn move_claim(
        &self,
        session: &mut Session,
        name: &str,
        from: ItemId,
        to: Option<ItemId>,
    ) -> Result<(), SchedulerError> {
        match session.load::<UniqueScheduleClaim>(name)? {
            Some(mut claim) if claim.item_id == from => match to {
                Some(to) => {
                    claim.item_id = to;
                    session.store(&claim)?;
                }
                None => session.delete::<UniqueScheduleClaim>(name),
            },
            _ => {}
        }
        Ok(())
    }

    fn report_failure(&self, operation: &str, item: &ScheduledItem, err: &SchedulerError) {
        if let SchedulerError::Store(StoreError::Concurrency { .. }) = err {
            debug!(item_id = %item.id, operation, "item changed concurrently; left for the next sweep");
            return;
        }
        error!(route = %item.route, item_id = %item.id, operation, error = %err, "scheduler operation failed");
        self.alerts.raise(
            Alert::new(AlertKind::SchedulerFailure, format!("scheduler {operation} failed"))
                .detail("route", &item.route)
                .detail("item_id", item.id)
                .detail("job_type", &item.job_type)
                .detail("error", err),
        );
    }
}
