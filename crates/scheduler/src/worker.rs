//! Background sweeping of due items.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;

use tracing::{debug, error, warn};

use concord_core::{Alert, AlertKind, ItemId, Route, WorkerHandle};

use crate::config::SchedulerConfig;
use crate::item::{Job, ScheduledItem};
use crate::scheduler::JobScheduler;

/// What a job handler reports back.
pub type JobResult = Result<(), String>;

type JobHandler = Box<dyn Fn(&ScheduledItem) -> JobResult + Send + Sync>;
type SweepGuard = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub due: usize,
    pub completed: usize,
    pub failed: usize,
    pub unhandled: usize,
}

/// Runs registered handlers for the due items of one route.
///
/// After a successful run a recurring item is rescheduled and a one-shot item
/// cancelled. A failing handler leaves the item due for the next sweep.
pub struct SchedulerWorker {
    scheduler: JobScheduler,
    route: Route,
    handlers: HashMap<String, JobHandler>,
    guard: Option<SweepGuard>,
    /// Unhandled items already alerted; pruned to what is still due.
    unhandled_alerted: Mutex<HashSet<ItemId>>,
}

impl std::fmt::Debug for SchedulerWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerWorker")
            .field("route", &self.route)
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

impl SchedulerWorker {
    pub fn new(scheduler: JobScheduler, route: Route) -> Self {
        Self {
            scheduler,
            route,
            handlers: HashMap::new(),
            guard: None,
            unhandled_alerted: Mutex::new(HashSet::new()),
        }
    }

    /// Register the handler for `J`, replacing any earlier one.
    pub fn register<J, F>(mut self, handler: F) -> Self
    where
        J: Job,
        F: Fn(J) -> JobResult + Send + Sync + 'static,
    {
        self.handlers.insert(
            J::JOB_TYPE.to_string(),
            Box::new(move |item: &ScheduledItem| {
                let job = item.decode::<J>().map_err(|e| e.to_string())?;
                handler(job)
            }),
        );
        self
    }

    /// Sweep only while `guard` returns true, e.g. while a lease is held.
    pub fn with_guard<G>(mut self, guard: G) -> Self
    where
        G: Fn() -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Box::new(guard));
        self
    }

    pub fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if self.guard.as_ref().is_some_and(|guard| !guard()) {
            debug!(route = %self.route, "sweep skipped; guard not satisfied");
            return report;
        }

        let due = match self.scheduler.get_due(&self.route) {
            Ok(due) => due,
            Err(e) => {
                warn!(route = %self.route, error = %e, "failed to fetch due items");
                return report;
            }
        };
        report.due = due.len();

        let mut alerted = match self.unhandled_alerted.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        alerted.retain(|id| due.iter().any(|item| item.id == *id));

        for item in &due {
            let Some(handler) = self.handlers.get(&item.job_type) else {
                if alerted.insert(item.id) {
                    warn!(route = %self.route, item_id = %item.id, job_type = %item.job_type, "no handler for job type");
                    self.alert(item, "no handler registered for job type");
                }
                report.unhandled += 1;
                continue;
            };

            let outcome = match catch_unwind(AssertUnwindSafe(|| handler(item))) {
                Ok(outcome) => outcome,
                Err(_) => Err("job handler panicked".to_string()),
            };

            match outcome {
                Ok(()) => {
                    let settled = if item.recurrence.is_some() {
                        self.scheduler.reschedule(item)
                    } else {
                        self.scheduler.cancel(item)
                    };
                    if settled {
                        report.completed += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Err(reason) => {
                    error!(route = %self.route, item_id = %item.id, job_type = %item.job_type, %reason, "job failed");
                    self.alert(item, &reason);
                    report.failed += 1;
                }
            }
        }

        if report.due > 0 {
            debug!(route = %self.route, ?report, "sweep finished");
        }
        report
    }

    /// Sweep every `poll_interval` on a background thread until shut down.
    pub fn spawn(self, config: SchedulerConfig) -> WorkerHandle {
        WorkerHandle::spawn(config.name.clone(), move |shutdown| {
            loop {
                self.sweep_once();
                if shutdown.wait_timeout(config.poll_interval) {
                    break;
                }
            }
        })
    }

    fn alert(&self, item: &ScheduledItem, reason: &str) {
        self.scheduler.alerts().raise(
            Alert::new(AlertKind::SchedulerFailure, "scheduled job failed")
                .detail("route", &self.route)
                .detail("item_id", item.id)
                .detail("job_type", &item.job_type)
                .detail("reason", reason),
        );
    }
}
