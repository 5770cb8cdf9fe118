//! Scheduler and worker behavior across sessions and threads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use concord_core::{AlertKind, Clock, InMemoryAlertSink, ManualClock, Route};
use concord_lease::{LeaseConfig, LeaseManager};
use concord_scheduler::{
    Job, JobScheduler, Recurrence, SchedulerConfig, SchedulerWorker, SweepReport,
};
use concord_store::{InMemoryStoreProvider, RoutedStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Reindex {
    shard: u32,
}

impl Job for Reindex {
    const JOB_TYPE: &'static str = "search.reindex";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Orphan;

impl Job for Orphan {
    const JOB_TYPE: &'static str = "nobody.handles.this";
}

struct Env {
    provider: Arc<InMemoryStoreProvider>,
    clock: Arc<ManualClock>,
    alerts: Arc<InMemoryAlertSink>,
    scheduler: JobScheduler,
    route: Route,
}

fn env() -> Env {
    let provider = InMemoryStoreProvider::arc();
    let clock = Arc::new(ManualClock::starting_now());
    let alerts = Arc::new(InMemoryAlertSink::new());
    let scheduler = JobScheduler::new(provider.clone())
        .with_clock(clock.clone())
        .with_alerts(alerts.clone());
    Env {
        provider,
        clock,
        alerts,
        scheduler,
        route: Route::new("search").unwrap(),
    }
}

#[test]
fn schedule_only_once_is_idempotent() {
    let env = env();
    let t = env.clock.now();
    let first = env
        .scheduler
        .schedule_job_only_once(&env.route, "reindex", &Reindex { shard: 1 }, t, None)
        .unwrap();
    let second = env
        .scheduler
        .schedule_job_only_once(&env.route, "reindex", &Reindex { shard: 2 }, t, None)
        .unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    let all = env.scheduler.get_all(&env.route).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].decode::<Reindex>().unwrap().shard, 1);
}

#[test]
fn concurrent_unique_scheduling_inserts_once() {
    let env = env();
    let t = env.clock.now();
    let callers = 8;
    let barrier = Barrier::new(callers);

    let inserted = thread::scope(|scope| {
        let joins: Vec<_> = (0..callers)
            .map(|shard| {
                let env = &env;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    env.scheduler
                        .schedule_job_only_once(&env.route, "reindex", &Reindex { shard: shard as u32 }, t, None)
                        .ok()
                        .flatten()
                        .is_some()
                })
            })
            .collect();
        joins.into_iter().map(|j| j.join().unwrap()).filter(|won| *won).count()
    });

    assert_eq!(inserted, 1);
    assert_eq!(env.scheduler.get_all(&env.route).unwrap().len(), 1);
}

#[test]
fn daily_recurrence_advances_by_one_day() {
    let env = env();
    let t = env.clock.now();
    env.scheduler
        .schedule_job(&env.route, &Reindex { shard: 3 }, t, Some(Recurrence::daily()))
        .unwrap();

    let original = env.scheduler.get_due(&env.route).unwrap().remove(0);
    assert!(env.scheduler.reschedule(&original));

    let all = env.scheduler.get_all(&env.route).unwrap();
    assert_eq!(all.len(), 1);
    assert_ne!(all[0].id, original.id);
    assert_eq!(all[0].time, t + chrono::Duration::days(1));
    assert!(env.scheduler.get_due(&env.route).unwrap().is_empty());

    env.clock.advance(chrono::Duration::days(1));
    let due = env.scheduler.get_due(&env.route).unwrap();
    assert_eq!(due.len(), 1);
    assert_ne!(due[0].id, original.id);
}

#[test]
fn recurring_unique_item_keeps_its_name_across_reschedules() {
    let env = env();
    let t = env.clock.now();
    env.scheduler
        .schedule_job_only_once(&env.route, "nightly", &Reindex { shard: 0 }, t, Some(Recurrence::daily()))
        .unwrap();
    let item = env.scheduler.get_due(&env.route).unwrap().remove(0);
    assert!(env.scheduler.reschedule(&item));

    let again = env
        .scheduler
        .schedule_job_only_once(&env.route, "nightly", &Reindex { shard: 0 }, t, Some(Recurrence::daily()))
        .unwrap();
    assert!(again.is_none());
    assert_eq!(env.scheduler.get_all(&env.route).unwrap().len(), 1);
}

#[test]
fn sweep_runs_handlers_and_settles_items() {
    let env = env();
    let t = env.clock.now();
    env.scheduler.schedule_job(&env.route, &Reindex { shard: 1 }, t, None).unwrap();
    env.scheduler
        .schedule_job(&env.route, &Reindex { shard: 2 }, t, Some(Recurrence::hourly()))
        .unwrap();
    env.scheduler.schedule_job(&env.route, &Orphan, t, None).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let worker = SchedulerWorker::new(env.scheduler.clone(), env.route.clone()).register::<Reindex, _>({
        let runs = runs.clone();
        move |_| {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let report = worker.sweep_once();
    assert_eq!(
        report,
        SweepReport {
            due: 3,
            completed: 2,
            failed: 0,
            unhandled: 1,
        }
    );
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // The one-shot is gone, the recurring one moved an hour on, the orphan stays due.
    let remaining = env.scheduler.get_all(&env.route).unwrap();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().any(|i| i.job_type == "search.reindex" && i.time == t + chrono::Duration::hours(1)));
    assert_eq!(env.alerts.of_kind(AlertKind::SchedulerFailure).len(), 1);
}

#[test]
fn unhandled_item_is_alerted_once() {
    let env = env();
    env.scheduler.schedule_job(&env.route, &Orphan, env.clock.now(), None).unwrap();
    let worker = SchedulerWorker::new(env.scheduler.clone(), env.route.clone());

    for _ in 0..3 {
        assert_eq!(worker.sweep_once().unhandled, 1);
    }
    assert_eq!(env.alerts.of_kind(AlertKind::SchedulerFailure).len(), 1);

    // A new orphan is a new item and gets its own alert.
    env.scheduler.schedule_job(&env.route, &Orphan, env.clock.now(), None).unwrap();
    assert_eq!(worker.sweep_once().unhandled, 2);
    assert_eq!(env.alerts.of_kind(AlertKind::SchedulerFailure).len(), 2);
}

#[test]
fn failing_handler_leaves_the_item_due() {
    let env = env();
    env.scheduler
        .schedule_job(&env.route, &Reindex { shard: 9 }, env.clock.now(), None)
        .unwrap();

    let worker = SchedulerWorker::new(env.scheduler.clone(), env.route.clone())
        .register::<Reindex, _>(|job| Err(format!("shard {} offline", job.shard)));

    let report = worker.sweep_once();
    assert_eq!(report.failed, 1);
    assert_eq!(env.scheduler.get_due(&env.route).unwrap().len(), 1);

    let alerts = env.alerts.of_kind(AlertKind::SchedulerFailure);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].get("reason"), Some("shard 9 offline"));
}

#[test]
fn only_the_lease_holder_sweeps() {
    let env = env();
    env.scheduler
        .schedule_job(&env.route, &Reindex { shard: 1 }, env.clock.now(), None)
        .unwrap();

    let leases = LeaseManager::new(
        RoutedStore::new(env.provider.clone(), env.route.clone()),
        LeaseConfig::default(),
    )
    .unwrap();
    let ours = Arc::new(leases.mutex("scheduler").unwrap());
    let theirs = leases.mutex("scheduler").unwrap();
    assert!(theirs.open());

    let runs = Arc::new(AtomicUsize::new(0));
    let worker = SchedulerWorker::new(env.scheduler.clone(), env.route.clone())
        .register::<Reindex, _>({
            let runs = runs.clone();
            move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .with_guard({
            let ours = ours.clone();
            move || ours.open()
        });

    assert_eq!(worker.sweep_once(), SweepReport::default());
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    assert!(theirs.release());
    assert_eq!(worker.sweep_once().completed, 1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn spawned_worker_sweeps_in_the_background() {
    let env = env();
    env.scheduler
        .schedule_job(&env.route, &Reindex { shard: 4 }, env.clock.now(), None)
        .unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let handle = SchedulerWorker::new(env.scheduler.clone(), env.route.clone())
        .register::<Reindex, _>({
            let runs = runs.clone();
            move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .spawn(SchedulerConfig::default().with_poll_interval(Duration::from_millis(20)));

    let deadline = Instant::now() + Duration::from_secs(3);
    while runs.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    handle.shutdown();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(env.scheduler.get_all(&env.route).unwrap().is_empty());
}
