//! Wiring of lease, bus and scheduler into one running node.
//!
//! Every node listens for heartbeats. The node holding the scheduler lease
//! also sweeps the schedule, whose recurring heartbeat job publishes one.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use concord_bus::{ExchangeKind, HandlerRegistry, Listener, Message, MessageBus, Publisher};
use concord_core::{AlertSink, Clock, SystemClock, TracingAlertSink, WorkerHandle};
use concord_lease::{LeaseManager, LeaseMutex};
use concord_scheduler::{Job, JobScheduler, Recurrence, SchedulerWorker};
use concord_store::{RoutedStore, StoreProvider};

use crate::config::NodeConfig;

const HEARTBEAT_SCHEDULE: &str = "node-heartbeat";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitHeartbeat;

impl Job for EmitHeartbeat {
    const JOB_TYPE: &'static str = "concord.node.emit_heartbeat";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node: String,
    pub at: DateTime<Utc>,
}

impl Message for Heartbeat {
    const MESSAGE_TYPE: &'static str = "concord.node.heartbeat";
}

pub struct Node {
    name: String,
    leases: LeaseManager,
    lease: Arc<LeaseMutex>,
    publisher: Arc<Publisher>,
    listener: Listener,
    sweeper: Option<WorkerHandle>,
    received: Arc<AtomicUsize>,
}

impl Node {
    pub fn start(config: NodeConfig, provider: Arc<dyn StoreProvider>) -> anyhow::Result<Self> {
        Self::start_with(config, provider, Arc::new(SystemClock), Arc::new(TracingAlertSink))
    }

    pub fn start_with(
        config: NodeConfig,
        provider: Arc<dyn StoreProvider>,
        clock: Arc<dyn Clock>,
        alerts: Arc<dyn AlertSink>,
    ) -> anyhow::Result<Self> {
        let store = RoutedStore::new(provider.clone(), config.route.clone());

        let mut leases = LeaseManager::new(store, config.lease.clone())
            .context("lease manager")?
            .with_clock(clock.clone())
            .with_alerts(alerts.clone());
        leases.start_grooming();
        let lease = Arc::new(leases.mutex(&config.lease_name)?);

        let bus = MessageBus::new(provider.clone(), config.route.clone(), config.bus.clone())
            .context("message bus")?
            .with_clock(clock.clone())
            .with_alerts(alerts.clone());
        let exchange = bus
            .topology()
            .declare_exchange(&config.exchange, ExchangeKind::Fanout)?;
        exchange.declare_queue(&config.queue, Vec::<String>::new())?;

        let publisher = Arc::new(bus.publisher());
        publisher.outbox().automatic_send(config.outbox_interval);

        let received = Arc::new(AtomicUsize::new(0));
        let listener = bus.listener(&config.exchange, &config.queue)?;
        listener.listen(HandlerRegistry::new().register::<Heartbeat, _>({
            let received = received.clone();
            move |beat, delivery| {
                info!(from = %beat.node, at = %beat.at, "heartbeat received");
                if delivery.acknowledge() {
                    received.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));

        let scheduler = JobScheduler::new(provider)
            .with_clock(clock.clone())
            .with_alerts(alerts);
        scheduler.schedule_job_only_once(
            &config.route,
            HEARTBEAT_SCHEDULE,
            &EmitHeartbeat,
            clock.now(),
            Some(Recurrence::minutely()),
        )?;

        let sweeper = SchedulerWorker::new(scheduler, config.route.clone())
            .register::<EmitHeartbeat, _>({
                let publisher = publisher.clone();
                let exchange = config.exchange.clone();
                let node = config.name.clone();
                let clock = clock.clone();
                move |_| {
                    let beat = Heartbeat {
                        node: node.clone(),
                        at: clock.now(),
                    };
                    publisher
                        .publish(&exchange, "", &beat)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                }
            })
            .with_guard({
                let lease = lease.clone();
                move || lease.open()
            })
            .spawn(config.scheduler.clone());

        info!(node = %config.name, route = %config.route, "node started");
        Ok(Self {
            name: config.name,
            leases,
            lease,
            publisher,
            listener,
            sweeper: Some(sweeper),
            received,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.lease.is_held()
    }

    /// Heartbeats this node's listener has handled and acknowledged.
    pub fn heartbeats_received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }

    /// Stop sweeping and listening, flush the outbox and give up the lease.
    pub fn shutdown(mut self) -> anyhow::Result<()> {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown();
        }
        self.listener.stop();
        let flushed = self.publisher.send().context("final outbox flush")?;
        self.lease.release();
        info!(node = %self.name, flushed, received = self.heartbeats_received(), "node stopped");
        self.leases.shutdown();
        Ok(())
    }
}
