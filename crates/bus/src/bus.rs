use std::sync::Arc;

use concord_core::error::validate_name;
use concord_core::{AlertSink, Clock, Route, SystemClock, TracingAlertSink};
use concord_store::{RoutedStore, StoreProvider};

use crate::config::BusConfig;
use crate::error::BusError;
use crate::inbox::Inbox;
use crate::listener::Listener;
use crate::publisher::Publisher;
use crate::topology::Topology;

/// Entry point to the message bus of one route.
#[derive(Clone)]
pub struct MessageBus {
    store: RoutedStore,
    clock: Arc<dyn Clock>,
    alerts: Arc<dyn AlertSink>,
    config: BusConfig,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("route", self.store.route())
            .field("config", &self.config)
            .finish()
    }
}

impl MessageBus {
    pub fn new(
        provider: Arc<dyn StoreProvider>,
        route: Route,
        config: BusConfig,
    ) -> Result<Self, BusError> {
        config.validate()?;
        Ok(Self {
            store: RoutedStore::new(provider, route),
            clock: Arc::new(SystemClock),
            alerts: Arc::new(TracingAlertSink),
            config,
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

    pub fn route(&self) -> &Route {
        self.store.route()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn topology(&self) -> Topology {
        Topology::new(self.store.clone(), self.config.topology_attempts)
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.store.clone(), self.clock.clone(), self.config.batch_size)
    }

    /// A consumer of `queue` on `exchange` with its own reserver identity.
    pub fn inbox(&self, exchange: &str, queue: &str) -> Result<Inbox, BusError> {
        validate_name("exchange", exchange)?;
        validate_name("queue", queue)?;
        Inbox::new(
            self.store.clone(),
            self.clock.clone(),
            exchange,
            queue,
            self.config.clone(),
        )
    }

    pub fn listener(&self, exchange: &str, queue: &str) -> Result<Listener, BusError> {
        let inbox = self.inbox(exchange, queue)?;
        Ok(Listener::new(inbox, self.alerts.clone(), self.config.listen_wait))
    }
}
