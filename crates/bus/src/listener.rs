//! Typed dispatch of inbox deliveries.

use std::cell::Cell;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, warn};

use concord_core::{Alert, AlertKind, AlertSink, Shutdown, WorkerHandle};

use crate::envelope::{Message, MessageEnvelope};
use crate::error::BusError;
use crate::inbox::Inbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    Abandoned,
    Rejected,
    /// Unknown or undecodable payload; acknowledged without a handler.
    Dropped,
}

/// What a handler may do with the message it was given. Only the first
/// settlement the store accepts counts; a delivery left unsettled is
/// abandoned.
pub struct Delivery<'a> {
    inbox: &'a Inbox,
    envelope: &'a MessageEnvelope,
    alerts: &'a dyn AlertSink,
    outcome: Cell<Option<Outcome>>,
}

impl<'a> Delivery<'a> {
    fn new(inbox: &'a Inbox, envelope: &'a MessageEnvelope, alerts: &'a dyn AlertSink) -> Self {
        Self {
            inbox,
            envelope,
            alerts,
            outcome: Cell::new(None),
        }
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        self.envelope
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Done with the message: delete it.
    pub fn acknowledge(&self) -> bool {
        self.settle(Outcome::Acknowledged, |inbox, env| inbox.acknowledge(env))
    }

    /// Give the message back for redelivery.
    pub fn abandon(&self) -> bool {
        self.settle(Outcome::Abandoned, |inbox, env| inbox.abandon(env))
    }

    /// The message can never be processed: alert, then delete it.
    pub fn reject(&self, reason: &str) -> bool {
        if self.is_settled() {
            return false;
        }
        warn!(queue = %self.inbox.queue(), envelope = %self.envelope.id, reason, "message rejected");
        self.alerts.raise(
            Alert::new(AlertKind::MessageRejected, "message rejected")
                .detail("queue", self.inbox.queue())
                .detail("envelope", self.envelope.id)
                .detail("message_type", &self.envelope.message_type)
                .detail("reason", reason),
        );
        self.settle(Outcome::Rejected, |inbox, env| inbox.acknowledge(env))
    }

    fn settle<F>(&self, outcome: Outcome, apply: F) -> bool
    where
        F: FnOnce(&Inbox, &MessageEnvelope) -> Result<bool, BusError>,
    {
        if self.is_settled() {
            return false;
        }
        // Record the outcome only once the store took it; a failed write
        // leaves the delivery open so it can be settled again.
        match apply(self.inbox, self.envelope) {
            Ok(applied) => {
                self.outcome.set(Some(outcome));
                applied
            }
            Err(e) => {
                warn!(
                    queue = %self.inbox.queue(),
                    envelope = %self.envelope.id,
                    outcome = ?outcome,
                    error = %e,
                    "settling delivery failed"
                );
                false
            }
        }
    }
}

type ErasedHandler = Box<dyn Fn(&MessageEnvelope, &Delivery<'_>) -> Result<(), BusError> + Send + Sync>;

/// Handlers keyed by message type tag.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, ErasedHandler>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `M`, replacing any earlier one.
    pub fn register<M, F>(mut self, handler: F) -> Self
    where
        M: Message,
        F: Fn(M, &Delivery<'_>) + Send + Sync + 'static,
    {
        self.handlers.insert(
            M::MESSAGE_TYPE.to_string(),
            Box::new(move |envelope: &MessageEnvelope, delivery: &Delivery<'_>| {
                let message = envelope.decode::<M>()?;
                handler(message, delivery);
                Ok(())
            }),
        );
        self
    }

    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    /// Run the matching handler for one reserved envelope and settle it.
    pub fn dispatch(
        &self,
        inbox: &Inbox,
        alerts: &dyn AlertSink,
        envelope: &MessageEnvelope,
    ) -> Outcome {
        let delivery = Delivery::new(inbox, envelope, alerts);

        let Some(handler) = self.handlers.get(&envelope.message_type) else {
            warn!(
                queue = %inbox.queue(),
                envelope = %envelope.id,
                message_type = %envelope.message_type,
                "no handler for message type; dropping"
            );
            delivery.settle(Outcome::Dropped, |inbox, env| inbox.acknowledge(env));
            return Outcome::Dropped;
        };

        match catch_unwind(AssertUnwindSafe(|| handler(envelope, &delivery))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    queue = %inbox.queue(),
                    envelope = %envelope.id,
                    error = %e,
                    "undecodable message; dropping"
                );
                delivery.settle(Outcome::Dropped, |inbox, env| inbox.acknowledge(env));
            }
            Err(panic) => {
                let reason = panic_message(&*panic);
                error!(queue = %inbox.queue(), envelope = %envelope.id, %reason, "message handler panicked");
                alerts.raise(
                    Alert::new(AlertKind::ListenerFailure, "message handler panicked")
                        .detail("queue", inbox.queue())
                        .detail("envelope", envelope.id)
                        .detail("message_type", &envelope.message_type)
                        .detail("reason", &reason),
                );
            }
        }

        if !delivery.is_settled() {
            debug!(queue = %inbox.queue(), envelope = %envelope.id, "unsettled delivery; abandoning");
            delivery.abandon();
        }
        delivery.outcome.get().unwrap_or(Outcome::Abandoned)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Background loop feeding one inbox to a [`HandlerRegistry`].
pub struct Listener {
    inbox: Arc<Inbox>,
    alerts: Arc<dyn AlertSink>,
    wait: Duration,
    worker: Mutex<Option<WorkerHandle>>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("inbox", &self.inbox)
            .field("wait", &self.wait)
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl Listener {
    pub fn new(inbox: Inbox, alerts: Arc<dyn AlertSink>, wait: Duration) -> Self {
        Self {
            inbox: Arc::new(inbox),
            alerts,
            wait,
            worker: Mutex::new(None),
        }
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn is_listening(&self) -> bool {
        self.slot().as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Start dispatching to `registry`, stopping any loop started earlier.
    pub fn listen(&self, registry: HandlerRegistry) {
        let mut slot = self.slot();
        drop(slot.take());

        let inbox = self.inbox.clone();
        let alerts = self.alerts.clone();
        let wait = self.wait;
        let name = format!("listener-{}-{}", inbox.exchange(), inbox.queue());
        *slot = Some(WorkerHandle::spawn(name, move |shutdown| {
            listen_loop(&inbox, alerts.as_ref(), &registry, wait, &shutdown)
        }));
    }

    /// Stop the loop and wait for it to exit.
    pub fn stop(&self) {
        let worker = self.slot().take();
        drop(worker);
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<WorkerHandle>> {
        match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_loop(
    inbox: &Inbox,
    alerts: &dyn AlertSink,
    registry: &HandlerRegistry,
    wait: Duration,
    shutdown: &Shutdown,
) {
    while !shutdown.is_triggered() {
        let batch = inbox.wait_for_messages_cancellable(wait, shutdown);
        let mut pending = batch.into_iter();
        for envelope in pending.by_ref() {
            if shutdown.is_triggered() {
                // Hand this one back along with the rest below.
                if let Err(e) = inbox.abandon(&envelope) {
                    warn!(queue = %inbox.queue(), error = %e, "abandon on shutdown failed");
                }
                break;
            }
            registry.dispatch(inbox, alerts, &envelope);
        }
        for envelope in pending {
            if let Err(e) = inbox.abandon(&envelope) {
                warn!(queue = %inbox.queue(), error = %e, "abandon on shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concord_core::{Clock, InMemoryAlertSink, ManualClock, Route};
    use concord_store::{InMemoryStoreProvider, RoutedStore};

    use crate::config::BusConfig;
    use crate::outbox::Outbox;

    #[test]
    fn failed_settlement_leaves_the_delivery_open() {
        let provider = InMemoryStoreProvider::arc();
        let route = Route::new("settle").unwrap();
        let store = RoutedStore::new(provider.clone(), route.clone());
        let clock = Arc::new(ManualClock::starting_now());

        let outbox = Outbox::new(store.clone(), 10);
        outbox.enqueue(MessageEnvelope::new("ex", "q", "n", serde_json::json!(1), clock.now()));
        outbox.send().unwrap();

        let config = BusConfig::default().with_housekeeping_probability(0.0);
        let inbox = Inbox::new(store, clock, "ex", "q", config).unwrap();
        let envelope = inbox.reserve_next().unwrap();
        let alerts = InMemoryAlertSink::new();
        let delivery = Delivery::new(&inbox, &envelope, &alerts);

        let raw = provider.store(&route).unwrap();
        raw.set_available(false);
        assert!(!delivery.acknowledge());
        assert!(!delivery.is_settled());

        raw.set_available(true);
        assert!(delivery.acknowledge());
        assert!(delivery.is_settled());
        assert!(!delivery.abandon());
        assert_eq!(raw.count("envelopes"), 0);
    }
}
