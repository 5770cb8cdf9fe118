//! Reservation-based consumption of one queue.
//!
//! Reserving is an optimistic write that stamps this inbox's reserver id on
//! the oldest free envelope. A conflict means another consumer won; the inbox
//! looks again. The reservation is re-read before the envelope is handed out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use concord_core::retry::{self, RetryPolicy};
use concord_core::{Clock, InstanceId, Shutdown};
use concord_store::{RoutedStore, StoreError};

use crate::config::{BusConfig, ExpiredReservationPolicy};
use crate::envelope::MessageEnvelope;
use crate::error::BusError;

pub struct Inbox {
    store: RoutedStore,
    clock: Arc<dyn Clock>,
    exchange: String,
    queue: String,
    reserver: InstanceId,
    config: BusConfig,
}

impl std::fmt::Debug for Inbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbox")
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("reserver", &self.reserver)
            .finish()
    }
}

impl Inbox {
    pub fn new(
        store: RoutedStore,
        clock: Arc<dyn Clock>,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        config: BusConfig,
    ) -> Result<Self, BusError> {
        config.validate()?;
        Ok(Self {
            store,
            clock,
            exchange: exchange.into(),
            queue: queue.into(),
            reserver: InstanceId::new(),
            config,
        })
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Identity written into reservations made by this inbox.
    pub fn reserver(&self) -> InstanceId {
        self.reserver
    }

    /// Poll until at least one envelope is reserved or `timeout` elapses.
    pub fn wait_for_messages(&self, timeout: Duration) -> Vec<MessageEnvelope> {
        self.wait(timeout, &Shutdown::new())
    }

    /// Like [`wait_for_messages`](Self::wait_for_messages), returning early
    /// (and empty) once `shutdown` fires.
    pub fn wait_for_messages_cancellable(
        &self,
        timeout: Duration,
        shutdown: &Shutdown,
    ) -> Vec<MessageEnvelope> {
        self.wait(timeout, shutdown)
    }

    fn wait(&self, timeout: Duration, shutdown: &Shutdown) -> Vec<MessageEnvelope> {
        let deadline = Instant::now() + timeout;
        loop {
            if shutdown.is_triggered() {
                return Vec::new();
            }

            let batch = self.poll();
            if !batch.is_empty() {
                return batch;
            }

            let now = Instant::now();
            if now >= deadline {
                return batch;
            }
            let pause = self.config.poll_interval.min(deadline - now);
            if shutdown.wait_timeout(pause) {
                return Vec::new();
            }
        }
    }

    /// One poll: reserve until nothing is left or the batch is full, then
    /// maybe housekeep.
    pub fn poll(&self) -> Vec<MessageEnvelope> {
        let mut batch = Vec::new();
        while batch.len() < self.config.max_batch {
            match self.reserve_next() {
                Some(envelope) => batch.push(envelope),
                None => break,
            }
        }

        let p = self.config.housekeeping_probability;
        if batch.is_empty() || rand::rng().random_bool(p) {
            if let Err(e) = self.housekeep() {
                warn!(queue = %self.queue, error = %e, "inbox housekeeping failed");
            }
        }
        batch
    }

    /// Reserve the oldest free envelope of this queue, if any.
    pub fn reserve_next(&self) -> Option<MessageEnvelope> {
        let policy = RetryPolicy::fixed(self.config.reserve_attempts, Duration::from_millis(5));
        let result = retry::on_conflict(&policy, |attempt| {
            if attempt > 1 {
                debug!(queue = %self.queue, attempt, "reservation raced; retrying");
            }
            self.try_reserve()
        });

        match result {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "could not reserve a message");
                None
            }
        }
    }

    fn try_reserve(&self) -> Result<Option<MessageEnvelope>, StoreError> {
        let mut session = self.store.session()?;
        let candidate = session
            .query(|e: &MessageEnvelope| e.is_for(&self.exchange, &self.queue) && !e.reserved)?
            .into_iter()
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        let Some(mut envelope) = candidate else {
            return Ok(None);
        };

        envelope.reserve(self.reserver, self.clock.now());
        session.store(&envelope)?;
        session.save_changes()?;

        // The commit was version-checked, so the reservation is ours even if
        // the re-read below cannot reach the store.
        let key = envelope.id.to_string();
        let reloaded = self
            .store
            .session()
            .and_then(|mut session| session.load::<MessageEnvelope>(&key));
        match reloaded {
            Ok(Some(current)) if current.is_reserved_by(self.reserver) => Ok(Some(current)),
            Ok(_) => Err(StoreError::concurrency("envelopes", &key)),
            Err(e) => {
                warn!(queue = %self.queue, envelope = %key, error = %e, "re-reading reservation failed; keeping committed copy");
                Ok(Some(envelope))
            }
        }
    }

    /// Delete an envelope this inbox has reserved. False if it no longer
    /// holds the reservation.
    pub fn acknowledge(&self, envelope: &MessageEnvelope) -> Result<bool, BusError> {
        let key = envelope.id.to_string();
        let mut session = self.store.session()?;
        match session.load::<MessageEnvelope>(&key)? {
            Some(current) if current.is_reserved_by(self.reserver) => {
                session.delete::<MessageEnvelope>(&key);
                session.save_changes()?;
                debug!(queue = %self.queue, envelope = %key, "message acknowledged");
                Ok(true)
            }
            Some(_) => {
                warn!(queue = %self.queue, envelope = %key, "acknowledge skipped; reservation is no longer ours");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Clear this inbox's reservation so the envelope can be delivered again.
    pub fn abandon(&self, envelope: &MessageEnvelope) -> Result<bool, BusError> {
        let key = envelope.id.to_string();
        let mut session = self.store.session()?;
        match session.load::<MessageEnvelope>(&key)? {
            Some(mut current) if current.is_reserved_by(self.reserver) => {
                current.clear_reservation();
                session.store(&current)?;
                session.save_changes()?;
                debug!(queue = %self.queue, envelope = %key, "message abandoned");
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Apply the expired-reservation policy to this queue. Returns how many
    /// envelopes were discarded or released.
    pub fn housekeep(&self) -> Result<usize, BusError> {
        let now = self.clock.now();
        let limit = self.config.reservation_limit;
        let expired = self.store.session()?.query(|e: &MessageEnvelope| {
            e.is_for(&self.exchange, &self.queue) && e.reservation_expired(now, limit)
        })?;

        let mut handled = 0;
        for envelope in expired {
            let key = envelope.id.to_string();
            let mut session = self.store.session()?;
            // Reload so the write is version-checked against a late acknowledge.
            let Some(mut current) = session.load::<MessageEnvelope>(&key)? else {
                continue;
            };
            if !current.reservation_expired(now, limit) {
                continue;
            }
            match self.config.expired_reservations {
                ExpiredReservationPolicy::Discard => session.delete::<MessageEnvelope>(&key),
                ExpiredReservationPolicy::Redeliver => {
                    current.clear_reservation();
                    session.store(&current)?;
                }
            }
            match session.save_changes() {
                Ok(()) => handled += 1,
                Err(StoreError::Concurrency { .. }) => {
                    debug!(queue = %self.queue, envelope = %key, "expired reservation changed concurrently");
                }
                Err(e) => return Err(e.into()),
            }
        }

        if handled > 0 {
            info!(
                queue = %self.queue,
                handled,
                policy = ?self.config.expired_reservations,
                "expired reservations housekept"
            );
        }
        Ok(handled)
    }
}
