//! Buffered, batched envelope writes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use concord_core::WorkerHandle;
use concord_store::RoutedStore;

use crate::envelope::MessageEnvelope;
use crate::error::BusError;

struct OutboxState {
    store: RoutedStore,
    batch_size: usize,
    buffer: Mutex<VecDeque<MessageEnvelope>>,
}

impl OutboxState {
    fn buffer(&self) -> MutexGuard<'_, VecDeque<MessageEnvelope>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn send(&self) -> Result<usize, BusError> {
        let mut sent = 0;
        loop {
            let batch: Vec<MessageEnvelope> = {
                let mut buffer = self.buffer();
                let take = buffer.len().min(self.batch_size);
                buffer.drain(..take).collect()
            };
            if batch.is_empty() {
                return Ok(sent);
            }

            let count = batch.len();
            if let Err(e) = self.commit(&batch) {
                // Put the batch back in front, preserving order.
                let mut buffer = self.buffer();
                for envelope in batch.into_iter().rev() {
                    buffer.push_front(envelope);
                }
                return Err(e);
            }
            sent += count;
            debug!(route = %self.store.route(), count, "outbox batch committed");
        }
    }

    fn commit(&self, batch: &[MessageEnvelope]) -> Result<(), BusError> {
        let mut session = self.store.session()?;
        for envelope in batch {
            session.store(envelope)?;
        }
        session.save_changes()?;
        Ok(())
    }
}

/// In-memory buffer of envelopes awaiting their write.
///
/// [`send`](Self::send) commits the buffer in batches of `batch_size`, each
/// batch atomically. A failed batch goes back to the head of the buffer.
pub struct Outbox {
    state: Arc<OutboxState>,
    automatic: Mutex<Option<WorkerHandle>>,
}

impl std::fmt::Debug for Outbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("route", self.state.store.route())
            .field("pending", &self.pending())
            .finish()
    }
}

impl Outbox {
    pub fn new(store: RoutedStore, batch_size: usize) -> Self {
        Self {
            state: Arc::new(OutboxState {
                store,
                batch_size: batch_size.max(1),
                buffer: Mutex::new(VecDeque::new()),
            }),
            automatic: Mutex::new(None),
        }
    }

    pub fn enqueue(&self, envelope: MessageEnvelope) {
        self.state.buffer().push_back(envelope);
    }

    pub fn pending(&self) -> usize {
        self.state.buffer().len()
    }

    /// Flush everything buffered. Returns the number of envelopes written.
    pub fn send(&self) -> Result<usize, BusError> {
        self.state.send()
    }

    /// Flush in the background every `interval`, replacing any earlier timer.
    pub fn automatic_send(&self, interval: Duration) {
        let state = self.state.clone();
        let name = format!("outbox-send-{}", state.store.route());
        let worker = WorkerHandle::spawn(name, move |shutdown| {
            while !shutdown.wait_timeout(interval) {
                if let Err(e) = state.send() {
                    warn!(route = %state.store.route(), error = %e, "automatic outbox send failed");
                }
            }
        });

        let previous = match self.automatic.lock() {
            Ok(mut slot) => slot.replace(worker),
            Err(poisoned) => poisoned.into_inner().replace(worker),
        };
        drop(previous);
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        let worker = match self.automatic.get_mut() {
            Ok(slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(worker);

        let pending = self.pending();
        if pending > 0 {
            warn!(route = %self.state.store.route(), pending, "outbox dropped with unsent envelopes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use concord_core::Route;
    use concord_store::InMemoryStoreProvider;

    fn envelope(n: u32) -> MessageEnvelope {
        MessageEnvelope::new("ex", "q", "n", serde_json::json!(n), Utc::now())
    }

    fn fixture() -> (Arc<InMemoryStoreProvider>, RoutedStore) {
        let provider = InMemoryStoreProvider::arc();
        let store = RoutedStore::new(provider.clone(), Route::new("outbox").unwrap());
        (provider, store)
    }

    #[test]
    fn send_flushes_in_batches() {
        let (provider, store) = fixture();
        let outbox = Outbox::new(store.clone(), 100);
        for n in 0..250 {
            outbox.enqueue(envelope(n));
        }

        assert_eq!(outbox.send().unwrap(), 250);
        assert_eq!(outbox.pending(), 0);
        let raw = provider.store(store.route()).unwrap();
        assert_eq!(raw.count("envelopes"), 250);
    }

    #[test]
    fn failed_batch_is_put_back_in_order() {
        let (provider, store) = fixture();
        let raw = provider.store(store.route()).unwrap();
        let outbox = Outbox::new(store, 2);
        let envelopes: Vec<_> = (0..3).map(envelope).collect();
        for env in &envelopes {
            outbox.enqueue(env.clone());
        }

        raw.set_available(false);
        assert!(outbox.send().is_err());
        assert_eq!(outbox.pending(), 3);

        raw.set_available(true);
        assert_eq!(outbox.send().unwrap(), 3);
        assert_eq!(raw.count("envelopes"), 3);
    }

    #[test]
    fn automatic_send_flushes_in_the_background() {
        let (provider, store) = fixture();
        let raw = provider.store(store.route()).unwrap();
        let outbox = Outbox::new(store, 10);
        outbox.automatic_send(Duration::from_millis(20));
        outbox.enqueue(envelope(1));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while raw.count("envelopes") == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(raw.count("envelopes"), 1);
        assert_eq!(outbox.pending(), 0);
    }
}
