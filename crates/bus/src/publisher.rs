use std::sync::Arc;

use tracing::{debug, warn};

use concord_core::Clock;
use concord_store::RoutedStore;

use crate::envelope::{Message, MessageEnvelope};
use crate::error::BusError;
use crate::outbox::Outbox;
use crate::topology::MessageExchangeDeclaration;

/// Routes typed messages to queues through an [`Outbox`].
pub struct Publisher {
    store: RoutedStore,
    clock: Arc<dyn Clock>,
    outbox: Outbox,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("route", self.store.route())
            .field("outbox", &self.outbox)
            .finish()
    }
}

impl Publisher {
    pub fn new(store: RoutedStore, clock: Arc<dyn Clock>, batch_size: usize) -> Self {
        Self {
            outbox: Outbox::new(store.clone(), batch_size),
            store,
            clock,
        }
    }

    /// Buffer one envelope per queue of `exchange` matching `routing_key`.
    ///
    /// Nothing is written until [`send`](Self::send). Returns the number of
    /// envelopes buffered; zero when no queue matched.
    pub fn publish<M: Message>(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &M,
    ) -> Result<usize, BusError> {
        let declaration = self
            .store
            .session()?
            .load::<MessageExchangeDeclaration>(exchange)?
            .ok_or_else(|| BusError::UnknownExchange(exchange.to_string()))?;

        let queues = declaration.matching_queues(routing_key);
        if queues.is_empty() {
            warn!(exchange, routing_key, message_type = M::MESSAGE_TYPE, "no queue matched; message dropped");
            return Ok(0);
        }

        let payload = serde_json::to_value(message)?;
        let now = self.clock.now();
        for queue in &queues {
            self.outbox.enqueue(MessageEnvelope::new(
                exchange,
                &queue.name,
                M::MESSAGE_TYPE,
                payload.clone(),
                now,
            ));
        }
        debug!(exchange, routing_key, message_type = M::MESSAGE_TYPE, queues = queues.len(), "message published");
        Ok(queues.len())
    }

    /// Flush the outbox.
    pub fn send(&self) -> Result<usize, BusError> {
        self.outbox.send()
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }
}
