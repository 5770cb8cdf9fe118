//! Message bus over the shared document store.
//!
//! Exchanges route a message to the queues whose bindings match its routing
//! key. Publishing buffers one [`MessageEnvelope`] per matching queue in an
//! [`Outbox`]; consumers reserve envelopes through an [`Inbox`] and settle
//! them by acknowledging (delete) or abandoning (release).
//!
//! Delivery is at-least-once: a consumer that dies holding a reservation
//! leaves the envelope reserved until housekeeping applies the configured
//! [`ExpiredReservationPolicy`]. Handlers must be idempotent.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod inbox;
pub mod listener;
pub mod outbox;
pub mod publisher;
pub mod topology;

pub use bus::MessageBus;
pub use config::{BusConfig, ExpiredReservationPolicy};
pub use envelope::{Message, MessageEnvelope};
pub use error::BusError;
pub use inbox::Inbox;
pub use listener::{Delivery, HandlerRegistry, Listener, Outcome};
pub use outbox::Outbox;
pub use publisher::Publisher;
pub use topology::{Exchange, ExchangeKind, MessageExchangeDeclaration, QueueDeclaration, Topology};
