//! Coordination building blocks shared by every component.
//!
//! This crate contains no storage code: identifiers, time, cancellation,
//! background workers, the bounded retry combinator, alerts and configuration
//! helpers.

pub mod alert;
pub mod clock;
pub mod config;
pub mod error;
pub mod id;
pub mod retry;
pub mod shutdown;
pub mod worker;

pub use alert::{Alert, AlertKind, AlertSink, InMemoryAlertSink, TracingAlertSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, EnvLookup, ProcessEnv};
pub use error::{Conflict, ValidationError};
pub use id::{EnvelopeId, InstanceId, ItemId, Route};
pub use retry::{RetryError, RetryPolicy};
pub use shutdown::Shutdown;
pub use worker::WorkerHandle;
