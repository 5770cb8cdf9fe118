//! Job scheduling over the shared document store.
//!
//! Application code places [`ScheduledItem`]s through a [`JobScheduler`]; a
//! [`SchedulerWorker`] sweeps the due ones, runs their handlers and then
//! reschedules (recurring) or cancels (one-shot) them. Unique names are
//! guarded by a [`UniqueScheduleClaim`] written in the same commit as the item.

pub mod config;
pub mod error;
pub mod item;
pub mod recurrence;
pub mod scheduler;
pub mod worker;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use item::{Job, ScheduledItem, UniqueScheduleClaim};
pub use recurrence::{Frequency, Recurrence};
pub use scheduler::JobScheduler;
pub use worker::{JobResult, SchedulerWorker, SweepReport};
