//! Bounded retry for optimistic-concurrency writes.
//!
//! Every component funnels its read-modify-write loops through
//! [`on_conflict`] or [`on_transient`], which re-run the operation while the
//! error is retryable and give up once the policy's attempts are spent.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::error::Conflict;
use crate::shutdown::Shutdown;

/// Attempt bound plus the pause between attempts.
///
/// A fixed policy always pauses for `pause`. A backoff policy doubles the
/// pause after each failed attempt up to `max_pause` and picks a random point
/// in the upper half of it, so writers that lost the same race drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    attempts: u32,
    pause: Duration,
    max_pause: Duration,
    backoff: bool,
}

impl RetryPolicy {
    pub fn fixed(attempts: u32, pause: Duration) -> Self {
        Self {
            attempts,
            pause,
            max_pause: pause,
            backoff: false,
        }
    }

    pub fn backoff(attempts: u32, pause: Duration, max_pause: Duration) -> Self {
        Self {
            attempts,
            pause,
            max_pause: max_pause.max(pause),
            backoff: true,
        }
    }

    /// Total attempts including the first; never less than one.
    pub fn attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Pause after failed attempt number `attempt` (1-indexed).
    pub fn pause_after(&self, attempt: u32) -> Duration {
        if !self.backoff {
            return self.pause;
        }
        let doublings = attempt.saturating_sub(1).min(16);
        let ceiling = self.pause.saturating_mul(1 << doublings).min(self.max_pause);
        let floor = ceiling / 2;
        if floor >= ceiling {
            return ceiling;
        }
        rand::rng().random_range(floor..=ceiling)
    }
}

/// Why a retried operation did not produce a value.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    /// A non-retryable error ended the loop early.
    #[error(transparent)]
    Aborted(E),

    /// The shutdown signal fired between attempts.
    #[error("cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The underlying error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::Aborted(last) => Some(last),
            RetryError::Cancelled => None,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }
}

/// Run `op` until it succeeds, fails with an error `should_retry` rejects,
/// runs out of attempts, or `shutdown` fires.
///
/// `op` receives the 1-indexed attempt number.
pub fn run<T, E, F, P>(
    policy: &RetryPolicy,
    shutdown: Option<&Shutdown>,
    should_retry: P,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Result<T, E>,
    P: Fn(&E) -> bool,
{
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        if shutdown.is_some_and(Shutdown::is_triggered) {
            return Err(RetryError::Cancelled);
        }

        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) if !should_retry(&err) => return Err(RetryError::Aborted(err)),
            Err(err) if attempt >= attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(_) => {
                debug!(attempt, max_attempts = attempts, "retrying after conflict");
                let delay = policy.pause_after(attempt);
                let cancelled = match shutdown {
                    Some(signal) => signal.wait_timeout(delay),
                    None => {
                        std::thread::sleep(delay);
                        false
                    }
                };
                if cancelled {
                    return Err(RetryError::Cancelled);
                }
                attempt += 1;
            }
        }
    }
}

/// Retry only optimistic-concurrency conflicts.
pub fn on_conflict<T, E, F>(policy: &RetryPolicy, op: F) -> Result<T, RetryError<E>>
where
    E: Conflict,
    F: FnMut(u32) -> Result<T, E>,
{
    run(policy, None, E::is_conflict, op)
}

/// Retry conflicts and transient failures, interruptible by `shutdown`.
pub fn on_transient<T, E, F>(
    policy: &RetryPolicy,
    shutdown: &Shutdown,
    op: F,
) -> Result<T, RetryError<E>>
where
    E: Conflict,
    F: FnMut(u32) -> Result<T, E>,
{
    run(policy, Some(shutdown), E::is_transient, op)
}
