//! Interruptible cancellation signal for background loops and blocking waits.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A cloneable, one-way cancellation signal.
///
/// Loops sleep through [`Shutdown::wait_timeout`] instead of
/// `thread::sleep`, so triggering wakes every waiter immediately.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake all waiters. Idempotent.
    pub fn trigger(&self) {
        let (flag, cvar) = &*self.inner;
        let mut triggered = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *triggered = true;
        cvar.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        let (flag, _) = &*self.inner;
        match flag.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Block for up to `timeout`, returning early once triggered.
    ///
    /// Returns `true` if the signal was triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut triggered = match flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Condvar wakeups can be spurious; loop until deadline or trigger.
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            triggered = match cvar.wait_timeout(triggered, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *triggered
    }
}
