//! Background renewal of a held lease.

use std::sync::Arc;

use tracing::debug;

use concord_core::retry::{self, RetryError, RetryPolicy};
use concord_core::{Shutdown, WorkerHandle};

use crate::mutex::{LeaseShared, Renewal};

pub(crate) fn spawn(shared: Arc<LeaseShared>) -> WorkerHandle {
    let name = format!("lease-renewal-{}", shared.name);
    WorkerHandle::spawn(name, move |shutdown| renewal_loop(&shared, &shutdown))
}

fn renewal_loop(shared: &LeaseShared, shutdown: &Shutdown) {
    let wait = shared.config.renew_wait();
    let policy = RetryPolicy::fixed(
        shared.config.renew_attempts,
        shared.config.renew_retry_delay,
    );

    loop {
        if shutdown.wait_timeout(wait) {
            break;
        }

        let result = retry::on_transient(&policy, shutdown, |attempt| {
            if attempt > 1 {
                debug!(lock = %shared.name, attempt, "retrying lease renewal");
            }
            shared.renew_once()
        });

        // A release raced the round trip; it owns the outcome now.
        if shutdown.is_triggered() {
            break;
        }

        match result {
            Ok(Renewal::Extended) => {
                debug!(lock = %shared.name, "lease renewed");
            }
            Ok(Renewal::Lost(reason)) => {
                shared.abandon(reason);
                break;
            }
            Err(RetryError::Cancelled) => break,
            Err(e) => {
                shared.abandon(format!("renewal failed: {e}"));
                break;
            }
        }
    }
}
