use std::thread;

use tracing::{info, warn};

use crate::shutdown::Shutdown;

/// Handle to control and join a background loop.
///
/// The loop receives a [`Shutdown`] and must poll it between store round
/// trips. Dropping the handle stops and joins the loop.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: Shutdown,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawn a named background thread running `body` until it returns.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(Shutdown) + Send + 'static,
    {
        let name = name.into();
        let shutdown = Shutdown::new();
        let signal = shutdown.clone();
        let thread_name = name.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!(worker = %thread_name, "worker started");
                body(signal);
                info!(worker = %thread_name, "worker stopped");
            })
            .expect("failed to spawn worker thread");

        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the loop has returned on its own.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown.trigger();
        let Some(join) = self.join.take() else {
            return;
        };

        // A loop that tears itself down (e.g. a handler re-registering its
        // own listener) must not join its own thread.
        if join.thread().id() == thread::current().id() {
            return;
        }

        if join.join().is_err() {
            warn!(worker = %self.name, "worker panicked");
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
