//! Operational alerts for failures an operator should see.
//!
//! Raising an alert is fire-and-forget: sinks must never panic or block for
//! long, because they are called from inside background loops.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A scheduled item could not be run, rescheduled or cancelled.
    SchedulerFailure,
    /// A consumer rejected a message; it will not be retried.
    MessageRejected,
    /// A message handler failed or panicked.
    ListenerFailure,
    /// A lease holder could not renew and lost exclusivity.
    LeaseAbandoned,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::SchedulerFailure => "scheduler_failure",
            AlertKind::MessageRejected => "message_rejected",
            AlertKind::ListenerFailure => "listener_failure",
            AlertKind::LeaseAbandoned => "lease_abandoned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub title: String,
    pub details: Vec<(String, String)>,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, title: impl Into<String>) -> Self {
        Self {
            kind,
            title: title.into(),
            details: Vec::new(),
            raised_at: Utc::now(),
        }
    }

    pub fn detail(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.details.push((key.into(), value.to_string()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.details
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

impl<S> AlertSink for std::sync::Arc<S>
where
    S: AlertSink + ?Sized,
{
    fn raise(&self, alert: Alert) {
        (**self).raise(alert)
    }
}

/// Logs alerts at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: Alert) {
        let details = alert
            .details
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        error!(alert = alert.kind.as_str(), %details, "{}", alert.title);
    }
}

/// Records alerts in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl InMemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn of_kind(&self, kind: AlertKind) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|a| a.kind == kind)
            .collect()
    }
}

impl AlertSink for InMemoryAlertSink {
    fn raise(&self, alert: Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}
