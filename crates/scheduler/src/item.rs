use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use concord_core::{ItemId, Route};
use concord_store::Document;

use crate::error::SchedulerError;
use crate::recurrence::Recurrence;

/// A schedulable job payload.
///
/// `JOB_TYPE` is stored with the payload and selects the handler; keep it
/// stable across releases.
pub trait Job: Serialize + DeserializeOwned + Send + 'static {
    const JOB_TYPE: &'static str;
}

/// A job waiting for its fire time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledItem {
    pub id: ItemId,
    /// `None`: not deduplicated.
    pub unique_name: Option<String>,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub route: Route,
    /// Next fire time.
    pub time: DateTime<Utc>,
    pub recurrence: Option<Recurrence>,
}

impl Document for ScheduledItem {
    const COLLECTION: &'static str = "scheduled_items";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

impl ScheduledItem {
    pub fn new<J: Job>(
        route: Route,
        job: &J,
        time: DateTime<Utc>,
        recurrence: Option<Recurrence>,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            id: ItemId::new(),
            unique_name: None,
            job_type: J::JOB_TYPE.to_string(),
            payload: serde_json::to_value(job)?,
            route,
            time,
            recurrence,
        })
    }

    pub fn with_unique_name(mut self, name: impl Into<String>) -> Self {
        self.unique_name = Some(name.into());
        self
    }

    pub fn decode<J: Job>(&self) -> Result<J, SchedulerError> {
        if self.job_type != J::JOB_TYPE {
            return Err(SchedulerError::TypeMismatch {
                expected: J::JOB_TYPE.to_string(),
                found: self.job_type.clone(),
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.time <= now
    }

    /// The next occurrence, under a fresh id, if the recurrence has one.
    pub fn next_occurrence(&self) -> Option<ScheduledItem> {
        let next = self.recurrence?.next_after(self.time)?;
        Some(Self {
            id: ItemId::new(),
            time: next,
            ..self.clone()
        })
    }
}

/// Marker that a unique name is taken, pointing at the item that holds it.
///
/// Written in the same commit as the item so two schedulers racing on one
/// name cannot both insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueScheduleClaim {
    pub name: String,
    pub item_id: ItemId,
}

impl Document for UniqueScheduleClaim {
    const COLLECTION: &'static str = "unique_schedules";

    fn key(&self) -> String {
        self.name.clone()
    }
}
