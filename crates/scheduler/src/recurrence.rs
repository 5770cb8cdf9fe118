//! Recurrence rules for scheduled items.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

/// Fires every `interval` units of `frequency`, optionally until a cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub frequency: Frequency,
    pub interval: u32,
    pub until: Option<DateTime<Utc>>,
}

impl Recurrence {
    pub fn every(frequency: Frequency, interval: u32) -> Self {
        Self {
            frequency,
            interval: interval.max(1),
            until: None,
        }
    }

    pub fn minutely() -> Self {
        Self::every(Frequency::Minutely, 1)
    }

    pub fn hourly() -> Self {
        Self::every(Frequency::Hourly, 1)
    }

    pub fn daily() -> Self {
        Self::every(Frequency::Daily, 1)
    }

    pub fn weekly() -> Self {
        Self::every(Frequency::Weekly, 1)
    }

    pub fn monthly() -> Self {
        Self::every(Frequency::Monthly, 1)
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// The fire time one step after `time`, or `None` once past `until`.
    ///
    /// Monthly steps are calendar months; a day that does not exist in the
    /// target month clamps to its last day.
    pub fn next_after(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let n = i64::from(self.interval.max(1));
        let next = match self.frequency {
            Frequency::Minutely => time.checked_add_signed(chrono::Duration::minutes(n)),
            Frequency::Hourly => time.checked_add_signed(chrono::Duration::hours(n)),
            Frequency::Daily => time.checked_add_signed(chrono::Duration::days(n)),
            Frequency::Weekly => time.checked_add_signed(chrono::Duration::weeks(n)),
            Frequency::Monthly => time.checked_add_months(Months::new(self.interval.max(1))),
        }?;
        match self.until {
            Some(until) if next > until => None,
            _ => Some(next),
        }
    }
}
