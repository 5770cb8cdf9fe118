use std::time::Duration;

use concord_core::config::{self, ConfigError, EnvLookup};

/// What housekeeping does with a reservation older than the reservation limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpiredReservationPolicy {
    /// Delete the envelope. The message is lost.
    #[default]
    Discard,
    /// Clear the reservation so another consumer can take the message.
    Redeliver,
}

impl std::str::FromStr for ExpiredReservationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "discard" => Ok(Self::Discard),
            "redeliver" => Ok(Self::Redeliver),
            other => Err(format!("expected 'discard' or 'redeliver', got '{other}'")),
        }
    }
}

/// Message bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Envelopes per atomic outbox commit
    pub batch_size: usize,
    /// Delay between inbox polls while waiting for messages
    pub poll_interval: Duration,
    /// Reservation attempts per envelope before a poll gives up
    pub reserve_attempts: u32,
    /// Most envelopes one poll reserves
    pub max_batch: usize,
    /// Chance of housekeeping after a poll that found messages
    pub housekeeping_probability: f64,
    /// Age after which a reservation is considered expired
    pub reservation_limit: Duration,
    pub expired_reservations: ExpiredReservationPolicy,
    /// How long one listener poll waits for messages
    pub listen_wait: Duration,
    /// Attempts for topology read-modify-write cycles
    pub topology_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            reserve_attempts: 5,
            max_batch: 100,
            housekeeping_probability: 0.1,
            reservation_limit: Duration::from_secs(24 * 60 * 60),
            expired_reservations: ExpiredReservationPolicy::Discard,
            listen_wait: Duration::from_secs(5),
            topology_attempts: 10,
        }
    }
}

impl BusConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_batch(mut self, max: usize) -> Self {
        self.max_batch = max.max(1);
        self
    }

    pub fn with_housekeeping_probability(mut self, probability: f64) -> Self {
        self.housekeeping_probability = probability;
        self
    }

    pub fn with_reservation_limit(mut self, limit: Duration) -> Self {
        self.reservation_limit = limit;
        self
    }

    pub fn with_expired_reservations(mut self, policy: ExpiredReservationPolicy) -> Self {
        self.expired_reservations = policy;
        self
    }

    pub fn with_listen_wait(mut self, wait: Duration) -> Self {
        self.listen_wait = wait;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.housekeeping_probability) {
            return Err(ConfigError::Invalid {
                key: "housekeeping_probability".to_string(),
                value: self.housekeeping_probability.to_string(),
                reason: "must be within 0..=1".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "poll_interval".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Defaults overridden by `CONCORD_BUS_*` variables.
    pub fn from_env(env: &dyn EnvLookup) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(size) = config::parse::<usize>(env, "CONCORD_BUS_BATCH_SIZE")? {
            cfg = cfg.with_batch_size(size);
        }
        if let Some(poll) = config::seconds(env, "CONCORD_BUS_POLL_SECS")? {
            cfg.poll_interval = poll;
        }
        if let Some(max) = config::parse::<usize>(env, "CONCORD_BUS_MAX_BATCH")? {
            cfg = cfg.with_max_batch(max);
        }
        if let Some(p) = config::parse::<f64>(env, "CONCORD_BUS_HOUSEKEEPING_PROBABILITY")? {
            cfg.housekeeping_probability = p;
        }
        if let Some(limit) = config::seconds(env, "CONCORD_BUS_RESERVATION_LIMIT_SECS")? {
            cfg.reservation_limit = limit;
        }
        if let Some(policy) =
            config::parse::<ExpiredReservationPolicy>(env, "CONCORD_BUS_EXPIRED_RESERVATIONS")?
        {
            cfg.expired_reservations = policy;
        }
        if let Some(wait) = config::seconds(env, "CONCORD_BUS_LISTEN_SECS")? {
            cfg.listen_wait = wait;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
