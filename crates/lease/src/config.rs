use std::time::Duration;

use tracing::warn;

use concord_core::config::{self, ConfigError, EnvLookup};

/// Shortest lease the mutex accepts; shorter requests are raised to this.
pub const MIN_LEASE: Duration = Duration::from_secs(15);

/// Lease mutex configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How long an acquisition or renewal is valid
    pub lease_duration: Duration,
    /// Renew this long before the lease would expire
    pub renew_margin: Duration,
    /// Renewal attempts per cycle before the lease is considered abandoned
    pub renew_attempts: u32,
    /// Delay between renewal attempts within a cycle
    pub renew_retry_delay: Duration,
    /// How often `wait` retries `open`
    pub poll_interval: Duration,
    /// How far past expiry a lock must be before grooming deletes it
    pub grace_period: Duration,
    /// How often the groomer sweeps
    pub groom_interval: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            renew_margin: Duration::from_secs(5),
            renew_attempts: 6,
            renew_retry_delay: Duration::from_millis(250),
            poll_interval: Duration::from_millis(50),
            grace_period: Duration::from_secs(30),
            groom_interval: Duration::from_secs(5),
        }
    }
}

impl LeaseConfig {
    /// Set the lease duration, raising it to [`MIN_LEASE`] if shorter.
    pub fn with_lease_duration(mut self, lease: Duration) -> Self {
        if lease < MIN_LEASE {
            warn!(
                requested_ms = lease.as_millis() as u64,
                minimum_ms = MIN_LEASE.as_millis() as u64,
                "lease duration below minimum; using minimum"
            );
        }
        self.lease_duration = lease.max(MIN_LEASE);
        self
    }

    pub fn with_renew_margin(mut self, margin: Duration) -> Self {
        self.renew_margin = margin;
        self
    }

    pub fn with_renew_attempts(mut self, attempts: u32) -> Self {
        self.renew_attempts = attempts.max(1);
        self
    }

    pub fn with_renew_retry_delay(mut self, delay: Duration) -> Self {
        self.renew_retry_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_groom_interval(mut self, interval: Duration) -> Self {
        self.groom_interval = interval;
        self
    }

    /// Interval between renewals.
    pub fn renew_wait(&self) -> Duration {
        self.lease_duration.saturating_sub(self.renew_margin)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.renew_margin >= self.lease_duration {
            return Err(ConfigError::Invalid {
                key: "renew_margin".to_string(),
                value: format!("{:?}", self.renew_margin),
                reason: format!(
                    "must be shorter than the lease duration ({:?})",
                    self.lease_duration
                ),
            });
        }
        if self.poll_interval.is_zero() || self.groom_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "poll_interval/groom_interval".to_string(),
                value: "0".to_string(),
                reason: "intervals must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Defaults overridden by `CONCORD_LEASE_*` variables.
    pub fn from_env(env: &dyn EnvLookup) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(lease) = config::seconds(env, "CONCORD_LEASE_SECS")? {
            cfg = cfg.with_lease_duration(lease);
        }
        if let Some(margin) = config::seconds(env, "CONCORD_LEASE_RENEW_MARGIN_SECS")? {
            cfg.renew_margin = margin;
        }
        if let Some(attempts) = config::parse::<u32>(env, "CONCORD_LEASE_RENEW_ATTEMPTS")? {
            cfg = cfg.with_renew_attempts(attempts);
        }
        if let Some(poll) = config::seconds(env, "CONCORD_LEASE_POLL_SECS")? {
            cfg.poll_interval = poll;
        }
        if let Some(grace) = config::seconds(env, "CONCORD_LEASE_GRACE_SECS")? {
            cfg.grace_period = grace;
        }
        if let Some(groom) = config::seconds(env, "CONCORD_LEASE_GROOM_SECS")? {
            cfg.groom_interval = groom;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
