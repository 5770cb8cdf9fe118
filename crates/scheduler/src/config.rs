use std::time::Duration;

use concord_core::config::{self, ConfigError, EnvLookup};

/// Scheduler worker configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to sweep for due items
    pub poll_interval: Duration,
    /// Name for logging and the worker thread
    pub name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            name: "scheduler".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Defaults overridden by `CONCORD_SCHEDULER_*` variables.
    pub fn from_env(env: &dyn EnvLookup) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        if let Some(poll) = config::seconds(env, "CONCORD_SCHEDULER_POLL_SECS")? {
            if poll.is_zero() {
                return Err(ConfigError::Invalid {
                    key: "CONCORD_SCHEDULER_POLL_SECS".to_string(),
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            cfg.poll_interval = poll;
        }
        if let Some(name) = env.get("CONCORD_SCHEDULER_NAME") {
            cfg.name = name;
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CONCORD_SCHEDULER_POLL_SECS", "2.5"),
            ("CONCORD_SCHEDULER_NAME", "billing-sweeper"),
        ]);
        let cfg = SchedulerConfig::from_env(&env).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_millis(2500));
        assert_eq!(cfg.name, "billing-sweeper");

        let zero: HashMap<&str, &str> = HashMap::from([("CONCORD_SCHEDULER_POLL_SECS", "0")]);
        assert!(SchedulerConfig::from_env(&zero).is_err());
    }
}
