use std::time::Duration;

use anyhow::Context;

use concord_bus::BusConfig;
use concord_core::config;
use concord_core::{EnvLookup, Route};
use concord_lease::LeaseConfig;
use concord_scheduler::SchedulerConfig;

/// Everything a node needs, read from `CONCORD_*` variables.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub route: Route,
    /// Instance label used in logs and heartbeat payloads
    pub name: String,
    /// Lease that elects the node allowed to sweep the scheduler
    pub lease_name: String,
    pub exchange: String,
    pub queue: String,
    /// Stop after this long; `None` runs until the process is killed
    pub run_for: Option<Duration>,
    pub outbox_interval: Duration,
    pub lease: LeaseConfig,
    pub bus: BusConfig,
    pub scheduler: SchedulerConfig,
}

impl NodeConfig {
    pub fn from_env(env: &dyn EnvLookup) -> anyhow::Result<Self> {
        let route = env.get("CONCORD_ROUTE").unwrap_or_else(|| {
            tracing::warn!("CONCORD_ROUTE not set; using 'default'");
            "default".to_string()
        });
        let name = env
            .get("CONCORD_NODE_NAME")
            .unwrap_or_else(|| format!("node-{}", std::process::id()));

        Ok(Self {
            route: Route::new(route).context("CONCORD_ROUTE")?,
            name,
            lease_name: env
                .get("CONCORD_NODE_LEASE")
                .unwrap_or_else(|| "concord-scheduler".to_string()),
            exchange: env
                .get("CONCORD_NODE_EXCHANGE")
                .unwrap_or_else(|| "concord.node".to_string()),
            queue: env
                .get("CONCORD_NODE_QUEUE")
                .unwrap_or_else(|| "heartbeats".to_string()),
            run_for: config::seconds(env, "CONCORD_NODE_RUN_SECS")?,
            outbox_interval: config::seconds(env, "CONCORD_NODE_OUTBOX_SECS")?
                .unwrap_or(Duration::from_millis(500)),
            lease: LeaseConfig::from_env(env).context("lease configuration")?,
            bus: BusConfig::from_env(env).context("bus configuration")?,
            scheduler: SchedulerConfig::from_env(env).context("scheduler configuration")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_and_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("CONCORD_ROUTE", "tenant-7"),
            ("CONCORD_NODE_NAME", "alpha"),
            ("CONCORD_NODE_RUN_SECS", "3"),
        ]);
        let cfg = NodeConfig::from_env(&env).unwrap();
        assert_eq!(cfg.route.as_str(), "tenant-7");
        assert_eq!(cfg.name, "alpha");
        assert_eq!(cfg.run_for, Some(Duration::from_secs(3)));
        assert_eq!(cfg.queue, "heartbeats");
    }

    #[test]
    fn invalid_component_config_is_reported() {
        let env: HashMap<&str, &str> = HashMap::from([("CONCORD_LEASE_RENEW_ATTEMPTS", "many")]);
        let err = NodeConfig::from_env(&env).unwrap_err();
        assert!(format!("{err:#}").contains("lease configuration"));
    }
}
