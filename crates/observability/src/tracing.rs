//! Tracing/logging initialization.
//!
//! Output is JSON by default; `CONCORD_LOG_FORMAT=pretty` switches to the
//! human-readable formatter. Filtering follows `RUST_LOG` (default `info`).

use tracing_subscriber::EnvFilter;

use concord_core::EnvLookup;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl LogFormat {
    /// Unknown values fall back to JSON.
    pub fn from_env(env: &dyn EnvLookup) -> Self {
        match env.get("CONCORD_LOG_FORMAT") {
            Some(v) if v.trim().eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(env: &dyn EnvLookup) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = match LogFormat::from_env(env) {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .pretty()
            .with_thread_names(true)
            .try_init(),
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn format_selection() {
        let pretty: HashMap<&str, &str> = HashMap::from([("CONCORD_LOG_FORMAT", "Pretty")]);
        let other: HashMap<&str, &str> = HashMap::from([("CONCORD_LOG_FORMAT", "xml")]);
        let unset: HashMap<&str, &str> = HashMap::new();
        assert_eq!(LogFormat::from_env(&pretty), LogFormat::Pretty);
        assert_eq!(LogFormat::from_env(&other), LogFormat::Json);
        assert_eq!(LogFormat::from_env(&unset), LogFormat::Json);
    }

    #[test]
    fn repeated_init_is_harmless() {
        let env: HashMap<&str, &str> = HashMap::new();
        init(&env);
        init(&env);
    }
}
