//! Environment-backed configuration helpers.
//!
//! Component configs are plain structs with `Default` and `with_*`
//! builders; their `from_env` constructors read overrides through an
//! [`EnvLookup`] so tests can feed a map instead of the process environment.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::error::ValidationError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Source of configuration values keyed by environment variable name.
pub trait EnvLookup {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|v| !v.trim().is_empty())
    }
}

impl EnvLookup for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

impl EnvLookup for HashMap<&str, &str> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).map(|v| v.to_string())
    }
}

/// Parse `key` if present.
pub fn parse<T>(env: &dyn EnvLookup, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

/// Parse a duration given in (possibly fractional) seconds.
pub fn seconds(env: &dyn EnvLookup, key: &str) -> Result<Option<Duration>, ConfigError> {
    let Some(secs) = parse::<f64>(env, key)? else {
        return Ok(None);
    };
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError::Invalid {
            key: key.to_string(),
            value: secs.to_string(),
            reason: "must be a non-negative number of seconds".to_string(),
        });
    }
    Ok(Some(Duration::from_secs_f64(secs)))
}
