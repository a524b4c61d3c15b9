// Environment-driven settings shared by the API, worker, and CLI

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_QUEUE_NAME: &str = "runbox-runs";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Read an environment variable, treating unset and blank the same.
pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse an environment variable, falling back to `default` when unset.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, &raw, e.to_string())),
        None => Ok(default),
    }
}

/// Broker settings. Queue name and connection are the only knobs; the key
/// layout itself lives in [`crate::redis`].
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub redis_url: String,
    pub queue_name: String,
    pub result_ttl_secs: u64,
    /// How long a producer waits for a worker reply. `None` lets the caller
    /// derive it from the sandbox timeout.
    pub reply_timeout: Option<Duration>,
}

impl QueueSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis_url = env_var("RUNBOX_REDIS_URL")
            .or_else(|| env_var("REDIS_URL"))
            .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());

        let reply_timeout = match env_var("RUNBOX_REPLY_TIMEOUT_SECS") {
            Some(_) => Some(Duration::from_secs(env_parse("RUNBOX_REPLY_TIMEOUT_SECS", 0u64)?)),
            None => None,
        };

        Ok(Self {
            redis_url,
            queue_name: env_var("RUNBOX_QUEUE_NAME").unwrap_or_else(|| DEFAULT_QUEUE_NAME.to_string()),
            result_ttl_secs: env_parse("RUNBOX_RESULT_TTL_SECS", 86_400)?,
            reply_timeout,
        })
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            result_ttl_secs: 86_400,
            reply_timeout: None,
        }
    }
}
