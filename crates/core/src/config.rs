//! Queue configuration.
//!
//! Values are layered: built-in defaults, then whatever the store has
//! persisted, then environment overrides. Only `max_retries` and
//! `backoff_base` (plus the optional backoff cap) are ever persisted.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

pub const ENV_DB_PATH: &str = "QUEUECTL_DB_PATH";
pub const ENV_MAX_RETRIES: &str = "QUEUECTL_MAX_RETRIES";
pub const ENV_BACKOFF_BASE: &str = "QUEUECTL_BACKOFF_BASE";
pub const ENV_POLL_INTERVAL_MS: &str = "QUEUECTL_POLL_INTERVAL_MS";
pub const ENV_COMMAND_TIMEOUT_SECS: &str = "QUEUECTL_COMMAND_TIMEOUT_SECS";

/// Process-wide queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Attempt ceiling for newly enqueued jobs.
    pub max_retries: u32,
    /// Backoff base: a job waits `backoff_base ^ attempts` seconds.
    pub backoff_base: u32,
    /// Location of the SQLite database.
    pub db_path: PathBuf,
    /// Optional ceiling on a single backoff delay, in seconds.
    pub max_backoff_secs: Option<u64>,
    /// How long an idle worker sleeps before polling again.
    pub poll_interval_ms: u64,
    /// Wall-clock limit for a single command.
    pub command_timeout_secs: u64,
}

impl Config {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_BACKOFF_BASE: u32 = 2;
    pub const DEFAULT_DB_PATH: &'static str = ".queuectl.db";
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
    pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 300;
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: Self::DEFAULT_MAX_RETRIES,
            backoff_base: Self::DEFAULT_BACKOFF_BASE,
            db_path: PathBuf::from(Self::DEFAULT_DB_PATH),
            max_backoff_secs: None,
            poll_interval_ms: Self::DEFAULT_POLL_INTERVAL_MS,
            command_timeout_secs: Self::DEFAULT_COMMAND_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Defaults with the process environment applied on top.
    pub fn from_env() -> DomainResult<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an environment-like lookup.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> DomainResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_DB_PATH).filter(|p| !p.trim().is_empty()) {
            self.db_path = PathBuf::from(path);
        }
        if let Some(v) = lookup(ENV_MAX_RETRIES) {
            self.max_retries = parse_number(ENV_MAX_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_BACKOFF_BASE) {
            self.backoff_base = parse_number(ENV_BACKOFF_BASE, &v)?;
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = parse_number(ENV_POLL_INTERVAL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_COMMAND_TIMEOUT_SECS) {
            self.command_timeout_secs = parse_number(ENV_COMMAND_TIMEOUT_SECS, &v)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_retries == 0 {
            return Err(DomainError::validation("max_retries must be at least 1"));
        }
        if self.backoff_base == 0 {
            return Err(DomainError::validation("backoff_base must be at least 1"));
        }
        if self.command_timeout_secs == 0 {
            return Err(DomainError::validation("command_timeout_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }
}

fn parse_number<T: core::str::FromStr>(key: &str, raw: &str) -> DomainResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| DomainError::validation(format!("{key}: '{raw}' is not a valid number")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_base, 2);
        assert_eq!(config.db_path, PathBuf::from(".queuectl.db"));
        assert_eq!(config.max_backoff_secs, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_apply() {
        let config = Config::default()
            .with_env_overrides(env(&[
                (ENV_DB_PATH, "/tmp/q.db"),
                (ENV_MAX_RETRIES, "5"),
                (ENV_BACKOFF_BASE, " 3 "),
            ]))
            .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.backoff_base, 3);
    }

    #[test]
    fn env_rejects_non_numeric_and_zero() {
        let err = Config::default()
            .with_env_overrides(env(&[(ENV_MAX_RETRIES, "many")]))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));

        let err = Config::default()
            .with_env_overrides(env(&[(ENV_BACKOFF_BASE, "0")]))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let config: Config = serde_json::from_str(r#"{"max_retries": 7}"#).unwrap();
        assert_eq!(config.max_retries, 7);
        assert_eq!(config.backoff_base, Config::DEFAULT_BACKOFF_BASE);
    }
}
