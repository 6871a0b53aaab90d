//! Configuration loading and representation.
//!
//! Values come from environment variables. Parsing goes through a lookup
//! function so tests can feed a map instead of touching the process
//! environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::claim::BackoffPolicy;
use crate::value::Value;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

fn parse<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    raw.map(|value| {
        value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
        })
    })
    .transpose()
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Postgres pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Server-side `statement_timeout` applied to every pooled connection.
    pub statement_timeout: Option<Duration>,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
            statement_timeout: None,
        }
    }

    /// `DATABASE_URL` (required), `DATABASE_MAX_CONNECTIONS`,
    /// `DATABASE_ACQUIRE_TIMEOUT_MS`, `DATABASE_STATEMENT_TIMEOUT_MS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let url = lookup("DATABASE_URL")
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing("DATABASE_URL".to_string()))?;
        let mut config = Self::new(url);

        if let Some(max) = parse::<u32>("DATABASE_MAX_CONNECTIONS", lookup("DATABASE_MAX_CONNECTIONS"))? {
            config.max_connections = max;
        }
        if let Some(ms) = parse::<u64>("DATABASE_ACQUIRE_TIMEOUT_MS", lookup("DATABASE_ACQUIRE_TIMEOUT_MS"))? {
            config.acquire_timeout = Duration::from_millis(ms);
        }
        config.statement_timeout = parse::<u64>(
            "DATABASE_STATEMENT_TIMEOUT_MS",
            lookup("DATABASE_STATEMENT_TIMEOUT_MS"),
        )?
        .map(Duration::from_millis);

        Ok(config)
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }
}

/// Claim worker settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Name for logging.
    pub name: String,
    pub batch_size: u64,
    /// Sleep between polls when a batch comes back empty.
    pub poll_interval: Duration,
    /// Failures after which a row gets `failed_status` instead of a retry.
    pub max_attempts: Option<u32>,
    pub success_status: Value,
    pub failed_status: Value,
    pub backoff: BackoffPolicy,
    /// Release claims older than this at the start of each cycle.
    pub stale_after: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "claim-worker".to_string(),
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            max_attempts: None,
            success_status: Value::from("DONE"),
            failed_status: Value::from("FAILED"),
            backoff: BackoffPolicy::default(),
            stale_after: None,
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_statuses(mut self, success: impl Into<Value>, failed: impl Into<Value>) -> Self {
        self.success_status = success.into();
        self.failed_status = failed.into();
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = Some(age);
        self
    }

    /// Override from `{prefix}_BATCH_SIZE`, `{prefix}_POLL_INTERVAL_MS`,
    /// `{prefix}_MAX_ATTEMPTS`, `{prefix}_BACKOFF_BASE_SECS`,
    /// `{prefix}_BACKOFF_CAP_SECS` and `{prefix}_STALE_AFTER_SECS`.
    pub fn apply_env(self, prefix: &str) -> Result<Self, ConfigError> {
        self.apply_lookup(prefix, env_lookup)
    }

    pub fn apply_lookup<F>(mut self, prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let key = format!("{prefix}_{suffix}");
            let raw = lookup(&key);
            (key, raw)
        };

        let (key, raw) = get("BATCH_SIZE");
        if let Some(n) = parse::<u64>(&key, raw)? {
            self.batch_size = n;
        }
        let (key, raw) = get("POLL_INTERVAL_MS");
        if let Some(ms) = parse::<u64>(&key, raw)? {
            self.poll_interval = Duration::from_millis(ms);
        }
        let (key, raw) = get("MAX_ATTEMPTS");
        if let Some(n) = parse::<u32>(&key, raw)? {
            self.max_attempts = Some(n);
        }
        let (key, raw) = get("BACKOFF_BASE_SECS");
        if let Some(secs) = parse::<u64>(&key, raw)? {
            self.backoff.base = Duration::from_secs(secs);
        }
        let (key, raw) = get("BACKOFF_CAP_SECS");
        if let Some(secs) = parse::<u64>(&key, raw)? {
            self.backoff.cap = Duration::from_secs(secs);
        }
        let (key, raw) = get("STALE_AFTER_SECS");
        if let Some(secs) = parse::<u64>(&key, raw)? {
            self.stale_after = Some(Duration::from_secs(secs));
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn database_defaults() {
        let config = DatabaseConfig::from_lookup(lookup(&[("DATABASE_URL", "postgres://localhost/app")])).unwrap();
        assert_eq!(config, DatabaseConfig::new("postgres://localhost/app"));
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.statement_timeout, None);
    }

    #[test]
    fn database_overrides_and_errors() {
        let config = DatabaseConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/app"),
            ("DATABASE_MAX_CONNECTIONS", "32"),
            ("DATABASE_STATEMENT_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.statement_timeout, Some(Duration::from_millis(1500)));

        assert_eq!(
            DatabaseConfig::from_lookup(lookup(&[])).unwrap_err(),
            ConfigError::Missing("DATABASE_URL".into())
        );
        let err = DatabaseConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/app"),
            ("DATABASE_MAX_CONNECTIONS", "lots"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "DATABASE_MAX_CONNECTIONS"));
    }

    #[test]
    fn worker_env_overrides_use_prefix() {
        let config = WorkerConfig::default()
            .with_name("outbox")
            .apply_lookup(
                "OUTBOX",
                lookup(&[
                    ("OUTBOX_BATCH_SIZE", "50"),
                    ("OUTBOX_MAX_ATTEMPTS", "8"),
                    ("OUTBOX_BACKOFF_CAP_SECS", "600"),
                    ("OUTBOX_STALE_AFTER_SECS", "300"),
                    ("OTHER_BATCH_SIZE", "1"),
                ]),
            )
            .unwrap();

        assert_eq!(config.name, "outbox");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_attempts, Some(8));
        assert_eq!(config.backoff, BackoffPolicy::default().with_cap(Duration::from_secs(600)));
        assert_eq!(config.stale_after, Some(Duration::from_secs(300)));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
    }

    #[test]
    fn worker_rejects_garbage() {
        let err = WorkerConfig::default()
            .apply_lookup("Q", lookup(&[("Q_POLL_INTERVAL_MS", "-5")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "Q_POLL_INTERVAL_MS".into(),
                value: "-5".into()
            }
        );
    }
}
