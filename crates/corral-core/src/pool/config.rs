//! Pool configuration.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Settings fixed for the lifetime of a [`WorkerPool`](super::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Number of execution units.
    pub pool_size: usize,
    /// Tasks that may wait for a worker before submissions are rejected.
    pub max_queue_size: usize,
    /// Default per-task deadline, covering queue wait and execution.
    #[serde(rename = "workerTimeoutMs", with = "millis")]
    pub worker_timeout: Duration,
    /// Replace crashed workers instead of dropping them.
    pub restart_on_error: bool,
    /// Restarts allowed per worker before it is dropped for good.
    pub max_restarts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_queue_size: 100,
            worker_timeout: Duration::from_millis(30_000),
            restart_on_error: true,
            max_restarts: 3,
        }
    }
}

impl PoolConfig {
    /// Create config from `CORRAL_*` environment variables.
    ///
    /// Variables that are absent or do not parse keep their default.
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub(crate) fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            default: T,
        ) -> T {
            match lookup(key) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    tracing::warn!("Ignoring unparsable {}={:?}", key, raw);
                    default
                }),
                None => default,
            }
        }

        let restart_on_error = match lookup("CORRAL_RESTART_ON_ERROR") {
            Some(v) => v == "1" || v.eq_ignore_ascii_case("true"),
            None => defaults.restart_on_error,
        };

        Self {
            pool_size: parsed(&lookup, "CORRAL_POOL_SIZE", defaults.pool_size),
            max_queue_size: parsed(&lookup, "CORRAL_MAX_QUEUE_SIZE", defaults.max_queue_size),
            worker_timeout: Duration::from_millis(parsed(
                &lookup,
                "CORRAL_WORKER_TIMEOUT_MS",
                defaults.worker_timeout.as_millis() as u64,
            )),
            restart_on_error,
            max_restarts: parsed(&lookup, "CORRAL_MAX_RESTARTS", defaults.max_restarts),
        }
    }

    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    pub fn with_restarts(mut self, restart_on_error: bool, max_restarts: u32) -> Self {
        self.restart_on_error = restart_on_error;
        self.max_restarts = max_restarts;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig("pool_size must be at least 1".to_string()));
        }
        if self.worker_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "worker_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.worker_timeout, Duration::from_secs(30));
        assert!(config.restart_on_error);
        assert_eq!(config.max_restarts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars() {
        let config = PoolConfig::from_vars(lookup(&[
            ("CORRAL_POOL_SIZE", "8"),
            ("CORRAL_WORKER_TIMEOUT_MS", "1500"),
            ("CORRAL_RESTART_ON_ERROR", "false"),
            ("CORRAL_MAX_RESTARTS", "not-a-number"),
        ]));
        assert_eq!(config.pool_size, 8);
        assert_eq!(config.max_queue_size, 100);
        assert_eq!(config.worker_timeout, Duration::from_millis(1500));
        assert!(!config.restart_on_error);
        assert_eq!(config.max_restarts, 3);
    }

    #[test]
    fn test_validate_rejects_zero() {
        assert!(matches!(
            PoolConfig::default().with_pool_size(0).validate(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(
            PoolConfig::default()
                .with_worker_timeout(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"poolSize": 2, "workerTimeoutMs": 250}"#).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.worker_timeout, Duration::from_millis(250));
        assert_eq!(config.max_restarts, 3);
    }
}
