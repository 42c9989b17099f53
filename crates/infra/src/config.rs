//! Executor configuration: defaults, environment loading, runtime updates.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;

use forgeexec_core::TimeUnit;

/// Configuration error (malformed or out-of-range values).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}': {reason}")]
    Malformed {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0}")]
    OutOfRange(String),
}

pub const ENV_TIMEUNIT: &str = "EXECUTOR_TIMEUNIT";
pub const ENV_RUNNING_MAX: &str = "EXECUTOR_RUNNING_MAX";
pub const ENV_INTERVAL: &str = "EXECUTOR_INTERVAL";
pub const ENV_RETRIES: &str = "EXECUTOR_RETRIES";
pub const ENV_POOL_SIZE: &str = "EXECUTOR_POOL_SIZE";
pub const ENV_RETRY_DELAY: &str = "EXECUTOR_RETRY_DELAY";
pub const ENV_SWEEP_INTERVAL: &str = "EXECUTOR_SWEEP_INTERVAL";
pub const ENV_NAME: &str = "EXECUTOR_NAME";

/// Executor configuration.
///
/// Every interval is expressed in `time_unit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Engine name, used for thread names and worker identities.
    pub name: String,
    pub time_unit: TimeUnit,
    /// Idle wait between polls when nothing is eligible.
    pub poll_interval: u64,
    /// Maximum retry attempts after the first failure.
    pub retries: u32,
    /// Base backoff between a failure and the next attempt.
    pub retry_delay: u64,
    /// Number of worker threads.
    pub pool_size: usize,
    /// Staleness threshold for RUNNING requests; negative disables sweeping.
    pub max_running_time: i64,
    /// Wait between periodic sweeps.
    pub sweep_interval: u64,
    /// Candidates fetched per poll.
    pub poll_batch: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "executor".to_string(),
            time_unit: TimeUnit::Seconds,
            poll_interval: 3,
            retries: 3,
            retry_delay: 1,
            pool_size: 1,
            max_running_time: 600,
            sweep_interval: 60,
            poll_batch: 10,
        }
    }
}

impl ExecutorConfig {
    /// Load from `EXECUTOR_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load using an arbitrary variable lookup (environment, file, test map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            name: lookup(ENV_NAME).unwrap_or(defaults.name),
            time_unit: parse_var(&lookup, ENV_TIMEUNIT, defaults.time_unit)?,
            poll_interval: parse_var(&lookup, ENV_INTERVAL, defaults.poll_interval)?,
            retries: parse_var(&lookup, ENV_RETRIES, defaults.retries)?,
            retry_delay: parse_var(&lookup, ENV_RETRY_DELAY, defaults.retry_delay)?,
            pool_size: parse_var(&lookup, ENV_POOL_SIZE, defaults.pool_size)?,
            max_running_time: parse_var(&lookup, ENV_RUNNING_MAX, defaults.max_running_time)?,
            sweep_interval: parse_var(&lookup, ENV_SWEEP_INTERVAL, defaults.sweep_interval)?,
            poll_batch: defaults.poll_batch,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_time_unit(mut self, unit: TimeUnit) -> Self {
        self.time_unit = unit;
        self
    }

    pub fn with_poll_interval(mut self, interval: u64) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_delay(mut self, delay: u64) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_max_running_time(mut self, threshold: i64) -> Self {
        self.max_running_time = threshold;
        self
    }

    pub fn with_sweep_interval(mut self, interval: u64) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::OutOfRange("name must not be empty".to_string()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::OutOfRange("pool size must be at least 1".to_string()));
        }
        if self.poll_interval == 0 {
            return Err(ConfigError::OutOfRange("poll interval must be at least 1".to_string()));
        }
        if self.sweep_interval == 0 {
            return Err(ConfigError::OutOfRange("sweep interval must be at least 1".to_string()));
        }
        if self.poll_batch == 0 {
            return Err(ConfigError::OutOfRange("poll batch must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn poll_wait(&self) -> Duration {
        self.time_unit.duration(self.poll_interval)
    }

    pub fn sweep_wait(&self) -> Duration {
        self.time_unit.duration(self.sweep_interval)
    }

    pub fn retry_base_delay(&self) -> Duration {
        self.time_unit.duration(self.retry_delay)
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Malformed {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

/// Shared, runtime-mutable configuration.
///
/// Workers and the sweeper take a snapshot at the start of every cycle, so an
/// update applies from the next cycle on and never to an in-flight claim.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<ExecutorConfig>>,
}

impl ConfigHandle {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> ExecutorConfig {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Apply `change` to a copy, validate it, then publish it.
    pub fn update<F>(&self, change: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut ExecutorConfig),
    {
        let mut guard = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let mut next = guard.clone();
        change(&mut next);
        next.validate()?;
        *guard = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = ExecutorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ExecutorConfig::default());
        assert_eq!(config.time_unit, TimeUnit::Seconds);
        assert_eq!(config.max_running_time, 600);
    }

    #[test]
    fn reads_overrides() {
        let config = ExecutorConfig::from_lookup(lookup(&[
            (ENV_TIMEUNIT, "MILLISECONDS"),
            (ENV_RUNNING_MAX, "-1"),
            (ENV_INTERVAL, "250"),
            (ENV_RETRIES, "5"),
            (ENV_POOL_SIZE, "4"),
            (ENV_NAME, "billing"),
        ]))
        .unwrap();

        assert_eq!(config.time_unit, TimeUnit::Milliseconds);
        assert_eq!(config.max_running_time, -1);
        assert_eq!(config.poll_wait(), Duration::from_millis(250));
        assert_eq!(config.retries, 5);
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.name, "billing");
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = ExecutorConfig::from_lookup(lookup(&[(ENV_POOL_SIZE, "-3")])).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { var: ENV_POOL_SIZE, .. }));

        let err = ExecutorConfig::from_lookup(lookup(&[(ENV_TIMEUNIT, "weeks")])).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { var: ENV_TIMEUNIT, .. }));

        let err = ExecutorConfig::from_lookup(lookup(&[(ENV_POOL_SIZE, "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange(_)));
    }

    #[test]
    fn handle_rejects_invalid_updates() {
        let handle = ConfigHandle::new(ExecutorConfig::default());

        handle.update(|c| c.retries = 7).unwrap();
        assert_eq!(handle.snapshot().retries, 7);

        assert!(handle.update(|c| c.pool_size = 0).is_err());
        assert_eq!(handle.snapshot().pool_size, 1);
    }
}
