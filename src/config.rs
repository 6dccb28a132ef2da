//! Engine configuration.
//!
//! This module provides configuration for the task queue engine: lease
//! durations, retry backoff, starvation-prevention boosting and the
//! maintenance sweep intervals. Values come from defaults, builder-style
//! setters or `TASKFORGE_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::retry::{BackoffPolicy, DEFAULT_UNKNOWN_RETRY_BUDGET};
use crate::store::DEFAULT_MAX_ATTEMPTS;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Settings for the age-based priority boost sweep.
///
/// Claimable tasks whose `not_before` age exceeds `age_threshold` get one
/// `step` of priority per elapsed threshold window, capped at
/// `max_priority`. This keeps a steady stream of high-priority work from
/// starving the low-priority tail.
#[derive(Debug, Clone)]
pub struct BoostConfig {
    /// How old a claimable task must be before it is boosted again.
    pub age_threshold: Duration,
    /// Priority added per boost.
    pub step: i32,
    /// Ceiling a boosted priority can reach.
    pub max_priority: i32,
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            age_threshold: Duration::from_secs(600), // 10 minutes
            step: 1,
            max_priority: 100,
        }
    }
}

/// Configuration for the task queue engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    // Claiming
    /// Ownership lease granted per claim; `claim_deadline = now + lease`.
    pub lease_duration: Duration,
    /// Attempt ceiling applied when an enqueue request does not set one.
    pub default_max_attempts: u32,

    // Liveness
    /// Worker liveness lease; a worker missing renewal past this is reaped.
    pub worker_lease_duration: Duration,
    /// How often the reaper sweeps for expired workers and claims.
    pub reaper_interval: Duration,

    // Retry
    /// Backoff shape for retryable failures.
    pub backoff: BackoffPolicy,
    /// Retry ceiling for failures classified Unknown.
    pub unknown_retry_budget: u32,

    // Starvation prevention
    /// Boost sweep settings.
    pub boost: BoostConfig,
    /// How often the boost sweep runs.
    pub boost_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
            worker_lease_duration: Duration::from_secs(30),
            reaper_interval: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
            unknown_retry_budget: DEFAULT_UNKNOWN_RETRY_BUDGET,
            boost: BoostConfig::default(),
            boost_interval: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `TASKFORGE_LEASE_SECS`: task ownership lease in seconds (default: 60)
    /// - `TASKFORGE_MAX_ATTEMPTS`: default attempt ceiling (default: 3)
    /// - `TASKFORGE_WORKER_LEASE_SECS`: worker liveness lease in seconds (default: 30)
    /// - `TASKFORGE_REAPER_INTERVAL_SECS`: reaper sweep interval (default: 10)
    /// - `TASKFORGE_BACKOFF_BASE_SECS`: backoff base delay (default: 2)
    /// - `TASKFORGE_BACKOFF_MULTIPLIER`: backoff growth factor (default: 2.0)
    /// - `TASKFORGE_BACKOFF_MAX_SECS`: backoff ceiling (default: 3600)
    /// - `TASKFORGE_UNKNOWN_RETRY_BUDGET`: retries for unclassified failures (default: 2)
    /// - `TASKFORGE_BOOST_AGE_SECS`: age before a claimable task is boosted (default: 600)
    /// - `TASKFORGE_BOOST_STEP`: priority added per boost (default: 1)
    /// - `TASKFORGE_BOOST_MAX_PRIORITY`: boosted priority ceiling (default: 100)
    /// - `TASKFORGE_BOOST_INTERVAL_SECS`: boost sweep interval (default: 60)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            lease_duration: env_duration_secs("TASKFORGE_LEASE_SECS", defaults.lease_duration)?,
            default_max_attempts: env_parse(
                "TASKFORGE_MAX_ATTEMPTS",
                defaults.default_max_attempts,
            )?,
            worker_lease_duration: env_duration_secs(
                "TASKFORGE_WORKER_LEASE_SECS",
                defaults.worker_lease_duration,
            )?,
            reaper_interval: env_duration_secs(
                "TASKFORGE_REAPER_INTERVAL_SECS",
                defaults.reaper_interval,
            )?,
            backoff: BackoffPolicy {
                base_delay: env_duration_secs(
                    "TASKFORGE_BACKOFF_BASE_SECS",
                    defaults.backoff.base_delay,
                )?,
                multiplier: env_parse("TASKFORGE_BACKOFF_MULTIPLIER", defaults.backoff.multiplier)?,
                max_delay: env_duration_secs(
                    "TASKFORGE_BACKOFF_MAX_SECS",
                    defaults.backoff.max_delay,
                )?,
            },
            unknown_retry_budget: env_parse(
                "TASKFORGE_UNKNOWN_RETRY_BUDGET",
                defaults.unknown_retry_budget,
            )?,
            boost: BoostConfig {
                age_threshold: env_duration_secs(
                    "TASKFORGE_BOOST_AGE_SECS",
                    defaults.boost.age_threshold,
                )?,
                step: env_parse("TASKFORGE_BOOST_STEP", defaults.boost.step)?,
                max_priority: env_parse(
                    "TASKFORGE_BOOST_MAX_PRIORITY",
                    defaults.boost.max_priority,
                )?,
            },
            boost_interval: env_duration_secs(
                "TASKFORGE_BOOST_INTERVAL_SECS",
                defaults.boost_interval,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Sets the task ownership lease.
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// Sets the default attempt ceiling.
    pub fn with_default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Sets the worker liveness lease.
    pub fn with_worker_lease_duration(mut self, lease: Duration) -> Self {
        self.worker_lease_duration = lease;
        self
    }

    /// Sets the reaper sweep interval.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Sets the backoff policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the Unknown-class retry budget.
    pub fn with_unknown_retry_budget(mut self, budget: u32) -> Self {
        self.unknown_retry_budget = budget;
        self
    }

    /// Sets the boost sweep parameters.
    pub fn with_boost(mut self, boost: BoostConfig) -> Self {
        self.boost = boost;
        self
    }

    /// Sets the boost sweep interval.
    pub fn with_boost_interval(mut self, interval: Duration) -> Self {
        self.boost_interval = interval;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::ValidationFailed(format!(
                "backoff multiplier must be >= 1.0, got {}",
                self.backoff.multiplier
            )));
        }
        if self.backoff.max_delay < self.backoff.base_delay {
            return Err(ConfigError::ValidationFailed(
                "backoff max_delay must be >= base_delay".to_string(),
            ));
        }
        if self.boost.step <= 0 {
            return Err(ConfigError::ValidationFailed(
                "boost step must be positive".to_string(),
            ));
        }
        if self.lease_duration.is_zero() || self.worker_lease_duration.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "lease durations must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parses an environment variable as whole seconds.
fn env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(key) {
        Ok(value) => {
            let secs: u64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected whole seconds, got '{value}'"),
            })?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

/// Parses an environment variable, falling back to a default when unset.
fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("could not parse '{value}'"),
        }),
        Err(_) => Ok(default),
    }
}
