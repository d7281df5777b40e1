//! Resilience configuration.
//!
//! One [`ResilienceConfig`] describes the breaker, retry and redelivery settings for
//! a dependency. It can be deserialized (durations in milliseconds), built with
//! `with_*` setters, or loaded from `CONDUIT_*` environment variables. Invalid
//! settings are a startup error: call [`ResilienceConfig::validate`] (the loaders
//! and runtime constructors do) and abort if it fails.
//!
//! | Variable                      | Field               | Default |
//! |-------------------------------|---------------------|---------|
//! | `CONDUIT_FAILURE_THRESHOLD`   | `failure_threshold` | 5       |
//! | `CONDUIT_RESET_TIMEOUT_MS`    | `reset_timeout`     | 60000   |
//! | `CONDUIT_MAX_ATTEMPTS`        | `max_attempts`      | 3       |
//! | `CONDUIT_BASE_DELAY_MS`       | `base_delay`        | 100     |
//! | `CONDUIT_MAX_DELAY_MS`        | `max_delay`         | 10000   |
//! | `CONDUIT_JITTER_RATIO`        | `jitter_ratio`      | 0.1     |
//! | `CONDUIT_MAX_REDELIVERIES`    | `max_redeliveries`  | 3       |
//! | `CONDUIT_ATTEMPT_TIMEOUT_MS`  | `attempt_timeout`   | 10000   |

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors. These abort startup; they are never handled per call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed
    #[error("Invalid value '{value}' for {key}")]
    InvalidValue {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
    },

    /// A setting is out of range
    #[error("Invalid setting '{field}': {reason}")]
    Invalid {
        /// Field name
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// Breaker, retry and redelivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive logical failures that open the breaker
    pub failure_threshold: usize,
    /// Time an open breaker waits before allowing a trial call
    #[serde(rename = "reset_timeout_ms", with = "millis")]
    pub reset_timeout: Duration,
    /// Transport attempts per logical call (including the first)
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Cap on any single retry delay
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Relative jitter applied to each delay, in `0.0..=1.0`
    pub jitter_ratio: f64,
    /// Redeliveries allowed before a retryable message is dead-lettered
    pub max_redeliveries: u32,
    /// Deadline for a single transport attempt
    #[serde(rename = "attempt_timeout_ms", with = "millis")]
    pub attempt_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilienceConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.1,
            max_redeliveries: 3,
            attempt_timeout: Duration::from_secs(10),
        }
    }

    /// Set the failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the breaker reset timeout.
    #[must_use]
    pub const fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the maximum attempts per call.
    #[must_use]
    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base retry delay.
    #[must_use]
    pub const fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum retry delay.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter ratio.
    #[must_use]
    pub const fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    /// Set the maximum redeliveries.
    #[must_use]
    pub const fn with_max_redeliveries(mut self, redeliveries: u32) -> Self {
        self.max_redeliveries = redeliveries;
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Check every setting is in range.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(invalid("failure_threshold", "must be at least 1"));
        }
        if self.reset_timeout.is_zero() {
            return Err(invalid("reset_timeout", "must be greater than zero"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts", "must be at least 1"));
        }
        if self.base_delay > self.max_delay {
            return Err(invalid(
                "base_delay",
                format!(
                    "{:?} exceeds max_delay {:?}",
                    self.base_delay, self.max_delay
                ),
            ));
        }
        if !self.jitter_ratio.is_finite() || !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(invalid(
                "jitter_ratio",
                format!("{} is outside 0.0..=1.0", self.jitter_ratio),
            ));
        }
        if self.attempt_timeout.is_zero() {
            return Err(invalid("attempt_timeout", "must be greater than zero"));
        }
        Ok(())
    }

    /// Load from `CONDUIT_*` environment variables, falling back to defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is unparsable or a setting is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load from an arbitrary key lookup (used by [`from_env`](Self::from_env)).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a value is unparsable or a setting is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::new();
        let config = Self {
            failure_threshold: parse_or(&lookup, "CONDUIT_FAILURE_THRESHOLD", defaults.failure_threshold)?,
            reset_timeout: millis_or(&lookup, "CONDUIT_RESET_TIMEOUT_MS", defaults.reset_timeout)?,
            max_attempts: parse_or(&lookup, "CONDUIT_MAX_ATTEMPTS", defaults.max_attempts)?,
            base_delay: millis_or(&lookup, "CONDUIT_BASE_DELAY_MS", defaults.base_delay)?,
            max_delay: millis_or(&lookup, "CONDUIT_MAX_DELAY_MS", defaults.max_delay)?,
            jitter_ratio: parse_or(&lookup, "CONDUIT_JITTER_RATIO", defaults.jitter_ratio)?,
            max_redeliveries: parse_or(&lookup, "CONDUIT_MAX_REDELIVERIES", defaults.max_redeliveries)?,
            attempt_timeout: millis_or(&lookup, "CONDUIT_ATTEMPT_TIMEOUT_MS", defaults.attempt_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn millis_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))
        .map(Duration::from_millis)
}

/// Serde adapter storing a [`Duration`] as whole milliseconds.
mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
