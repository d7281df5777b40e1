//! Retry policy with exponential backoff and jitter.
//!
//! The policy is a pure function from attempt number to delay. It holds no state,
//! so one policy can be shared by every call to a dependency.
//!
//! ```text
//! delay(n) = min(base_delay * 2^(n-1), max_delay) * U[1 - jitter, 1 + jitter]
//! ```
//!
//! # Example
//!
//! ```rust
//! use conduit_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .jitter_ratio(0.0)
//!     .build();
//!
//! assert_eq!(policy.delay(1), Duration::from_millis(100));
//! assert_eq!(policy.delay(2), Duration::from_millis(200));
//! assert!(policy.should_retry(2));
//! assert!(!policy.should_retry(3));
//! ```

use conduit_core::config::ResilienceConfig;
use rand::Rng;
use std::time::Duration;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3 (first attempt plus two retries)
/// - `base_delay`: 100ms
/// - `max_delay`: 10 seconds
/// - `jitter_ratio`: 0.1
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per logical call, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Cap for exponential backoff (before jitter)
    pub max_delay: Duration,
    /// Spread of the uniform jitter factor, in `0.0..=1.0`
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.1,
        }
    }
}

impl From<&ResilienceConfig> for RetryPolicy {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter_ratio: bounded_jitter(config.jitter_ratio),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            base_delay: None,
            max_delay: None,
            jitter_ratio: None,
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before the attempt after `attempt` (1-based), without jitter.
    ///
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Delay to sleep after failed attempt `attempt` (1-based), with jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// [`delay`](Self::delay) drawing jitter from `rng`.
    #[must_use]
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter = bounded_jitter(self.jitter_ratio);
        if jitter <= 0.0 {
            return backoff;
        }
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        backoff.mul_f64(factor)
    }

    /// Get maximum attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether another attempt may follow failed attempt `attempt` (1-based).
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    jitter_ratio: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set total attempts (values below 1 are raised to 1).
    #[must_use]
    pub const fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Set delay after the first failure.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set jitter ratio (clamped to `0.0..=1.0`; NaN and infinities disable jitter).
    #[must_use]
    pub const fn jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = Some(ratio);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts).max(1),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            jitter_ratio: bounded_jitter(self.jitter_ratio.unwrap_or(defaults.jitter_ratio)),
        }
    }
}

/// Clamp to `0.0..=1.0`. Non-finite ratios mean no jitter.
fn bounded_jitter(ratio: f64) -> f64 {
    if ratio.is_finite() {
        ratio.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy::builder()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .jitter_ratio(0.0)
            .build()
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = no_jitter();
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay(5), Duration::from_secs(1));
        assert_eq!(policy.delay(64), Duration::from_secs(1));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::builder().max_attempts(3).build();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn test_builder_clamps() {
        let policy = RetryPolicy::builder()
            .max_attempts(0)
            .jitter_ratio(3.0)
            .build();
        assert_eq!(policy.max_attempts, 1);
        assert!((policy.jitter_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_non_finite_jitter_disables_jitter() {
        for ratio in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let policy = RetryPolicy::builder()
                .base_delay(Duration::from_millis(100))
                .jitter_ratio(ratio)
                .build();
            assert!(policy.jitter_ratio.abs() < f64::EPSILON, "{ratio}");
            assert_eq!(policy.delay(1), Duration::from_millis(100));
        }
    }

    #[test]
    fn test_delay_tolerates_non_finite_field() {
        let policy = RetryPolicy {
            jitter_ratio: f64::NAN,
            ..no_jitter()
        };
        assert_eq!(policy.delay(2), Duration::from_millis(200));
    }

    #[test]
    fn test_from_config() {
        let config = ResilienceConfig::default()
            .with_max_attempts(4)
            .with_base_delay(Duration::from_millis(50));
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff(1), Duration::from_millis(50));
    }

    proptest! {
        #[test]
        fn delay_stays_within_jitter_band(
            attempt in 1_u32..40,
            base_ms in 1_u64..1_000,
            jitter in 0.0_f64..=1.0,
        ) {
            let policy = RetryPolicy::builder()
                .base_delay(Duration::from_millis(base_ms))
                .max_delay(Duration::from_secs(30))
                .jitter_ratio(jitter)
                .build();

            let backoff = policy.backoff(attempt);
            let delay = policy.delay(attempt);

            prop_assert!(backoff <= policy.max_delay);
            prop_assert!(delay >= backoff.mul_f64(1.0 - jitter).saturating_sub(Duration::from_nanos(1)));
            prop_assert!(delay <= backoff.mul_f64(1.0 + jitter) + Duration::from_nanos(1));
        }

        #[test]
        fn backoff_is_monotonic(attempt in 1_u32..60, base_ms in 1_u64..500) {
            let policy = RetryPolicy::builder()
                .base_delay(Duration::from_millis(base_ms))
                .max_delay(Duration::from_secs(60))
                .jitter_ratio(0.0)
                .build();
            prop_assert!(policy.backoff(attempt) <= policy.backoff(attempt + 1));
        }
    }
}
