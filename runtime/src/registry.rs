//! Process-wide registry of circuit breakers, one per dependency.
//!
//! Breakers are built once from configuration and handed to every client that
//! targets the same dependency. The registry never recreates a breaker, so all
//! callers see the same failure history.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::health::{DependencyHealth, HealthReport};
use conduit_core::config::{ConfigError, ResilienceConfig};
use conduit_core::environment::{Clock, SystemClock};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Breakers keyed by dependency name.
#[derive(Clone)]
pub struct BreakerRegistry {
    defaults: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    breakers: Arc<Mutex<BTreeMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    /// Registry whose breakers use `defaults` and the system clock.
    #[must_use]
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self::with_clock(defaults, Arc::new(SystemClock))
    }

    /// Registry whose breakers read time from `clock`.
    #[must_use]
    pub fn with_clock(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            defaults,
            clock,
            breakers: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Registry built from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    pub fn from_config(config: &ResilienceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(CircuitBreakerConfig::from(config)))
    }

    /// The breaker for `dependency`, created with the default config on first use.
    #[must_use]
    pub fn get_or_create(&self, dependency: &str) -> CircuitBreaker {
        self.get_or_create_with(dependency, self.defaults.clone())
    }

    /// The breaker for `dependency`, created with `config` on first use.
    ///
    /// An existing breaker keeps its original configuration.
    #[must_use]
    pub fn get_or_create_with(&self, dependency: &str, config: CircuitBreakerConfig) -> CircuitBreaker {
        let mut breakers = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        breakers
            .entry(dependency.to_string())
            .or_insert_with(|| {
                tracing::debug!(dependency, "Registering circuit breaker");
                CircuitBreaker::with_clock(dependency, config, Arc::clone(&self.clock))
            })
            .clone()
    }

    /// The breaker for `dependency`, if one was created.
    #[must_use]
    pub fn get(&self, dependency: &str) -> Option<CircuitBreaker> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dependency)
            .cloned()
    }

    /// Registered dependency names, sorted.
    #[must_use]
    pub fn dependencies(&self) -> Vec<String> {
        self.breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Health of every registered dependency, timestamped by the registry clock.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let dependencies = self
            .breakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(DependencyHealth::of)
            .collect();

        HealthReport::new(dependencies, self.clock.now())
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("defaults", &self.defaults)
            .field("dependencies", &self.dependencies())
            .finish_non_exhaustive()
    }
}
