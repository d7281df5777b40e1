//! Dependency health derived from circuit breaker state.
//!
//! Closed is healthy, `HalfOpen` degraded (a trial call is probing), Open
//! unhealthy. A report's overall status is the worst of its dependencies.

use crate::circuit_breaker::{CircuitBreaker, State};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Health of one dependency, or of the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Calls flow normally
    Healthy,
    /// Recovering; one trial call is in flight
    Degraded,
    /// Calls are being rejected
    Unhealthy,
}

impl HealthStatus {
    /// Lowercase name, matching the serialized form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }

    /// The worse of two statuses.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        self.max(other)
    }
}

impl From<State> for HealthStatus {
    fn from(state: State) -> Self {
        match state {
            State::Closed => Self::Healthy,
            State::HalfOpen => Self::Degraded,
            State::Open => Self::Unhealthy,
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker snapshot for one dependency.
#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    /// Dependency (breaker) name
    pub dependency: String,
    /// Status derived from `state`
    pub status: HealthStatus,
    /// Breaker state (`closed`, `open`, `half_open`)
    pub state: &'static str,
    /// Consecutive failures counted by the breaker
    pub failure_count: usize,
    /// When the circuit last opened
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

impl DependencyHealth {
    /// Snapshot `breaker`.
    ///
    /// Each field is read separately, so a breaker changing state mid-snapshot
    /// can yield a momentarily inconsistent pair of `state` and `failure_count`.
    #[must_use]
    pub fn of(breaker: &CircuitBreaker) -> Self {
        let state = breaker.state();
        Self {
            dependency: breaker.name().to_string(),
            status: HealthStatus::from(state),
            state: state.as_str(),
            failure_count: breaker.failure_count(),
            opened_at: breaker.opened_at(),
        }
    }
}

/// Health of every dependency known to a registry.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Worst status among `dependencies` (healthy when empty)
    pub status: HealthStatus,
    /// Per-dependency snapshots, sorted by name
    pub dependencies: Vec<DependencyHealth>,
    /// When the report was taken
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Aggregate `dependencies` into a report taken at `timestamp`.
    #[must_use]
    pub fn new(dependencies: Vec<DependencyHealth>, timestamp: DateTime<Utc>) -> Self {
        let status = dependencies
            .iter()
            .map(|d| d.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            dependencies,
            timestamp,
        }
    }

    /// Overall status is healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Overall status is degraded.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.status.is_degraded()
    }

    /// Overall status is unhealthy.
    #[must_use]
    pub const fn is_unhealthy(&self) -> bool {
        self.status.is_unhealthy()
    }

    /// Snapshot for `dependency`, if it is part of the report.
    #[must_use]
    pub fn dependency(&self, dependency: &str) -> Option<&DependencyHealth> {
        self.dependencies.iter().find(|d| d.dependency == dependency)
    }
}
