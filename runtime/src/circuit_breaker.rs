//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker tracks the logical outcome of calls to one dependency and
//! "opens" (stops allowing calls) when consecutive failures reach a threshold.
//!
//! # States
//!
//! - **Closed**: Normal operation. Calls pass through. Failures are counted.
//! - **Open**: Calls are rejected immediately until `reset_timeout` has elapsed.
//! - **HalfOpen**: Exactly one trial call is in flight. Everyone else is rejected
//!   as if Open. The trial's outcome closes or re-opens the circuit.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────► Open
//!     ▲                                │ now - opened_at >= reset_timeout
//!     │ trial succeeded                ▼ (next caller becomes the trial)
//!     └──────────────────────────── HalfOpen ──── trial failed ───► Open
//! ```
//!
//! All state lives behind one mutex, so every transition is linearizable.
//! Time comes from an injected [`Clock`], which lets tests step over the reset
//! timeout without sleeping.
//!
//! # Example
//!
//! ```rust
//! use conduit_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(2)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build();
//! let breaker = CircuitBreaker::new("billing", config);
//!
//! let permit = breaker.acquire().expect("closed breaker admits calls");
//! permit.failure();
//! let permit = breaker.acquire().expect("one failure is below the threshold");
//! permit.failure();
//!
//! assert_eq!(breaker.state(), State::Open);
//! assert!(breaker.acquire().is_none());
//! ```

use crate::metrics::BreakerMetrics;
use chrono::{DateTime, Utc};
use conduit_core::config::ResilienceConfig;
use conduit_core::environment::{Clock, SystemClock};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: usize,
    /// Duration to wait in Open before admitting a trial call
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            reset_timeout: None,
        }
    }
}

impl From<&ResilienceConfig> for CircuitBreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            reset_timeout: config.reset_timeout,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    reset_timeout: Option<Duration>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens after this many consecutive failures. Values below 1 are
    /// raised to 1.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long to wait in Open before trying `HalfOpen`.
    #[must_use]
    pub const fn reset_timeout(mut self, duration: Duration) -> Self {
        self.reset_timeout = Some(duration);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            reset_timeout: self.reset_timeout.unwrap_or(defaults.reset_timeout),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Circuit is closed, calls pass through normally
    Closed,
    /// Circuit is open, calls fail immediately
    Open,
    /// One trial call is testing whether the dependency recovered
    HalfOpen,
}

impl State {
    /// Lowercase name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0 = closed, 1 = half-open, 2 = open.
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a transition reads or writes. Guarded by a single mutex.
#[derive(Debug)]
struct Inner {
    state: State,
    failure_count: usize,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
    /// Bumped by `reset`; permits from an earlier generation are ignored.
    generation: u64,
}

struct Shared {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    total_calls: AtomicU64,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

/// Circuit breaker for one logical dependency.
///
/// Cloning is cheap and every clone shares the same state, so one breaker can be
/// handed to every client that targets the dependency.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    /// Create a breaker reading time from the system clock.
    #[must_use]
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a breaker reading time from `clock`.
    #[must_use]
    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = name.into();
        BreakerMetrics::record_state(&name, State::Closed);
        Self {
            shared: Arc::new(Shared {
                name,
                config,
                clock,
                inner: Mutex::new(Inner {
                    state: State::Closed,
                    failure_count: 0,
                    opened_at: None,
                    trial_in_flight: false,
                    generation: 0,
                }),
                total_calls: AtomicU64::new(0),
                total_successes: AtomicU64::new(0),
                total_failures: AtomicU64::new(0),
                total_rejections: AtomicU64::new(0),
            }),
        }
    }

    /// Dependency name this breaker guards.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The configuration in effect.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }

    /// Current state.
    ///
    /// An Open breaker whose reset timeout has elapsed still reports Open until
    /// the next caller claims the trial.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Consecutive failures counted so far.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.lock().failure_count
    }

    /// When the circuit last opened, if it is not Closed.
    #[must_use]
    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.lock().opened_at
    }

    /// Ask whether a call may proceed.
    ///
    /// May transition Open to `HalfOpen`, in which case this caller holds the
    /// single trial and must report its outcome with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure). Prefer [`acquire`](Self::acquire),
    /// which cannot forget to report.
    #[must_use]
    pub fn allow(&self) -> bool {
        self.admit().is_some()
    }

    /// Claim a permit for one logical call, or `None` if the circuit rejects it.
    ///
    /// The permit must be resolved with [`Permit::success`] or
    /// [`Permit::failure`]. A permit dropped unresolved counts as a failure.
    #[must_use]
    pub fn acquire(&self) -> Option<Permit> {
        self.admit().map(|ticket| Permit {
            breaker: self.clone(),
            ticket,
            resolved: false,
        })
    }

    /// Record a successful call admitted through [`allow`](Self::allow).
    pub fn record_success(&self) {
        self.settle(true, None);
    }

    /// Record a failed call admitted through [`allow`](Self::allow).
    pub fn record_failure(&self) {
        self.settle(false, None);
    }

    /// Force the breaker back to Closed.
    ///
    /// Operator intervention. Permits claimed before the reset still count
    /// towards [`metrics`](Self::metrics) when resolved, but no longer move the
    /// state machine.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let from = inner.state;
        inner.state = State::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
        inner.generation = inner.generation.wrapping_add(1);
        drop(inner);

        tracing::info!(breaker = %self.shared.name, from = %from, "Circuit breaker manually reset to CLOSED");
        if from != State::Closed {
            BreakerMetrics::record_transition(&self.shared.name, from, State::Closed);
        }
    }

    /// Snapshot of call counters.
    #[must_use]
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        CircuitBreakerMetrics {
            total_calls: self.shared.total_calls.load(Ordering::Relaxed),
            total_successes: self.shared.total_successes.load(Ordering::Relaxed),
            total_failures: self.shared.total_failures.load(Ordering::Relaxed),
            total_rejections: self.shared.total_rejections.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Admission decision, or `None` when the call is rejected.
    fn admit(&self) -> Option<Ticket> {
        self.shared.total_calls.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.lock();
        let current = inner.state;
        let generation = inner.generation;
        let ticket = |trial| Ticket { trial, generation };
        let decision = match current {
            State::Closed => Some(ticket(false)),
            State::Open => {
                let elapsed = inner.opened_at.is_none_or(|opened_at| {
                    self.elapsed_since(opened_at) >= self.shared.config.reset_timeout
                });
                if elapsed && !inner.trial_in_flight {
                    inner.state = State::HalfOpen;
                    inner.trial_in_flight = true;
                    drop(inner);
                    self.transitioned(State::Open, State::HalfOpen);
                    return Some(ticket(true));
                }
                None
            }
            State::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Some(ticket(true))
            }
            State::HalfOpen => None,
        };
        let state = inner.state;
        drop(inner);

        if decision.is_none() {
            self.shared.total_rejections.fetch_add(1, Ordering::Relaxed);
            BreakerMetrics::record_rejection(&self.shared.name);
            tracing::debug!(breaker = %self.shared.name, state = %state, "Circuit breaker rejected call");
        }
        decision
    }

    /// Apply one logical outcome.
    ///
    /// `ticket` is `None` for the bare `record_*` API, where a report arriving
    /// while `HalfOpen` with a trial outstanding is taken as the trial's.
    fn settle(&self, success: bool, ticket: Option<Ticket>) {
        if success {
            self.shared.total_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.shared.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        let now = self.shared.clock.now();
        let mut inner = self.lock();
        if ticket.is_some_and(|t| t.generation != inner.generation) {
            tracing::debug!(breaker = %self.shared.name, "Ignoring permit claimed before reset");
            return;
        }
        let is_trial = ticket
            .map_or(inner.state == State::HalfOpen && inner.trial_in_flight, |t| t.trial)
            && inner.state == State::HalfOpen;
        let from = inner.state;

        let to = match (from, success, is_trial) {
            (State::HalfOpen, true, true) => {
                inner.state = State::Closed;
                inner.failure_count = 0;
                inner.opened_at = None;
                inner.trial_in_flight = false;
                Some(State::Closed)
            }
            (State::HalfOpen, false, true) => {
                inner.state = State::Open;
                inner.failure_count = inner.failure_count.saturating_add(1);
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                Some(State::Open)
            }
            (State::Closed, true, _) => {
                inner.failure_count = 0;
                None
            }
            (State::Closed, false, _) => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                if inner.failure_count >= self.shared.config.failure_threshold {
                    inner.state = State::Open;
                    inner.opened_at = Some(now);
                    Some(State::Open)
                } else {
                    None
                }
            }
            // Stragglers admitted before the circuit opened. They neither close
            // the circuit nor push `opened_at` forward.
            (_, false, _) => {
                inner.failure_count = inner.failure_count.saturating_add(1);
                None
            }
            (_, true, _) => None,
        };
        let failure_count = inner.failure_count;
        drop(inner);

        if let Some(to) = to {
            if to == State::Open {
                tracing::warn!(
                    breaker = %self.shared.name,
                    failures = failure_count,
                    threshold = self.shared.config.failure_threshold,
                    "Circuit breaker transitioning {from} -> OPEN"
                );
            }
            self.transitioned(from, to);
        }
    }

    fn transitioned(&self, from: State, to: State) {
        if to != State::Open {
            tracing::info!(
                breaker = %self.shared.name,
                from = %from,
                to = %to,
                "Circuit breaker state change"
            );
        }
        BreakerMetrics::record_transition(&self.shared.name, from, to);
    }

    fn elapsed_since(&self, instant: DateTime<Utc>) -> Duration {
        self.shared
            .clock
            .now()
            .signed_duration_since(instant)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.shared.name)
            .field("config", &self.shared.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish_non_exhaustive()
    }
}

/// What `admit` handed out: the trial flag and the reset generation.
#[derive(Debug, Clone, Copy)]
struct Ticket {
    trial: bool,
    generation: u64,
}

/// Admission to make one logical call through a [`CircuitBreaker`].
///
/// Resolve it exactly once. Dropping it unresolved (for example because the
/// calling future was cancelled) records a failure, so a `HalfOpen` trial is
/// never leaked.
#[must_use = "an unresolved permit is recorded as a failure when dropped"]
pub struct Permit {
    breaker: CircuitBreaker,
    ticket: Ticket,
    resolved: bool,
}

impl Permit {
    /// Whether this permit is the `HalfOpen` trial.
    #[must_use]
    pub const fn is_trial(&self) -> bool {
        self.ticket.trial
    }

    /// Record that the call succeeded.
    pub fn success(mut self) {
        self.resolve(true);
    }

    /// Record that the call failed.
    pub fn failure(mut self) {
        self.resolve(false);
    }

    fn resolve(&mut self, success: bool) {
        if !self.resolved {
            self.resolved = true;
            self.breaker.settle(success, Some(self.ticket));
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::debug!(
                breaker = %self.breaker.name(),
                trial = self.ticket.trial,
                "Permit dropped unresolved, recording failure"
            );
            self.resolve(false);
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("breaker", &self.breaker.name())
            .field("trial", &self.ticket.trial)
            .field("resolved", &self.resolved)
            .finish()
    }
}

/// Metrics for circuit breaker monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Total number of admission requests
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of failed calls
    pub total_failures: u64,
    /// Total number of rejected calls (circuit open)
    pub total_rejections: u64,
}

impl CircuitBreakerMetrics {
    /// Calculate success rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 1.0;
        }
        self.total_successes as f64 / self.total_calls as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}
