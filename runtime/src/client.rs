//! Resilient synchronous calls against one dependency.
//!
//! [`ResilientClient`] composes the pieces around a transport call:
//!
//! 1. ask the [`CircuitBreaker`] for a permit (rejected calls fail `Unavailable`
//!    without touching the transport);
//! 2. run up to `max_attempts` attempts, each under its own timeout and with a
//!    child [`CorrelationContext`] the transport attaches as headers;
//! 3. classify failures, sleeping [`RetryPolicy::delay`] between retryable ones;
//! 4. report the single logical outcome back to the breaker.
//!
//! # Example
//!
//! ```rust
//! use conduit_core::{CorrelationContext, ErrorKind, TransportError};
//! use conduit_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use conduit_runtime::client::ResilientClient;
//! use conduit_runtime::retry::RetryPolicy;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new("users", CircuitBreakerConfig::default());
//! let client = ResilientClient::new(breaker, RetryPolicy::default());
//! let ctx = CorrelationContext::new_root();
//!
//! let result = client
//!     .call(&ctx, |_child| async { Err::<(), _>(TransportError::status(404)) })
//!     .await;
//!
//! assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
//! # }
//! ```

use crate::circuit_breaker::CircuitBreaker;
use crate::metrics::ClientMetrics;
use crate::retry::RetryPolicy;
use conduit_core::config::{ConfigError, ResilienceConfig};
use conduit_core::correlation::CorrelationContext;
use conduit_core::error::{
    ErrorClassifier, ErrorKind, HttpErrorClassifier, ServiceError, TransportError,
};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wraps transport calls to one dependency with breaker, retry and timeouts.
///
/// Cheap to clone; clones share the breaker.
#[derive(Clone)]
pub struct ResilientClient {
    dependency: String,
    breaker: CircuitBreaker,
    policy: RetryPolicy,
    classifier: Arc<dyn ErrorClassifier>,
    attempt_timeout: Duration,
}

impl ResilientClient {
    /// Create a client for the dependency the breaker guards.
    #[must_use]
    pub fn new(breaker: CircuitBreaker, policy: RetryPolicy) -> Self {
        Self {
            dependency: breaker.name().to_string(),
            breaker,
            policy,
            classifier: Arc::new(HttpErrorClassifier),
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }

    /// Create a client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    pub fn from_config(
        breaker: CircuitBreaker,
        config: &ResilienceConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::new(breaker, RetryPolicy::from(config)).with_attempt_timeout(config.attempt_timeout))
    }

    /// Replace the error classifier.
    #[must_use]
    pub fn with_classifier(mut self, classifier: impl ErrorClassifier + 'static) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Set the timeout applied to each attempt.
    #[must_use]
    pub const fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Dependency name.
    #[must_use]
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// The breaker shared with other clients of this dependency.
    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `operation` with breaker, retries and per-attempt timeouts.
    ///
    /// `operation` must be safe to repeat. It receives a child context per attempt
    /// and should attach it to the outbound request.
    ///
    /// # Errors
    ///
    /// Returns a [`ServiceError`] whose [`kind`](ServiceError::kind) is the
    /// classification of the last failure, or `Unavailable` if the circuit is open.
    pub async fn call<T, F, Fut>(
        &self,
        context: &CorrelationContext,
        operation: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut(CorrelationContext) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.execute(context, operation, None).await
    }

    /// Like [`call`](Self::call), but the whole call (attempts and backoff sleeps)
    /// must finish before `deadline`.
    ///
    /// Expiry cancels the in-flight attempt, reports `Timeout` and counts as one
    /// breaker failure.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus `Timeout` when the deadline passes.
    pub async fn call_with_deadline<T, F, Fut>(
        &self,
        context: &CorrelationContext,
        deadline: Instant,
        operation: F,
    ) -> Result<T, ServiceError>
    where
        F: FnMut(CorrelationContext) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        self.execute(context, operation, Some(deadline)).await
    }

    async fn execute<T, F, Fut>(
        &self,
        context: &CorrelationContext,
        operation: F,
        deadline: Option<Instant>,
    ) -> Result<T, ServiceError>
    where
        F: FnMut(CorrelationContext) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let Some(permit) = self.breaker.acquire() else {
            tracing::warn!(
                dependency = %self.dependency,
                request_id = %context.request_id(),
                correlation_id = %context.correlation_id(),
                attempt = 0,
                outcome = "circuit_open",
                "Call rejected by open circuit"
            );
            ClientMetrics::record_attempt(&self.dependency, "circuit_open");
            return Err(ServiceError::circuit_open(&self.dependency));
        };

        let started = Instant::now();
        let attempts = AtomicU32::new(0);
        let attempts_loop = self.attempts(context, operation, &attempts);

        let result = match deadline {
            None => attempts_loop.await,
            Some(deadline) => {
                if let Ok(result) = tokio::time::timeout_at(deadline, attempts_loop).await {
                    result
                } else {
                    let made = attempts.load(Ordering::Relaxed);
                    tracing::warn!(
                        dependency = %self.dependency,
                        request_id = %context.request_id(),
                        correlation_id = %context.correlation_id(),
                        attempt = made,
                        outcome = "deadline_exceeded",
                        "Call deadline exceeded"
                    );
                    ClientMetrics::record_attempt(&self.dependency, "deadline_exceeded");
                    Err(ServiceError::new(
                        ErrorKind::Timeout,
                        &self.dependency,
                        "caller deadline exceeded",
                    )
                    .with_attempts(made))
                }
            }
        };

        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        ClientMetrics::record_call(&self.dependency, started.elapsed());
        result
    }

    async fn attempts<T, F, Fut>(
        &self,
        context: &CorrelationContext,
        mut operation: F,
        attempts: &AtomicU32,
    ) -> Result<T, ServiceError>
    where
        F: FnMut(CorrelationContext) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            attempts.store(attempt, Ordering::Relaxed);
            let child = context.derive();
            let span_ids = (child.request_id().to_string(), child.correlation_id().to_string());

            let outcome = tokio::time::timeout(self.attempt_timeout, operation(child))
                .await
                .unwrap_or(Err(TransportError::Timeout));

            let err = match outcome {
                Ok(value) => {
                    tracing::debug!(
                        dependency = %self.dependency,
                        request_id = %span_ids.0,
                        correlation_id = %span_ids.1,
                        attempt,
                        outcome = "success",
                        "Attempt succeeded"
                    );
                    ClientMetrics::record_attempt(&self.dependency, "success");
                    return Ok(value);
                }
                Err(err) => err,
            };

            let kind = self.classifier.classify(&err);
            let retrying = kind.is_retryable() && self.policy.should_retry(attempt);
            tracing::warn!(
                dependency = %self.dependency,
                request_id = %span_ids.0,
                correlation_id = %span_ids.1,
                attempt,
                outcome = kind.as_str(),
                error = %err,
                retrying,
                "Attempt failed"
            );
            ClientMetrics::record_attempt(&self.dependency, kind.as_str());

            if !retrying {
                return Err(
                    ServiceError::from_transport(kind, &self.dependency, &err).with_attempts(attempt)
                );
            }

            tokio::time::sleep(self.policy.delay(attempt)).await;
            attempt += 1;
        }
    }
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("dependency", &self.dependency)
            .field("breaker", &self.breaker)
            .field("policy", &self.policy)
            .field("attempt_timeout", &self.attempt_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, State};
    use std::sync::atomic::AtomicUsize;

    fn client(max_attempts: u32, threshold: usize) -> ResilientClient {
        let breaker = CircuitBreaker::new(
            "tasks",
            CircuitBreakerConfig::builder()
                .failure_threshold(threshold)
                .build(),
        );
        let policy = RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(100))
            .jitter_ratio(0.0)
            .build();
        ResilientClient::new(breaker, policy)
    }

    #[tokio::test(start_paused = true)]
    async fn retries_retryable_failures_until_success() {
        let client = client(3, 5);
        let calls = AtomicUsize::new(0);

        let result = client
            .call(&CorrelationContext::new_root(), |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TransportError::status(503))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.breaker().failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_is_returned_immediately() {
        let client = client(3, 5);
        let calls = AtomicUsize::new(0);

        let err = client
            .call(&CorrelationContext::new_root(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TransportError::status(409)) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_record_one_breaker_failure() {
        let client = client(3, 5);

        let err = client
            .call(&CorrelationContext::new_root(), |_| async {
                Err::<(), _>(TransportError::Timeout)
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.attempts(), 3);
        assert_eq!(client.breaker().failure_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_skips_transport() {
        let client = client(1, 1);
        let ctx = CorrelationContext::new_root();
        let _ = client
            .call(&ctx, |_| async { Err::<(), _>(TransportError::status(500)) })
            .await;
        assert_eq!(client.breaker().state(), State::Open);

        let calls = AtomicUsize::new(0);
        let err = client
            .call(&ctx, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, TransportError>(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(err.attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out() {
        let client = client(1, 5).with_attempt_timeout(Duration::from_millis(50));

        let err = client
            .call(&CorrelationContext::new_root(), |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, TransportError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn each_attempt_gets_a_child_context() {
        let client = client(2, 5);
        let root = CorrelationContext::new_root();
        let seen = std::sync::Mutex::new(Vec::new());

        let _ = client
            .call(&root, |child| {
                seen.lock().unwrap().push(child);
                async { Err::<(), _>(TransportError::Connection("reset".into())) }
            })
            .await;

        let seen = seen.into_inner().unwrap();
        assert_eq!(seen.len(), 2);
        assert_ne!(seen[0].request_id(), seen[1].request_id());
        for child in &seen {
            assert_eq!(child.correlation_id(), root.correlation_id());
            assert_ne!(child.request_id(), root.request_id());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_backoff_and_counts_failure() {
        let client = client(5, 5);
        let deadline = Instant::now() + Duration::from_millis(150);

        let err = client
            .call_with_deadline(&CorrelationContext::new_root(), deadline, |_| async {
                Err::<(), _>(TransportError::status(503))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.attempts(), 2);
        assert_eq!(client.breaker().failure_count(), 1);
    }

    #[tokio::test]
    async fn from_config_rejects_invalid_settings() {
        let breaker = CircuitBreaker::new("tasks", CircuitBreakerConfig::default());
        let config = ResilienceConfig::default().with_max_attempts(0);
        assert!(ResilientClient::from_config(breaker, &config).is_err());
    }

    #[tokio::test]
    async fn custom_classifier_is_used() {
        let client = client(3, 5).with_classifier(|_: &TransportError| ErrorKind::Validation);
        let err = client
            .call(&CorrelationContext::new_root(), |_| async {
                Err::<(), _>(TransportError::Timeout)
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.attempts(), 1);
    }
}
