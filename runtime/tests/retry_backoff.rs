//! Retry timing and classification through the resilient client.

#![allow(clippy::unwrap_used)]

use conduit_core::{CorrelationContext, ErrorClassifier, ErrorKind, HttpErrorClassifier, TransportError};
use conduit_runtime::{CircuitBreaker, CircuitBreakerConfig, ResilientClient, RetryPolicy};
use conduit_testing::ScriptedTransport;
use conduit_testing::properties::any_transport_error;
use proptest::prelude::*;
use std::time::Duration;
use tokio::time::Instant;

fn policy(max_attempts: u32, base: Duration) -> RetryPolicy {
    RetryPolicy::builder()
        .max_attempts(max_attempts)
        .base_delay(base)
        .max_delay(Duration::from_secs(10))
        .jitter_ratio(0.0)
        .build()
}

fn client(policy: RetryPolicy) -> ResilientClient {
    ResilientClient::new(
        CircuitBreaker::new("users", CircuitBreakerConfig::builder().failure_threshold(100).build()),
        policy,
    )
}

#[tokio::test(start_paused = true)]
async fn unavailable_twice_then_success_waits_100ms_then_200ms() {
    let client = client(policy(3, Duration::from_millis(100)));
    let transport = ScriptedTransport::new()
        .then_status(503)
        .then_status(503)
        .then_ok("user-42");

    let value = client
        .call(&CorrelationContext::new_root(), |child| transport.call(child))
        .await
        .unwrap();

    assert_eq!(value, "user-42");
    let gaps = transport.gaps();
    assert_eq!(gaps.len(), 2);
    assert!(gaps[0] >= Duration::from_millis(100) && gaps[0] < Duration::from_millis(110));
    assert!(gaps[1] >= Duration::from_millis(200) && gaps[1] < Duration::from_millis(210));
    assert_eq!(client.breaker().failure_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_record_one_breaker_failure() {
    let client = client(policy(3, Duration::from_millis(100)));
    let transport = ScriptedTransport::<()>::new().otherwise(Err(TransportError::Timeout));

    let err = client
        .call(&CorrelationContext::new_root(), |child| transport.call(child))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(err.attempts(), 3);
    assert_eq!(transport.call_count(), 3);
    assert_eq!(client.breaker().failure_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_attempts_time_out_individually() {
    let client = client(policy(2, Duration::from_millis(100))).with_attempt_timeout(Duration::from_secs(1));
    let transport = ScriptedTransport::new()
        .then_delayed(Duration::from_secs(30), Ok("late"))
        .then_ok("fast");

    let started = Instant::now();
    let value = client
        .call(&CorrelationContext::new_root(), |child| transport.call(child))
        .await
        .unwrap();

    assert_eq!(value, "fast");
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn caller_deadline_bounds_the_whole_call() {
    let client = client(policy(10, Duration::from_secs(1)));
    let transport = ScriptedTransport::<()>::new().otherwise(Err(TransportError::status(503)));

    let started = Instant::now();
    let err = client
        .call_with_deadline(
            &CorrelationContext::new_root(),
            started + Duration::from_millis(2500),
            |child| transport.call(child),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(started.elapsed() < Duration::from_secs(3));
    // Attempts at 0s, 1s and 3s: the third never starts.
    assert_eq!(transport.call_count(), 2);
    assert_eq!(client.breaker().failure_count(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn only_retryable_failures_are_retried(error in any_transport_error()) {
        let kind = HttpErrorClassifier.classify(&error);
        let client = client(policy(3, Duration::from_millis(1)));
        let transport = ScriptedTransport::<()>::new().otherwise(Err(error));

        let err = tokio_test::block_on(
            client.call(&CorrelationContext::new_root(), |child| transport.call(child)),
        )
        .unwrap_err();

        prop_assert_eq!(err.kind(), kind);
        let expected = if kind.is_retryable() { 3 } else { 1 };
        prop_assert_eq!(transport.call_count(), expected);
        prop_assert_eq!(err.attempts(), u32::try_from(expected).unwrap());
        prop_assert_eq!(client.breaker().failure_count(), 1);
    }
}
