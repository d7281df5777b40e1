//! # Conduit Testing
//!
//! Test doubles for the resilience layer.
//!
//! This crate provides:
//! - Deterministic clocks ([`FixedClock`], [`ManualClock`])
//! - An in-memory broker with topic routing and dead-letter exchanges
//! - A scripted transport for driving the resilient client
//! - An in-memory idempotency store
//! - proptest strategies for core types
//!
//! ## Example
//!
//! ```
//! use conduit_core::broker::{MessageBroker, QueueDeclaration};
//! use conduit_core::Envelope;
//! use conduit_testing::InMemoryBroker;
//!
//! # tokio_test::block_on(async {
//! let broker = InMemoryBroker::new();
//! broker
//!     .declare_queue(&QueueDeclaration::new("audit").bind("task_events", "task.#"))
//!     .await
//!     .unwrap();
//!
//! broker
//!     .publish("task_events", "task.created", &Envelope::new(b"{}".to_vec()))
//!     .await
//!     .unwrap();
//!
//! assert_eq!(broker.queue_len("audit"), 1);
//! # });
//! ```

use chrono::{DateTime, Utc};
use conduit_core::environment::Clock;

/// In-memory message broker
pub mod broker;

/// Scripted transport for client tests
pub mod transport;

/// Mock implementations of environment traits and stores.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use conduit_core::idempotency::{IdempotencyError, IdempotencyFuture, IdempotencyStore};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use conduit_testing::mocks::FixedClock;
    /// use conduit_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(test_epoch())
    }

    /// 2025-01-01 00:00:00 UTC
    #[must_use]
    pub fn test_epoch() -> DateTime<Utc> {
        DateTime::from_timestamp(1_735_689_600, 0).unwrap_or_default()
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to a circuit
    /// breaker and advance another.
    ///
    /// ```
    /// use conduit_testing::mocks::ManualClock;
    /// use conduit_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::default();
    /// let start = clock.now();
    /// clock.advance(Duration::from_secs(60));
    /// assert_eq!((clock.now() - start).num_seconds(), 60);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Clock starting at `start`.
        #[must_use]
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(start)),
            }
        }

        /// Move time forward by `by`.
        pub fn advance(&self, by: Duration) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time = time.checked_add_signed(by).unwrap_or(*time);
        }

        /// Jump to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_epoch())
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// [`IdempotencyStore`] backed by a set in memory.
    ///
    /// Clones share the same set. [`set_unavailable`](Self::set_unavailable)
    /// makes every operation fail, simulating a store outage.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryIdempotencyStore {
        processed: Arc<Mutex<HashSet<String>>>,
        unavailable: Arc<AtomicBool>,
    }

    impl InMemoryIdempotencyStore {
        /// Empty store.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Toggle the simulated outage.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Whether `key` has been marked, bypassing the outage switch.
        #[must_use]
        pub fn contains(&self, key: &str) -> bool {
            self.processed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains(key)
        }

        /// Number of keys marked processed.
        #[must_use]
        pub fn len(&self) -> usize {
            self.processed.lock().unwrap_or_else(PoisonError::into_inner).len()
        }

        /// Whether no key has been marked.
        #[must_use]
        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        fn check_available(&self) -> Result<(), IdempotencyError> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(IdempotencyError::Unavailable("in-memory store offline".to_string()))
            } else {
                Ok(())
            }
        }
    }

    impl IdempotencyStore for InMemoryIdempotencyStore {
        fn is_processed(&self, key: &str) -> IdempotencyFuture<'_, bool> {
            let result = self.check_available().map(|()| self.contains(key));
            Box::pin(async move { result })
        }

        fn mark_processed(&self, key: &str) -> IdempotencyFuture<'_, ()> {
            let result = self.check_available().map(|()| {
                self.processed
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.to_string());
            });
            Box::pin(async move { result })
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use conduit_core::{CorrelationContext, TransportError};
    use proptest::prelude::*;

    /// Any status code a peer may fail with.
    pub fn any_failure_status() -> impl Strategy<Value = u16> {
        400u16..600
    }

    /// Any transport failure, weighted towards status failures.
    pub fn any_transport_error() -> impl Strategy<Value = TransportError> {
        prop_oneof![
            4 => any_failure_status().prop_map(TransportError::status),
            1 => Just(TransportError::Timeout),
            1 => "[a-z ]{1,16}".prop_map(TransportError::ConnectionRefused),
            1 => "[a-z ]{1,16}".prop_map(TransportError::Connection),
            1 => Just(TransportError::CircuitOpen),
            1 => "[a-z ]{1,16}".prop_map(TransportError::Other),
        ]
    }

    /// Contexts with arbitrary (non-empty) ids.
    pub fn any_context() -> impl Strategy<Value = CorrelationContext> {
        ("[a-zA-Z0-9-]{1,36}", "[a-zA-Z0-9-]{1,36}")
            .prop_map(|(request_id, correlation_id)| CorrelationContext::from_parts(request_id, correlation_id))
    }
}

// Re-export commonly used items
pub use broker::{InMemoryBroker, PublishedMessage};
pub use mocks::{FixedClock, InMemoryIdempotencyStore, ManualClock, test_clock};
pub use transport::{RecordedCall, ScriptedTransport};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use conduit_core::idempotency::IdempotencyStore;
    use std::time::Duration;

    #[test]
    fn fixed_clock_does_not_move() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let other = clock.clone();
        other.advance(Duration::from_millis(1500));
        assert_eq!((clock.now() - mocks::test_epoch()).num_milliseconds(), 1500);
    }

    #[tokio::test]
    async fn idempotency_store_marks_and_fails_on_outage() {
        let store = InMemoryIdempotencyStore::new();
        assert!(!store.is_processed("d-1").await.unwrap());
        store.mark_processed("d-1").await.unwrap();
        assert!(store.is_processed("d-1").await.unwrap());

        store.set_unavailable(true);
        assert!(store.is_processed("d-1").await.is_err());
        assert!(store.mark_processed("d-2").await.is_err());
        assert_eq!(store.len(), 1);
    }
}
