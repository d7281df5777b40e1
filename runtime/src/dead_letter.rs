//! In-process dead-letter capture.
//!
//! Brokers with a dead-letter exchange route rejected messages themselves. For
//! places without one (messages dead-lettered from a queue that has no DLX
//! bound, local work queues) a [`DeadLetterQueue`] keeps the failures in memory
//! so they can be inspected, alerted on, or replayed by an operator.
//!
//! # Features
//!
//! - Bounded queue with configurable max size
//! - FIFO ordering (oldest entries dropped when full)
//! - Thread-safe for concurrent access
//! - Metrics tracking for queue size and operations

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// Dead letter queue entry
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter<T> {
    /// The rejected payload
    pub payload: T,

    /// Why it was rejected
    pub reason: String,

    /// Delivery attempt on which it was rejected (1-based)
    pub attempt: u32,

    /// When it was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

/// Bounded, shared store of dead letters.
///
/// Clones share the same storage.
///
/// ```
/// use conduit_runtime::DeadLetterQueue;
///
/// let dlq = DeadLetterQueue::new(100);
/// dlq.push("payload".to_string(), "handler error: bad payload", 1);
///
/// assert_eq!(dlq.len(), 1);
/// let entries = dlq.drain();
/// assert_eq!(entries[0].reason, "handler error: bad payload");
/// assert!(dlq.is_empty());
/// ```
#[derive(Debug)]
pub struct DeadLetterQueue<T> {
    queue: Arc<Mutex<VecDeque<DeadLetter<T>>>>,
    max_size: usize,
}

impl<T> DeadLetterQueue<T> {
    /// Create a new dead letter queue holding at most `max_size` entries.
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            max_size: max_size.max(1),
        }
    }

    /// Record a rejected payload.
    ///
    /// If the queue is full, the oldest entry is dropped.
    pub fn push(&self, payload: T, reason: impl Into<String>, attempt: u32) {
        let reason = reason.into();
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);

        if queue.len() >= self.max_size {
            queue.pop_front();
            metrics::counter!("dlq_dropped_total").increment(1);
            tracing::warn!(
                max_size = self.max_size,
                "DLQ at capacity, dropping oldest entry"
            );
        }

        tracing::warn!(attempt, reason = %reason, queue_size = queue.len() + 1, "Message dead-lettered in process");
        queue.push_back(DeadLetter {
            payload,
            reason,
            attempt,
            dead_lettered_at: Utc::now(),
        });

        // Queue size is bounded by max_size; f64 represents it exactly.
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("dlq_size").set(queue.len() as f64);
        metrics::counter!("dlq_pushed_total").increment(1);
    }

    /// Get the current queue size
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Check if the queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove and return all entries, oldest first.
    pub fn drain(&self) -> Vec<DeadLetter<T>> {
        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        let entries: Vec<_> = queue.drain(..).collect();
        metrics::gauge!("dlq_size").set(0.0);
        tracing::info!(count = entries.len(), "Drained dead letter queue");
        entries
    }

    /// Copy of all entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeadLetter<T>>
    where
        T: Clone,
    {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Get the maximum queue size
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }
}

impl<T> Clone for DeadLetterQueue<T> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            max_size: self.max_size,
        }
    }
}

impl<T> Default for DeadLetterQueue<T> {
    fn default() -> Self {
        Self::new(1000)
    }
}
