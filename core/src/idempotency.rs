//! Deduplication of redelivered messages.
//!
//! Redelivery can hand the same message to a handler more than once. Handlers that
//! apply side effects check a dedup key (the envelope's `delivery_id`) against an
//! [`IdempotencyStore`] first. The store itself is an external collaborator
//! (a database table, a Redis set); `conduit-testing` ships an in-memory one.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors from an idempotency store.
#[derive(Error, Debug, Clone)]
pub enum IdempotencyError {
    /// The backing store could not be reached
    #[error("Idempotency store unavailable: {0}")]
    Unavailable(String),
}

/// Future returned by idempotency store operations.
pub type IdempotencyFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, IdempotencyError>> + Send + 'a>>;

/// Records which dedup keys have already been processed.
pub trait IdempotencyStore: Send + Sync {
    /// Whether `key` has been marked processed.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Unavailable`] if the store cannot answer.
    fn is_processed(&self, key: &str) -> IdempotencyFuture<'_, bool>;

    /// Mark `key` processed.
    ///
    /// # Errors
    ///
    /// Returns [`IdempotencyError::Unavailable`] if the store cannot record it.
    fn mark_processed(&self, key: &str) -> IdempotencyFuture<'_, ()>;
}
