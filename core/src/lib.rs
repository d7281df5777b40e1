//! # Conduit Core
//!
//! Core types and traits for the Conduit resilient inter-service communication layer.
//!
//! This crate holds everything that is shared between the synchronous (HTTP) and
//! asynchronous (message queue) halves of the system, without any I/O of its own:
//!
//! - **Correlation**: [`CorrelationContext`] and the header names it travels under
//! - **Errors**: the closed [`ErrorKind`] taxonomy and the [`ErrorClassifier`] seam
//! - **Problem details**: the error body exchanged between services
//! - **Envelope**: the message type carried by the broker
//! - **Broker**: the [`MessageBroker`](broker::MessageBroker) trait adapters implement
//! - **Config**: the [`ResilienceConfig`] surface shared by all components
//!
//! ## Example
//!
//! ```
//! use conduit_core::correlation::CorrelationContext;
//! use conduit_core::error::{ErrorKind, TransportError, ErrorClassifier, HttpErrorClassifier};
//!
//! let root = CorrelationContext::new_root();
//! let child = root.derive();
//! assert_eq!(root.correlation_id(), child.correlation_id());
//!
//! let kind = HttpErrorClassifier.classify(&TransportError::status(503));
//! assert_eq!(kind, ErrorKind::Unavailable);
//! assert!(kind.is_retryable());
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

/// Correlation and request identifiers that follow a logical call chain
pub mod correlation;

/// Error taxonomy and transport failure classification
pub mod error;

/// Problem-details error bodies (`application/problem+json`)
pub mod problem;

/// Message envelope carried through the broker
pub mod envelope;

/// Broker abstraction (publish, subscribe, acknowledge, reject)
pub mod broker;

/// Deduplication of redelivered messages
pub mod idempotency;

/// Resilience configuration surface
pub mod config;

/// Environment traits injected into runtime components.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The circuit breaker reads `now()` to decide whether its reset timeout has
    /// elapsed, so tests can substitute a manually advanced clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall clock backed by [`Utc::now`].
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use config::{ConfigError, ResilienceConfig};
pub use correlation::CorrelationContext;
pub use envelope::Envelope;
pub use error::{ErrorClassifier, ErrorKind, HttpErrorClassifier, ServiceError, TransportError};
pub use problem::ProblemDetails;
