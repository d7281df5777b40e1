//! # Conduit Runtime
//!
//! Resilience machinery for inter-service calls.
//!
//! ## Core Components
//!
//! - **Circuit breaker**: per-dependency state machine gating calls
//! - **Breaker registry**: one breaker per dependency, shared by every client
//! - **Retry policy**: exponential backoff with jitter
//! - **Resilient client**: breaker + retry + timeouts around a transport call
//! - **Message consumer**: acknowledge / requeue / dead-letter decisions
//! - **Event publisher**: correlated events with publisher confirms
//!
//! ## Example
//!
//! ```
//! use conduit_core::{CorrelationContext, ErrorKind, ResilienceConfig, TransportError};
//! use conduit_runtime::{BreakerRegistry, ResilientClient};
//!
//! # tokio_test::block_on(async {
//! let config = ResilienceConfig::default().with_max_attempts(1);
//! let registry = BreakerRegistry::from_config(&config).unwrap();
//! let client = ResilientClient::from_config(registry.get_or_create("users"), &config).unwrap();
//!
//! let err = client
//!     .call(&CorrelationContext::new_root(), |_ctx| async {
//!         Err::<(), _>(TransportError::status(422))
//!     })
//!     .await
//!     .unwrap_err();
//! assert_eq!(err.kind(), ErrorKind::Validation);
//! assert!(registry.health().is_healthy());
//! # });
//! ```

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Process-wide breaker registry
pub mod registry;

/// Retry policy with exponential backoff and jitter
pub mod retry;

/// Resilient synchronous client
pub mod client;

/// `reqwest` HTTP transport
pub mod transport;

/// Message consumer with dead-letter routing
pub mod consumer;

/// Domain event publisher
pub mod publisher;

/// In-process dead-letter capture
pub mod dead_letter;

/// Prometheus metrics for observability
pub mod metrics;

/// Structured logging setup
pub mod telemetry;

/// Dependency health from breaker state
pub mod health;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, Permit, State};
pub use client::ResilientClient;
pub use consumer::{
    ConsumerStats, Disposition, Handler, Idempotent, MessageConsumer, Outcome, decide, handler_fn,
};
pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use health::{DependencyHealth, HealthReport, HealthStatus};
pub use publisher::{EventPublisher, PublishError};
pub use registry::BreakerRegistry;
pub use retry::RetryPolicy;
pub use transport::ReqwestTransport;
