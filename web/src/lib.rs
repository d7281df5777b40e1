//! Axum integration for Conduit.
//!
//! The inbound half of correlation tracking and the user-facing side of the
//! error taxonomy:
//!
//! - [`correlation_layer`] extracts or creates the [`CorrelationContext`] for
//!   every request and echoes it on the response
//! - [`Correlation`] hands the context to handlers
//! - [`ApiError`] renders a classified [`ServiceError`] as problem details
//! - [`health_router`] reports the breaker state of every dependency
//!
//! # Example
//!
//! ```
//! use axum::{Router, routing::get};
//! use conduit_runtime::BreakerRegistry;
//! use conduit_web::{ApiError, Correlation, correlation_layer, health_router};
//!
//! async fn get_task(Correlation(ctx): Correlation) -> Result<String, ApiError> {
//!     Err(ApiError::not_found("task 42 does not exist").for_request(&ctx))
//! }
//!
//! let registry = BreakerRegistry::default();
//! let app: Router = Router::new()
//!     .route("/tasks/42", get(get_task))
//!     .merge(health_router::<()>(registry))
//!     .layer(correlation_layer());
//! ```
//!
//! [`CorrelationContext`]: conduit_core::CorrelationContext
//! [`ServiceError`]: conduit_core::ServiceError

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;

pub use error::{ApiError, DEFAULT_RETRY_AFTER};
pub use extractors::Correlation;
pub use handlers::health_router;
pub use middleware::{CorrelationLayer, CorrelationMiddleware, correlation_layer};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, ApiError>;
