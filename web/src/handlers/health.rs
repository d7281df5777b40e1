//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health.

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use conduit_runtime::{BreakerRegistry, HealthReport, HealthStatus};

/// Router serving `GET /health` (liveness) and `GET /health/ready` (breaker
/// states of every registered dependency).
///
/// ```
/// use conduit_runtime::BreakerRegistry;
/// use conduit_web::health_router;
///
/// let app: axum::Router = health_router(BreakerRegistry::default());
/// ```
#[must_use]
pub fn health_router<S>(registry: BreakerRegistry) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness))
        .with_state(registry)
}

/// Simple health check endpoint (for basic liveness).
///
/// Returns 200 OK to indicate the service is running.
/// This endpoint does NOT check dependencies.
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Breaker states of every registered dependency.
///
/// # Status Codes
///
/// - 200 OK: Healthy or Degraded (a half-open breaker is probing)
/// - 503 Service Unavailable: at least one breaker is open
///
/// # Response
///
/// ```json
/// {
///   "status": "unhealthy",
///   "dependencies": [
///     {
///       "dependency": "user-service",
///       "status": "unhealthy",
///       "state": "open",
///       "failure_count": 5,
///       "opened_at": "2025-01-01T00:00:00Z"
///     }
///   ],
///   "timestamp": "2025-01-01T00:00:30Z"
/// }
/// ```
#[allow(clippy::unused_async)]
pub async fn readiness(
    State(registry): State<BreakerRegistry>,
) -> (StatusCode, Json<HealthReport>) {
    let report = registry.health();

    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    if status != StatusCode::OK {
        tracing::warn!(status = %report.status, "readiness check failed");
    }

    (status, Json(report))
}
