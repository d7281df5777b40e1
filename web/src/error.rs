//! Problem-details responses for handler errors.
//!
//! [`ApiError`] maps a classified [`ServiceError`] to the status a user-facing
//! handler answers with, and renders the body as `application/problem+json`:
//!
//! | kind                     | status | extra header  |
//! |--------------------------|--------|---------------|
//! | `Unavailable`, `Timeout` | 503    | `Retry-After` |
//! | `NotFound`               | 404    |               |
//! | `Conflict`               | 409    |               |
//! | `Validation`             | 400    |               |
//! | `Unknown`                | 500    |               |

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use conduit_core::{CorrelationContext, ErrorKind, ProblemDetails, ServiceError};
use conduit_core::problem::PROBLEM_JSON;
use std::time::Duration;

/// `Retry-After` sent with 503 responses unless overridden.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Error type for web handlers.
///
/// ```ignore
/// async fn get_task(Path(id): Path<u64>) -> Result<Json<Task>, ApiError> {
///     let task = tasks.fetch(&ctx, id).await?;
///     Ok(Json(task))
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ApiError {
    kind: ErrorKind,
    problem: ProblemDetails,
    retry_after: Duration,
}

impl ApiError {
    /// Error of `kind` with a human-readable `detail`.
    #[must_use]
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            problem: ProblemDetails::for_kind(kind).with_detail(detail),
            retry_after: DEFAULT_RETRY_AFTER,
        }
    }

    /// 404 Not Found.
    #[must_use]
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    /// 409 Conflict.
    #[must_use]
    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, detail)
    }

    /// 400 Bad Request.
    #[must_use]
    pub fn validation(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, detail)
    }

    /// 500 Internal Server Error.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, detail)
    }

    /// Name the request this error answers (`instance` in the body).
    #[must_use]
    pub fn for_request(mut self, context: &CorrelationContext) -> Self {
        self.problem = self.problem.with_instance(context.request_id());
        self
    }

    /// Override the `Retry-After` hint sent with 503 responses.
    #[must_use]
    pub const fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// The classified kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Response status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Body that will be sent.
    #[must_use]
    pub const fn problem(&self) -> &ProblemDetails {
        &self.problem
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self::from(&err)
    }
}

/// Status and title follow the classified kind. The dependency's own
/// `detail` and `instance` are kept when it sent a problem body;
/// [`ApiError::for_request`] replaces the instance.
impl From<&ServiceError> for ApiError {
    fn from(err: &ServiceError) -> Self {
        let upstream = err.problem();
        let detail = upstream
            .and_then(|p| p.detail.as_deref())
            .unwrap_or_else(|| err.message());
        let mut api = Self::new(err.kind(), format!("{}: {detail}", err.dependency()));
        if let Some(instance) = upstream.and_then(|p| p.instance.clone()) {
            api.problem = api.problem.with_instance(instance);
        }
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(
                kind = %self.kind,
                status = status.as_u16(),
                detail = self.problem.detail.as_deref().unwrap_or_default(),
                "request failed"
            );
        } else {
            tracing::debug!(kind = %self.kind, status = status.as_u16(), "request rejected");
        }

        let body = match serde_json::to_vec(&self.problem) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize problem body");
                return status.into_response();
            }
        };

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(PROBLEM_JSON));
        if self.kind.is_retryable() {
            headers.insert(
                header::RETRY_AFTER,
                HeaderValue::from(self.retry_after.as_secs().max(1)),
            );
        }
        response
    }
}
