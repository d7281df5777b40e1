//! Error taxonomy for inter-service calls.
//!
//! Transport-level failures ([`TransportError`]) are mapped by an [`ErrorClassifier`]
//! into the closed [`ErrorKind`] taxonomy. Retry decisions are made on the kind only:
//! [`ErrorKind::is_retryable`] is true for `Timeout` and `Unavailable` and false for
//! everything else, since retrying a validation or conflict error cannot change the
//! outcome.
//!
//! # Status mapping
//!
//! | Status / failure            | Kind          |
//! |-----------------------------|---------------|
//! | 404                         | `NotFound`    |
//! | 409                         | `Conflict`    |
//! | 400, 422                    | `Validation`  |
//! | 408, timeout                | `Timeout`     |
//! | 503, refused, circuit open  | `Unavailable` |
//! | other 5xx                   | `Unavailable` |
//! | other 4xx                   | `Unknown`     |

use crate::problem::ProblemDetails;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Closed classification of every failure surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The requested resource does not exist
    NotFound,
    /// The request conflicts with current state
    Conflict,
    /// The request was rejected as invalid
    Validation,
    /// The dependency did not answer in time
    Timeout,
    /// The dependency is unreachable (connection failure, 5xx, or circuit open)
    Unavailable,
    /// Anything else
    Unknown,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed if attempted again.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable)
    }

    /// Stable lowercase name, used as a metrics label and log field.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Validation => "validation",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::Unknown => "unknown",
        }
    }

    /// HTTP status a user-facing handler should answer with for this kind.
    ///
    /// `Timeout` and `Unavailable` both become 503 so clients retry later.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Validation => 400,
            Self::Timeout | Self::Unavailable => 503,
            Self::Unknown => 500,
        }
    }

    /// Classify a bare HTTP status code.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            409 => Self::Conflict,
            400 | 422 => Self::Validation,
            408 => Self::Timeout,
            500..=599 => Self::Unavailable,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure reported by a transport call, before classification.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The peer answered with a non-success status
    #[error("HTTP status {status}")]
    Status {
        /// Response status code
        status: u16,
        /// Parsed problem-details body, if the peer sent one
        problem: Option<ProblemDetails>,
    },

    /// The attempt exceeded its deadline
    #[error("Operation timed out")]
    Timeout,

    /// The peer refused the connection
    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    /// Any other connection-level failure (DNS, reset, TLS)
    #[error("Connection failed: {0}")]
    Connection(String),

    /// The call was rejected locally by an open circuit breaker
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// A failure the transport could not describe further
    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    /// Shorthand for a status failure without a body.
    #[must_use]
    pub const fn status(status: u16) -> Self {
        Self::Status {
            status,
            problem: None,
        }
    }

    /// The problem-details body attached to a status failure.
    #[must_use]
    pub const fn problem(&self) -> Option<&ProblemDetails> {
        match self {
            Self::Status { problem, .. } => problem.as_ref(),
            _ => None,
        }
    }
}

/// Maps transport failures into the [`ErrorKind`] taxonomy.
///
/// The default is [`HttpErrorClassifier`]. Implement this trait when a
/// dependency signals failures differently (for example a broker client).
pub trait ErrorClassifier: Send + Sync {
    /// Classify one failure.
    fn classify(&self, error: &TransportError) -> ErrorKind;
}

/// Classifier implementing the HTTP status mapping.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpErrorClassifier;

impl ErrorClassifier for HttpErrorClassifier {
    fn classify(&self, error: &TransportError) -> ErrorKind {
        match error {
            TransportError::Status { status, .. } => ErrorKind::from_status(*status),
            TransportError::Timeout => ErrorKind::Timeout,
            TransportError::ConnectionRefused(_)
            | TransportError::Connection(_)
            | TransportError::CircuitOpen => ErrorKind::Unavailable,
            TransportError::Other(_) => ErrorKind::Unknown,
        }
    }
}

impl<F> ErrorClassifier for F
where
    F: Fn(&TransportError) -> ErrorKind + Send + Sync,
{
    fn classify(&self, error: &TransportError) -> ErrorKind {
        self(error)
    }
}

/// Classified failure of one logical call against a dependency.
///
/// Callers branch on [`kind`](Self::kind); the remaining fields are diagnostic.
#[derive(Error, Debug, Clone)]
#[error("{kind} calling '{dependency}' after {attempts} attempt(s): {message}")]
pub struct ServiceError {
    kind: ErrorKind,
    dependency: String,
    message: String,
    attempts: u32,
    problem: Option<ProblemDetails>,
}

impl ServiceError {
    /// Create a new error.
    #[must_use]
    pub fn new(kind: ErrorKind, dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            dependency: dependency.into(),
            message: message.into(),
            attempts: 0,
            problem: None,
        }
    }

    /// The rejection reported when a circuit breaker refuses the call.
    ///
    /// Reported as `Unavailable`, the same as a transport-level outage.
    #[must_use]
    pub fn circuit_open(dependency: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Unavailable,
            dependency,
            TransportError::CircuitOpen.to_string(),
        )
    }

    /// Build from a classified transport failure.
    #[must_use]
    pub fn from_transport(
        kind: ErrorKind,
        dependency: impl Into<String>,
        error: &TransportError,
    ) -> Self {
        Self {
            kind,
            dependency: dependency.into(),
            message: error.to_string(),
            attempts: 0,
            problem: error.problem().cloned(),
        }
    }

    /// Record how many attempts were made.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Attach a problem-details body.
    #[must_use]
    pub fn with_problem(mut self, problem: ProblemDetails) -> Self {
        self.problem = Some(problem);
        self
    }

    /// The classified kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Name of the dependency that failed.
    #[must_use]
    pub fn dependency(&self) -> &str {
        &self.dependency
    }

    /// Human-readable description of the last failure.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Number of transport attempts made (0 when rejected before any attempt).
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Problem-details body returned by the dependency, if any.
    #[must_use]
    pub const fn problem(&self) -> Option<&ProblemDetails> {
        self.problem.as_ref()
    }

    /// Shorthand for `self.kind().is_retryable()`.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_and_unavailable_are_retryable() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Unavailable.is_retryable());
        assert!(!ErrorKind::NotFound.is_retryable());
        assert!(!ErrorKind::Conflict.is_retryable());
        assert!(!ErrorKind::Validation.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn status_mapping() {
        let classifier = HttpErrorClassifier;
        let cases = [
            (404, ErrorKind::NotFound),
            (409, ErrorKind::Conflict),
            (400, ErrorKind::Validation),
            (422, ErrorKind::Validation),
            (408, ErrorKind::Timeout),
            (503, ErrorKind::Unavailable),
            (500, ErrorKind::Unavailable),
            (502, ErrorKind::Unavailable),
            (504, ErrorKind::Unavailable),
            (401, ErrorKind::Unknown),
            (403, ErrorKind::Unknown),
            (429, ErrorKind::Unknown),
        ];

        for (status, expected) in cases {
            assert_eq!(
                classifier.classify(&TransportError::status(status)),
                expected,
                "status {status}"
            );
        }
    }

    #[test]
    fn connection_failures_are_unavailable() {
        let classifier = HttpErrorClassifier;
        assert_eq!(
            classifier.classify(&TransportError::ConnectionRefused("127.0.0.1:80".into())),
            ErrorKind::Unavailable
        );
        assert_eq!(
            classifier.classify(&TransportError::Connection("reset".into())),
            ErrorKind::Unavailable
        );
        assert_eq!(
            classifier.classify(&TransportError::CircuitOpen),
            ErrorKind::Unavailable
        );
        assert_eq!(
            classifier.classify(&TransportError::Timeout),
            ErrorKind::Timeout
        );
        assert_eq!(
            classifier.classify(&TransportError::Other("boom".into())),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn closures_can_classify() {
        let everything_conflicts = |_: &TransportError| ErrorKind::Conflict;
        assert_eq!(
            everything_conflicts.classify(&TransportError::Timeout),
            ErrorKind::Conflict
        );
    }

    #[test]
    fn user_facing_status_is_pass_through() {
        assert_eq!(ErrorKind::Unavailable.http_status(), 503);
        assert_eq!(ErrorKind::Timeout.http_status(), 503);
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::Conflict.http_status(), 409);
        assert_eq!(ErrorKind::Validation.http_status(), 400);
    }

    #[test]
    fn circuit_open_error_is_unavailable() {
        let err = ServiceError::circuit_open("users");
        assert_eq!(err.kind(), ErrorKind::Unavailable);
        assert_eq!(err.attempts(), 0);
        assert!(err.to_string().contains("users"));
    }

    #[test]
    fn service_error_keeps_problem_body() {
        let problem = ProblemDetails::new(409, "Task already exists");
        let transport = TransportError::Status {
            status: 409,
            problem: Some(problem.clone()),
        };
        let err = ServiceError::from_transport(ErrorKind::Conflict, "tasks", &transport)
            .with_attempts(1);

        assert_eq!(err.problem(), Some(&problem));
        assert_eq!(err.attempts(), 1);
        assert!(!err.is_retryable());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn server_errors_are_retryable(status in 500u16..600) {
                let kind = HttpErrorClassifier.classify(&TransportError::status(status));
                prop_assert_eq!(kind, ErrorKind::Unavailable);
                prop_assert!(kind.is_retryable());
            }

            #[test]
            fn client_errors_are_never_unavailable(status in 400u16..500) {
                let kind = HttpErrorClassifier.classify(&TransportError::status(status));
                prop_assert_ne!(kind, ErrorKind::Unavailable);
                prop_assert_eq!(kind.is_retryable(), status == 408);
            }
        }
    }
}
