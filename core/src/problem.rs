//! Problem-details error bodies exchanged between services.
//!
//! Shape: `{type, title, status, detail, instance}`, served as
//! `application/problem+json`.

use crate::error::{ErrorKind, ServiceError};
use serde::{Deserialize, Serialize};

/// Content type of a problem-details body.
pub const PROBLEM_JSON: &str = "application/problem+json";

/// Default `type` when no more specific URI applies.
const ABOUT_BLANK: &str = "about:blank";

/// Problem-details error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// URI reference identifying the problem type
    #[serde(rename = "type", default = "about_blank")]
    pub problem_type: String,
    /// Short, human-readable summary
    pub title: String,
    /// HTTP status code
    pub status: u16,
    /// Explanation specific to this occurrence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// URI reference identifying this occurrence (we use the request id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

fn about_blank() -> String {
    ABOUT_BLANK.to_string()
}

impl ProblemDetails {
    /// Create a problem with `type = "about:blank"`.
    #[must_use]
    pub fn new(status: u16, title: impl Into<String>) -> Self {
        Self {
            problem_type: about_blank(),
            title: title.into(),
            status,
            detail: None,
            instance: None,
        }
    }

    /// Problem for an [`ErrorKind`], using the user-facing status mapping.
    #[must_use]
    pub fn for_kind(kind: ErrorKind) -> Self {
        let title = match kind {
            ErrorKind::NotFound => "Not Found",
            ErrorKind::Conflict => "Conflict",
            ErrorKind::Validation => "Bad Request",
            ErrorKind::Timeout | ErrorKind::Unavailable => "Service Unavailable",
            ErrorKind::Unknown => "Internal Server Error",
        };
        Self::new(kind.http_status(), title)
            .with_type(format!("urn:conduit:error:{}", kind.as_str()))
    }

    /// Set the `type` URI.
    #[must_use]
    pub fn with_type(mut self, problem_type: impl Into<String>) -> Self {
        self.problem_type = problem_type.into();
        self
    }

    /// Set the `detail` text.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Set the `instance` reference.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Parse a body, returning `None` if it is not a problem document.
    #[must_use]
    pub fn from_slice(body: &[u8]) -> Option<Self> {
        serde_json::from_slice(body).ok()
    }
}

impl From<&ServiceError> for ProblemDetails {
    fn from(err: &ServiceError) -> Self {
        Self::for_kind(err.kind()).with_detail(err.message())
    }
}
