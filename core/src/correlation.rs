//! Correlation context for distributed tracing across service boundaries.
//!
//! Every unit of work carries two identifiers:
//!
//! - **request id**: unique per external call (one per HTTP request or message hop)
//! - **correlation id**: stable across the whole causal chain started at an entry point
//!
//! At the origin both are equal. Each outbound hop derives a child context that keeps
//! the correlation id and mints a fresh request id.
//!
//! # Propagation
//!
//! ```text
//! inbound request ──extract──► CorrelationContext ──derive──► child
//!  (X-Request-ID,                                            │
//!   X-Correlation-ID)                                        └─inject──► outbound headers
//! ```
//!
//! # Example
//!
//! ```
//! use conduit_core::correlation::{CorrelationContext, CORRELATION_ID_HEADER};
//! use std::collections::BTreeMap;
//!
//! let root = CorrelationContext::new_root();
//! let mut headers = BTreeMap::new();
//! root.derive().inject(&mut headers);
//!
//! let downstream = CorrelationContext::extract(&headers);
//! assert_eq!(downstream.correlation_id(), root.correlation_id());
//! assert_eq!(headers[CORRELATION_ID_HEADER], root.correlation_id());
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Header carrying the per-call request id.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Header carrying the chain-wide correlation id.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Longest identifier accepted from an inbound header.
const MAX_ID_LEN: usize = 128;

/// Request and correlation identifiers for one unit of work.
///
/// Immutable once created. Clone it to hand it to another task; use
/// [`derive`](Self::derive) for every outbound hop.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationContext {
    request_id: String,
    correlation_id: String,
}

impl CorrelationContext {
    /// Start a new causal chain. The correlation id equals the request id.
    #[must_use]
    pub fn new_root() -> Self {
        let id = new_id();
        Self {
            request_id: id.clone(),
            correlation_id: id,
        }
    }

    /// Create a child context: same correlation id, new request id.
    #[must_use]
    pub fn derive(&self) -> Self {
        Self {
            request_id: new_id(),
            correlation_id: self.correlation_id.clone(),
        }
    }

    /// Rebuild a context from known identifiers.
    ///
    /// Identifiers that could not travel as a header value (empty, longer
    /// than 128 bytes, or containing spaces or non-ASCII) are replaced using
    /// the same rules as [`extract`](Self::extract).
    #[must_use]
    pub fn from_parts(request_id: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        let request_id = Some(request_id.into()).filter(|v| is_valid_id(v));
        let correlation_id = Some(correlation_id.into()).filter(|v| is_valid_id(v));
        Self::resolve(request_id, correlation_id)
    }

    fn resolve(request_id: Option<String>, correlation_id: Option<String>) -> Self {
        match (request_id, correlation_id) {
            (Some(request_id), Some(correlation_id)) => Self {
                request_id,
                correlation_id,
            },
            (None, Some(correlation_id)) => Self {
                request_id: new_id(),
                correlation_id,
            },
            (Some(request_id), None) => Self {
                correlation_id: request_id.clone(),
                request_id,
            },
            (None, None) => Self::new_root(),
        }
    }

    /// The per-call request id.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The chain-wide correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Write both identifiers into an outbound carrier (HTTP or message headers).
    pub fn inject<C: HeaderCarrier + ?Sized>(&self, carrier: &mut C) {
        carrier.set_header(REQUEST_ID_HEADER, self.request_id.clone());
        carrier.set_header(CORRELATION_ID_HEADER, self.correlation_id.clone());
    }

    /// Read the identifiers from an inbound carrier.
    ///
    /// Missing or malformed values are replaced:
    /// - neither present: a new root
    /// - only the correlation id: a fresh request id under that correlation id
    /// - only the request id: a new chain rooted at that request id
    #[must_use]
    pub fn extract<C: HeaderCarrier + ?Sized>(carrier: &C) -> Self {
        let request_id = carrier
            .header(REQUEST_ID_HEADER)
            .filter(|v| is_valid_id(v))
            .map(str::to_string);
        let correlation_id = carrier
            .header(CORRELATION_ID_HEADER)
            .filter(|v| is_valid_id(v))
            .map(str::to_string);

        Self::resolve(request_id, correlation_id)
    }

    /// Whether this context started its chain (`request_id == correlation_id`).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.request_id == self.correlation_id
    }
}

impl fmt::Display for CorrelationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request_id={} correlation_id={}",
            self.request_id, self.correlation_id
        )
    }
}

/// Anything identifiers can be read from and written to.
///
/// Implemented for HTTP header maps and for message envelope headers.
pub trait HeaderCarrier {
    /// Look up a header value by name.
    fn header(&self, name: &str) -> Option<&str>;

    /// Insert or replace a header value.
    fn set_header(&mut self, name: &str, value: String);
}

impl HeaderCarrier for BTreeMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name)
            .or_else(|| {
                self.iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value)
            })
            .map(String::as_str)
    }

    fn set_header(&mut self, name: &str, value: String) {
        self.insert(name.to_string(), value);
    }
}

impl HeaderCarrier for http::HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    fn set_header(&mut self, name: &str, value: String) {
        let Ok(header_name) = http::HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(header = name, "dropping header with invalid name");
            return;
        };
        match http::HeaderValue::from_str(&value) {
            Ok(value) => {
                self.insert(header_name, value);
            }
            Err(_) => tracing::warn!(header = name, "dropping header with invalid value"),
        }
    }
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

fn is_valid_id(value: &str) -> bool {
    !value.is_empty() && value.len() <= MAX_ID_LEN && value.bytes().all(|b| b.is_ascii_graphic())
}
