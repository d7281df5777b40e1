//! Message envelope carried through the broker.
//!
//! The envelope is deliberately dumb: an opaque body plus typed access to the
//! headers the resilience layer relies on. Interpreting the body is the
//! registered handler's job.

use crate::correlation::{CorrelationContext, HeaderCarrier};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Header holding the 1-based delivery attempt.
pub const ATTEMPT_HEADER: &str = "attempt";

/// Header holding the domain event type (also used as routing key).
pub const EVENT_TYPE_HEADER: &str = "event_type";

/// Header holding the RFC 3339 publish timestamp.
pub const TIMESTAMP_HEADER: &str = "timestamp";

/// Header naming the publishing service.
pub const SERVICE_HEADER: &str = "service";

/// A message as published and delivered.
///
/// `delivery_id` is assigned once at publish time and survives redeliveries, so
/// it is the natural deduplication key for idempotent handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    delivery_id: String,
    body: Vec<u8>,
    headers: BTreeMap<String, String>,
    redelivered: bool,
}

impl Envelope {
    /// Create a first-attempt envelope with a fresh delivery id.
    #[must_use]
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(ATTEMPT_HEADER.to_string(), "1".to_string());
        Self {
            delivery_id: Uuid::new_v4().to_string(),
            body: body.into(),
            headers,
            redelivered: false,
        }
    }

    /// Serialize `value` as a JSON body.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if `value` cannot be serialized.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Reassemble an envelope received from a broker.
    #[must_use]
    pub const fn from_parts(
        delivery_id: String,
        body: Vec<u8>,
        headers: BTreeMap<String, String>,
        redelivered: bool,
    ) -> Self {
        Self {
            delivery_id,
            body,
            headers,
            redelivered,
        }
    }

    /// Attach correlation headers.
    #[must_use]
    pub fn with_context(mut self, context: &CorrelationContext) -> Self {
        context.inject(&mut self.headers);
        self
    }

    /// Set an arbitrary header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Stable identifier of this message across redeliveries.
    #[must_use]
    pub fn delivery_id(&self) -> &str {
        &self.delivery_id
    }

    /// Raw body bytes.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the body does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// All headers.
    #[must_use]
    pub const fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Look up one header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.header(name)
    }

    /// Whether the broker has delivered this message before.
    #[must_use]
    pub const fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Current 1-based attempt. Missing or garbled headers count as the first attempt.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.header(ATTEMPT_HEADER)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(1)
            .max(1)
    }

    /// Domain event type, if the publisher set one.
    #[must_use]
    pub fn event_type(&self) -> Option<&str> {
        self.header(EVENT_TYPE_HEADER)
    }

    /// Correlation context carried by this message (a new root if absent).
    #[must_use]
    pub fn context(&self) -> CorrelationContext {
        CorrelationContext::extract(&self.headers)
    }

    /// The envelope to publish for the next redelivery: same id, `attempt + 1`.
    #[must_use]
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.headers.insert(
            ATTEMPT_HEADER.to_string(),
            self.attempt().saturating_add(1).to_string(),
        );
        next.redelivered = true;
        next
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::correlation::CORRELATION_ID_HEADER;

    #[test]
    fn new_envelope_is_first_attempt() {
        let envelope = Envelope::new(b"hello".to_vec());
        assert_eq!(envelope.attempt(), 1);
        assert!(!envelope.is_redelivered());
        assert!(!envelope.delivery_id().is_empty());
    }

    #[test]
    fn next_attempt_increments_and_keeps_identity() {
        let ctx = CorrelationContext::new_root();
        let first = Envelope::new(b"x".to_vec()).with_context(&ctx);
        let second = first.next_attempt();
        let third = second.next_attempt();

        assert_eq!(second.attempt(), 2);
        assert_eq!(third.attempt(), 3);
        assert!(third.is_redelivered());
        assert_eq!(third.delivery_id(), first.delivery_id());
        assert_eq!(third.body(), first.body());
        assert_eq!(
            third.header(CORRELATION_ID_HEADER),
            Some(ctx.correlation_id())
        );
    }

    #[test]
    fn garbled_attempt_header_counts_as_first() {
        let envelope = Envelope::new(Vec::new()).with_header(ATTEMPT_HEADER, "many");
        assert_eq!(envelope.attempt(), 1);

        let zero = Envelope::new(Vec::new()).with_header(ATTEMPT_HEADER, "0");
        assert_eq!(zero.attempt(), 1);
    }

    #[test]
    fn json_body_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct TaskCreated {
            task_id: u64,
        }

        let envelope = Envelope::json(&TaskCreated { task_id: 7 }).unwrap();
        let decoded: TaskCreated = envelope.decode().unwrap();
        assert_eq!(decoded, TaskCreated { task_id: 7 });
    }

    #[test]
    fn context_without_headers_is_new_root() {
        let envelope = Envelope::new(Vec::new());
        assert!(envelope.context().is_root());
    }
}
