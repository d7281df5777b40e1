//! Envelope ⇄ Kafka record conversion.
//!
//! The body travels as the record payload. Every envelope header becomes a
//! Kafka header of the same name, plus [`DELIVERY_ID_HEADER`].

use conduit_core::broker::BrokerError;
use conduit_core::envelope::{ATTEMPT_HEADER, Envelope};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use std::collections::BTreeMap;

/// Kafka header carrying the envelope's `delivery_id`.
pub const DELIVERY_ID_HEADER: &str = "delivery_id";

/// Kafka headers for `envelope`.
#[must_use]
pub fn encode_headers(envelope: &Envelope) -> OwnedHeaders {
    let initial = OwnedHeaders::new_with_capacity(envelope.headers().len() + 1).insert(Header {
        key: DELIVERY_ID_HEADER,
        value: Some(envelope.delivery_id()),
    });

    envelope
        .headers()
        .iter()
        .fold(initial, |headers, (key, value)| {
            headers.insert(Header {
                key,
                value: Some(value.as_str()),
            })
        })
}

/// Rebuild an envelope from a received record.
///
/// `fallback_id` names the record when it carries no `delivery_id` header
/// (messages produced by other clients).
///
/// # Errors
///
/// Returns [`BrokerError::Malformed`] if the record has no payload or a header
/// value is not UTF-8.
pub fn decode<H: Headers>(
    headers: Option<&H>,
    payload: Option<&[u8]>,
    fallback_id: impl FnOnce() -> String,
) -> Result<Envelope, BrokerError> {
    let body = payload
        .ok_or_else(|| BrokerError::Malformed("message has no payload".to_string()))?
        .to_vec();

    let mut delivery_id = None;
    let mut map = BTreeMap::new();
    for header in headers.into_iter().flat_map(Headers::iter) {
        let Some(value) = header.value else {
            continue;
        };
        let value = std::str::from_utf8(value).map_err(|e| {
            BrokerError::Malformed(format!("header '{}' is not UTF-8: {e}", header.key))
        })?;

        if header.key == DELIVERY_ID_HEADER {
            delivery_id = Some(value.to_string());
        } else {
            map.insert(header.key.to_string(), value.to_string());
        }
    }

    let redelivered = map
        .get(ATTEMPT_HEADER)
        .and_then(|attempt| attempt.parse::<u32>().ok())
        .is_some_and(|attempt| attempt > 1);
    Ok(Envelope::from_parts(
        delivery_id.unwrap_or_else(fallback_id),
        body,
        map,
        redelivered,
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use conduit_core::CorrelationContext;

    #[test]
    fn headers_carry_identity_and_context() {
        let ctx = CorrelationContext::new_root();
        let envelope = Envelope::new(b"{\"task_id\":1}".to_vec())
            .with_context(&ctx)
            .next_attempt();

        let headers = encode_headers(&envelope);
        let decoded = decode(Some(&headers), Some(envelope.body()), || "unused".to_string()).unwrap();

        assert_eq!(decoded.delivery_id(), envelope.delivery_id());
        assert_eq!(decoded.context(), ctx);
        assert_eq!(decoded.attempt(), 2);
        assert!(decoded.is_redelivered());
    }

    #[test]
    fn foreign_records_get_fallback_id() {
        let decoded = decode::<OwnedHeaders>(None, Some(&b"x"[..]), || "task_events-0-42".to_string()).unwrap();
        assert_eq!(decoded.delivery_id(), "task_events-0-42");
        assert_eq!(decoded.attempt(), 1);
        assert!(!decoded.is_redelivered());
    }

    #[test]
    fn missing_payload_is_malformed() {
        let result = decode::<OwnedHeaders>(None, None, String::new);
        assert!(matches!(result, Err(BrokerError::Malformed(_))));
    }

    #[test]
    fn non_utf8_header_is_malformed() {
        let headers = OwnedHeaders::new().insert(Header {
            key: ATTEMPT_HEADER,
            value: Some(&[0xff_u8, 0xfe][..]),
        });
        let result = decode(Some(&headers), Some(&b"x"[..]), String::new);
        assert!(matches!(result, Err(BrokerError::Malformed(_))));
    }
}
