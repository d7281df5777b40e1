//! Domain event publishing with correlation metadata and publisher confirms.
//!
//! [`EventPublisher::publish`] serializes the payload, stamps the envelope and
//! waits for the broker to confirm it. Delivery is at-least-once: a publish that
//! returns `Ok` has been accepted by the broker. There is no retry here; wrap the
//! call in a [`ResilientClient`](crate::client::ResilientClient) if the broker
//! itself needs guarding.
//!
//! Headers set on every event:
//!
//! | Header             | Value                                       |
//! |--------------------|---------------------------------------------|
//! | `X-Request-ID`     | new id derived from the caller's context    |
//! | `X-Correlation-ID` | the caller's correlation id                 |
//! | `attempt`          | `1`                                         |
//! | `event_type`       | the event type (also the routing key)       |
//! | `timestamp`        | RFC 3339 publish time                       |
//! | `service`          | name of the publishing service              |

use crate::metrics::PublisherMetrics;
use conduit_core::broker::{BrokerError, MessageBroker};
use conduit_core::correlation::CorrelationContext;
use conduit_core::envelope::{EVENT_TYPE_HEADER, Envelope, SERVICE_HEADER, TIMESTAMP_HEADER};
use conduit_core::environment::{Clock, SystemClock};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;

/// Errors from publishing an event.
#[derive(Error, Debug)]
pub enum PublishError {
    /// The payload could not be serialized
    #[error("Failed to serialize event payload: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The broker refused or did not confirm the message
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Publishes domain events for one service.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn MessageBroker>,
    service: String,
    clock: Arc<dyn Clock>,
}

impl EventPublisher {
    /// Publisher stamping events with `service`.
    pub fn new(broker: Arc<dyn MessageBroker>, service: impl Into<String>) -> Self {
        Self {
            broker,
            service: service.into(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Read publish timestamps from `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Name stamped into the `service` header.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Publish `payload` as JSON to `topic`, routed by `event_type`.
    ///
    /// Returns the envelope as sent (its `delivery_id` identifies the event).
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Serialize`] if the payload cannot be encoded, or
    /// [`PublishError::Broker`] if the broker does not confirm it.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        event_type: &str,
        payload: &T,
        context: &CorrelationContext,
    ) -> Result<Envelope, PublishError> {
        let envelope = self.envelope(event_type, serde_json::to_vec(payload)?, context);
        self.publish_envelope(topic, event_type, &envelope).await?;
        Ok(envelope)
    }

    /// Build the envelope [`publish`](Self::publish) would send.
    #[must_use]
    pub fn envelope(&self, event_type: &str, body: Vec<u8>, context: &CorrelationContext) -> Envelope {
        Envelope::new(body)
            .with_context(&context.derive())
            .with_header(EVENT_TYPE_HEADER, event_type)
            .with_header(TIMESTAMP_HEADER, self.clock.now().to_rfc3339())
            .with_header(SERVICE_HEADER, self.service.clone())
    }

    /// Publish a prepared envelope and wait for the confirm.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the broker refuses or does not confirm it.
    pub async fn publish_envelope(
        &self,
        topic: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<(), BrokerError> {
        let started = Instant::now();
        let context = envelope.context();

        match self.broker.publish(topic, routing_key, envelope).await {
            Ok(()) => {
                tracing::debug!(
                    topic,
                    routing_key,
                    delivery_id = %envelope.delivery_id(),
                    request_id = %context.request_id(),
                    correlation_id = %context.correlation_id(),
                    service = %self.service,
                    "Event published"
                );
                PublisherMetrics::record_publish(topic, started.elapsed());
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    topic,
                    routing_key,
                    delivery_id = %envelope.delivery_id(),
                    correlation_id = %context.correlation_id(),
                    error = %e,
                    "Event publish failed"
                );
                PublisherMetrics::record_publish_error(topic);
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}
