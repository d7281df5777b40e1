//! Prometheus metrics for observability and monitoring.
//!
//! Every resilience component emits through the `metrics` facade; nothing is
//! recorded unless the binary installs a recorder. [`MetricsExporter`] installs
//! the Prometheus one and renders the scrape body; it does not listen on a
//! socket, the service mounts [`render`](MetricsExporter::render) on its own
//! `/metrics` route:
//! - Circuit breaker state and transitions
//! - Resilient client attempts
//! - Consumer dispositions
//! - Publisher confirms
//! - In-process dead letters
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit_runtime::metrics::MetricsExporter;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut exporter = MetricsExporter::new();
//! exporter.install()?;
//!
//! // Serve `exporter.render()` from the service's `/metrics` route.
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::State;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder handle.
///
/// Owns the handle returned when the recorder is installed; the service
/// exposes [`render`](Self::render) on its scrape endpoint.
#[derive(Default)]
pub struct MetricsExporter {
    handle: Option<PrometheusHandle>,
}

impl MetricsExporter {
    /// Exporter with no recorder installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Describe all metrics and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a recorder is already installed (e.g., in tests), this logs a warning,
    /// leaves [`handle`](Self::handle) empty and returns `Ok`.
    pub fn install(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this exporter did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Circuit Breaker Metrics
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_state_changes_total",
        "Total number of circuit breaker state transitions"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of calls rejected by an open circuit"
    );

    // Resilient Client Metrics
    describe_counter!(
        "resilient_client_attempts_total",
        "Total number of transport attempts by outcome"
    );
    describe_histogram!(
        "resilient_client_call_duration_seconds",
        "Time taken by a logical call including retries"
    );

    // Consumer Metrics
    describe_counter!(
        "consumer_messages_total",
        "Total number of consumed messages by disposition"
    );

    // Publisher Metrics
    describe_counter!(
        "publisher_messages_total",
        "Total number of published messages by result"
    );
    describe_histogram!(
        "publisher_confirm_duration_seconds",
        "Time taken to receive a publisher confirm"
    );

    // Dead Letter Metrics
    describe_gauge!("dlq_size", "Entries held by in-process dead-letter queues");
    describe_counter!("dlq_pushed_total", "Total entries pushed to dead-letter queues");
    describe_counter!(
        "dlq_dropped_total",
        "Total entries dropped from full dead-letter queues"
    );
}

/// Circuit breaker metrics recorder.
pub struct BreakerMetrics;

impl BreakerMetrics {
    /// Record circuit breaker state.
    pub fn record_state(breaker: &str, state: State) {
        gauge!("circuit_breaker_state", "breaker" => breaker.to_string()).set(state.gauge_value());
    }

    /// Record a state transition.
    pub fn record_transition(breaker: &str, from: State, to: State) {
        counter!(
            "circuit_breaker_state_changes_total",
            "breaker" => breaker.to_string(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        Self::record_state(breaker, to);
    }

    /// Record a rejected call (circuit open).
    pub fn record_rejection(breaker: &str) {
        counter!("circuit_breaker_rejections_total", "breaker" => breaker.to_string()).increment(1);
    }
}

/// Resilient client metrics recorder.
pub struct ClientMetrics;

impl ClientMetrics {
    /// Record one transport attempt.
    pub fn record_attempt(dependency: &str, outcome: &'static str) {
        counter!(
            "resilient_client_attempts_total",
            "dependency" => dependency.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    /// Record a finished logical call.
    pub fn record_call(dependency: &str, duration: Duration) {
        histogram!(
            "resilient_client_call_duration_seconds",
            "dependency" => dependency.to_string()
        )
        .record(duration.as_secs_f64());
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record how a message was settled.
    pub fn record_disposition(queue: &str, disposition: &'static str) {
        counter!(
            "consumer_messages_total",
            "queue" => queue.to_string(),
            "disposition" => disposition
        )
        .increment(1);
    }
}

/// Publisher metrics recorder.
pub struct PublisherMetrics;

impl PublisherMetrics {
    /// Record a confirmed publish.
    pub fn record_publish(exchange: &str, duration: Duration) {
        counter!(
            "publisher_messages_total",
            "exchange" => exchange.to_string(),
            "result" => "confirmed"
        )
        .increment(1);
        histogram!("publisher_confirm_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a publish the broker refused or never confirmed.
    pub fn record_publish_error(exchange: &str) {
        counter!(
            "publisher_messages_total",
            "exchange" => exchange.to_string(),
            "result" => "failed"
        )
        .increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_renders_nothing_before_install() {
        let exporter = MetricsExporter::new();
        assert!(exporter.handle().is_none());
        assert!(exporter.render().is_none());
    }

    #[test]
    fn test_exporter_render() {
        let mut exporter = MetricsExporter::default();
        exporter.install().unwrap();

        BreakerMetrics::record_transition("billing", State::Closed, State::Open);
        ClientMetrics::record_attempt("billing", "unavailable");
        ConsumerMetrics::record_disposition("task-events", "dead_letter");
        PublisherMetrics::record_publish("task_events", Duration::from_millis(3));

        // If another test installed the recorder first, handle is None. Metrics
        // are still recorded globally.
        if let Some(rendered) = exporter.render() {
            assert!(rendered.contains("circuit_breaker_state_changes_total"));
            assert!(rendered.contains("resilient_client_attempts_total"));
            assert!(rendered.contains("consumer_messages_total"));
            assert!(rendered.contains("publisher_messages_total"));
        }
    }
}
