//! Message consumption with acknowledge / requeue / dead-letter decisions.
//!
//! Every delivery ends in exactly one of three states:
//!
//! ```text
//!                   ┌──────────── Success ────────────► Acknowledged
//!   Received ──► process
//!                   ├── RetryableFailure, attempt <= max_redeliveries ──► Requeued (attempt + 1)
//!                   └── RetryableFailure exhausted | FatalFailure | Err | panic ──► Dead-lettered
//! ```
//!
//! The decision itself is the pure function [`decide`]; [`MessageConsumer`]
//! wires it to a broker subscription.
//!
//! # Example
//!
//! ```rust,no_run
//! use conduit_core::broker::MessageBroker;
//! use conduit_runtime::consumer::{handler_fn, MessageConsumer, Outcome};
//! use std::sync::Arc;
//!
//! # async fn example(broker: Arc<dyn MessageBroker>) -> Result<(), Box<dyn std::error::Error>> {
//! let handler = handler_fn(|envelope| async move {
//!     let _task: serde_json::Value = envelope.decode()?;
//!     Ok(Outcome::Success)
//! });
//!
//! MessageConsumer::new(broker, "task-events.analytics", handler)
//!     .with_max_redeliveries(2)
//!     .run_until(async { let _ = tokio::signal::ctrl_c().await; })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::ConsumerMetrics;
use conduit_core::broker::{BrokerError, Delivery, MessageBroker, SubscribeOptions};
use conduit_core::config::{ConfigError, ResilienceConfig};
use conduit_core::envelope::Envelope;
use conduit_core::error::ErrorKind;
use conduit_core::idempotency::IdempotencyStore;
use futures::{FutureExt, StreamExt};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::Instrument;

/// Result a handler reports for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Processed; acknowledge
    Success,
    /// Transient failure; redeliver while redeliveries remain
    RetryableFailure,
    /// Permanent failure; dead-letter now
    FatalFailure,
}

impl From<ErrorKind> for Outcome {
    fn from(kind: ErrorKind) -> Self {
        if kind.is_retryable() {
            Self::RetryableFailure
        } else {
            Self::FatalFailure
        }
    }
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disposition {
    /// Remove the message
    Acknowledge,
    /// Reject with requeue; redelivered with `attempt + 1`
    Requeue,
    /// Reject without requeue; routed to the dead-letter exchange
    DeadLetter,
}

impl Disposition {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acknowledge => "ack",
            Self::Requeue => "requeue",
            Self::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settlement for `outcome` on 1-based delivery `attempt`.
///
/// A retryable failure is requeued while `attempt <= max_redeliveries`, so a
/// message is handled at most `max_redeliveries + 1` times.
#[must_use]
pub const fn decide(outcome: Outcome, attempt: u32, max_redeliveries: u32) -> Disposition {
    match outcome {
        Outcome::Success => Disposition::Acknowledge,
        Outcome::RetryableFailure if attempt <= max_redeliveries => Disposition::Requeue,
        Outcome::RetryableFailure | Outcome::FatalFailure => Disposition::DeadLetter,
    }
}

/// Future returned by [`Handler::process`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Outcome, anyhow::Error>> + Send + 'a>>;

/// Processes one message.
///
/// `Err(_)` is an unclassified failure and dead-letters immediately, as does a
/// panic. Return [`Outcome::RetryableFailure`] explicitly for transient errors,
/// e.g. via `Outcome::from(service_error.kind())`.
///
/// A handler may see the same `delivery_id` more than once; wrap it in
/// [`Idempotent`] if its side effects must not repeat.
pub trait Handler: Send + Sync {
    /// Process `envelope`.
    fn process<'a>(&'a self, envelope: &'a Envelope) -> HandlerFuture<'a>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn process<'a>(&'a self, envelope: &'a Envelope) -> HandlerFuture<'a> {
        (**self).process(envelope)
    }
}

/// Handler built from a closure. See [`handler_fn`].
#[derive(Clone)]
pub struct FnHandler<F> {
    f: F,
}

/// Adapt `Fn(Envelope) -> impl Future<Output = anyhow::Result<Outcome>>` into a [`Handler`].
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, anyhow::Error>> + Send + 'static,
{
    FnHandler { f }
}

impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, anyhow::Error>> + Send + 'static,
{
    fn process<'a>(&'a self, envelope: &'a Envelope) -> HandlerFuture<'a> {
        Box::pin((self.f)(envelope.clone()))
    }
}

/// Skips deliveries whose `delivery_id` already completed.
///
/// Already-processed ids are acknowledged without running the inner handler.
/// Ids are marked only after the inner handler reports [`Outcome::Success`].
/// If the store cannot be read the message is treated as a retryable failure.
pub struct Idempotent<H> {
    inner: H,
    store: Arc<dyn IdempotencyStore>,
}

impl<H: Handler> Idempotent<H> {
    /// Wrap `inner`, recording completions in `store`.
    pub fn new(inner: H, store: Arc<dyn IdempotencyStore>) -> Self {
        Self { inner, store }
    }
}

impl<H: Handler> Handler for Idempotent<H> {
    fn process<'a>(&'a self, envelope: &'a Envelope) -> HandlerFuture<'a> {
        Box::pin(async move {
            let key = envelope.delivery_id();
            match self.store.is_processed(key).await {
                Ok(true) => {
                    tracing::debug!(delivery_id = %key, "Delivery already processed, skipping");
                    return Ok(Outcome::Success);
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(delivery_id = %key, error = %e, "Idempotency check failed");
                    return Ok(Outcome::RetryableFailure);
                }
            }

            let outcome = self.inner.process(envelope).await?;
            if outcome == Outcome::Success {
                if let Err(e) = self.store.mark_processed(key).await {
                    tracing::warn!(
                        delivery_id = %key,
                        error = %e,
                        "Failed to record processed delivery; a redelivery would run again"
                    );
                }
            }
            Ok(outcome)
        })
    }
}

/// Counts of settled deliveries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Deliveries acknowledged
    pub acknowledged: u64,
    /// Deliveries requeued
    pub requeued: u64,
    /// Deliveries dead-lettered
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    acknowledged: AtomicU64,
    requeued: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Consumes one queue, settling each delivery from its handler's outcome.
pub struct MessageConsumer<H> {
    broker: Arc<dyn MessageBroker>,
    queue: String,
    handler: H,
    max_redeliveries: u32,
    options: SubscribeOptions,
    counters: Counters,
}

impl<H: Handler> MessageConsumer<H> {
    /// Consumer with default redelivery limit (3) and prefetch (10).
    pub fn new(broker: Arc<dyn MessageBroker>, queue: impl Into<String>, handler: H) -> Self {
        Self {
            broker,
            queue: queue.into(),
            handler,
            max_redeliveries: ResilienceConfig::new().max_redeliveries,
            options: SubscribeOptions::default(),
            counters: Counters::default(),
        }
    }

    /// Consumer using validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid or `queue` is empty.
    pub fn from_config(
        broker: Arc<dyn MessageBroker>,
        queue: impl Into<String>,
        handler: H,
        config: &ResilienceConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "queue",
                reason: "handler registered without a queue name".to_string(),
            });
        }
        Ok(Self::new(broker, queue, handler).with_max_redeliveries(config.max_redeliveries))
    }

    /// Set how many times a retryable failure is redelivered.
    #[must_use]
    pub const fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }

    /// Set the number of unsettled deliveries the broker may hand out.
    #[must_use]
    pub const fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.options.prefetch = prefetch;
        self
    }

    /// Queue name.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Redelivery limit.
    #[must_use]
    pub const fn max_redeliveries(&self) -> u32 {
        self.max_redeliveries
    }

    /// Settled delivery counts so far.
    #[must_use]
    pub fn stats(&self) -> ConsumerStats {
        ConsumerStats {
            acknowledged: self.counters.acknowledged.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
        }
    }

    /// Process and settle one delivery.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the broker rejects the settlement. The handler's
    /// own failures are never returned; they decide the disposition.
    pub async fn handle(&self, delivery: Delivery) -> Result<Disposition, BrokerError> {
        let envelope = delivery.envelope();
        let context = envelope.context();
        let attempt = envelope.attempt();
        let span = tracing::info_span!(
            "consume",
            queue = %self.queue,
            delivery_id = %envelope.delivery_id(),
            request_id = %context.request_id(),
            correlation_id = %context.correlation_id(),
            attempt,
        );

        async move {
            let (outcome, failure) = self.invoke(delivery.envelope()).await;
            let disposition = decide(outcome, attempt, self.max_redeliveries);

            match disposition {
                Disposition::Acknowledge => {
                    tracing::debug!("Message processed, acknowledging");
                    delivery.ack().await?;
                    self.counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                }
                Disposition::Requeue => {
                    tracing::info!(
                        max_redeliveries = self.max_redeliveries,
                        "Retryable failure, requeueing"
                    );
                    delivery.requeue().await?;
                    self.counters.requeued.fetch_add(1, Ordering::Relaxed);
                }
                Disposition::DeadLetter => {
                    let reason = failure.unwrap_or_else(|| match outcome {
                        Outcome::RetryableFailure => {
                            format!("redeliveries exhausted after attempt {attempt}")
                        }
                        _ => "fatal failure".to_string(),
                    });
                    tracing::warn!(reason = %reason, "Dead-lettering message");
                    delivery.dead_letter(reason).await?;
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                }
            }

            ConsumerMetrics::record_disposition(&self.queue, disposition.as_str());
            Ok(disposition)
        }
        .instrument(span)
        .await
    }

    /// Subscribe and process deliveries until the subscription ends.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if subscribing fails or the stream reports a
    /// connection-level error.
    pub async fn run(&self) -> Result<ConsumerStats, BrokerError> {
        self.run_until(futures::future::pending()).await
    }

    /// Like [`run`](Self::run), stopping between deliveries once `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// As [`run`](Self::run).
    pub async fn run_until<S>(&self, shutdown: S) -> Result<ConsumerStats, BrokerError>
    where
        S: Future<Output = ()>,
    {
        let mut deliveries = self.broker.subscribe(&self.queue, self.options).await?;
        tracing::info!(
            queue = %self.queue,
            prefetch = self.options.prefetch,
            max_redeliveries = self.max_redeliveries,
            "Consumer started"
        );

        let mut shutdown = std::pin::pin!(shutdown);
        loop {
            let next = tokio::select! {
                biased;
                () = &mut shutdown => {
                    tracing::info!(queue = %self.queue, "Shutdown requested, stopping consumer");
                    break;
                }
                next = deliveries.next() => next,
            };

            match next {
                None => {
                    tracing::info!(queue = %self.queue, "Subscription ended");
                    break;
                }
                Some(Ok(delivery)) => {
                    if let Err(e) = self.handle(delivery).await {
                        // Unsettled deliveries come back from the broker.
                        tracing::error!(queue = %self.queue, error = %e, "Failed to settle delivery");
                    }
                }
                Some(Err(BrokerError::Malformed(reason))) => {
                    tracing::warn!(queue = %self.queue, reason = %reason, "Skipping malformed message");
                }
                Some(Err(e)) => {
                    tracing::error!(queue = %self.queue, error = %e, "Subscription failed");
                    return Err(e);
                }
            }
        }

        Ok(self.stats())
    }

    /// Run the handler, turning errors and panics into a fatal outcome.
    async fn invoke(&self, envelope: &Envelope) -> (Outcome, Option<String>) {
        let result = AssertUnwindSafe(async { self.handler.process(envelope).await })
            .catch_unwind()
            .await;

        match result {
            Ok(Ok(outcome)) => (outcome, None),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Handler returned an unclassified error");
                (Outcome::FatalFailure, Some(format!("handler error: {e:#}")))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(panic = %message, "Handler panicked");
                (Outcome::FatalFailure, Some(format!("handler panicked: {message}")))
            }
        }
    }
}

impl<H> fmt::Debug for MessageConsumer<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("queue", &self.queue)
            .field("max_redeliveries", &self.max_redeliveries)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
