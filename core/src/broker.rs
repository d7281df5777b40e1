//! Broker abstraction for asynchronous traffic.
//!
//! The broker itself is an external collaborator. This module fixes the contract
//! the resilience layer needs from it:
//!
//! - **publish** with a publisher confirm (at-least-once)
//! - **subscribe** to a queue and receive [`Delivery`] values
//! - per delivery, exactly one of **ack**, **requeue**, or **dead-letter**
//!
//! # Dead-letter routing
//!
//! ```text
//!            publish(exchange, routing_key)
//!                        │
//!                        ▼
//!                ┌──────────────┐   reject(requeue=false)   ┌──────────────────┐
//!                │ primary queue│ ────────────────────────► │ dead-letter exch. │
//!                │ x-dead-letter│                           └────────┬─────────┘
//!                │  -exchange   │ ◄── requeue(attempt + 1)           ▼
//!                └──────┬───────┘                           ┌──────────────────┐
//!                       │ deliver                           │ dead-letter queue│
//!                       ▼                                   └──────────────────┘
//!                   consumer
//! ```
//!
//! # Dyn Compatibility
//!
//! Traits return `Pin<Box<dyn Future>>` instead of using `async fn` so brokers can
//! be shared as `Arc<dyn MessageBroker>`.

use crate::envelope::Envelope;
use futures::Stream;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Queue argument binding a queue to its dead-letter exchange.
pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";

/// Queue argument overriding the routing key used when dead-lettering.
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";

/// Header recording why a message was dead-lettered.
pub const DEAD_LETTER_REASON_HEADER: &str = "x-dead-letter-reason";

/// Errors that can occur during broker operations.
#[derive(Error, Debug, Clone)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message
    #[error("Publish failed for '{destination}': {reason}")]
    PublishFailed {
        /// Exchange or topic
        destination: String,
        /// The reason for failure
        reason: String,
    },

    /// The broker did not confirm a publish
    #[error("Publish to '{0}' was not confirmed")]
    NotConfirmed(String),

    /// Failed to subscribe to a queue
    #[error("Subscription failed for queue '{queue}': {reason}")]
    SubscriptionFailed {
        /// The queue that failed
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to settle (ack / requeue / dead-letter) a delivery
    #[error("Settlement failed: {0}")]
    SettlementFailed(String),

    /// Queue has not been declared
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// A received message could not be decoded into an envelope
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Future returned by broker operations.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of deliveries from a subscription.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Declaration of a primary queue and its bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    /// Queue name
    pub name: String,
    /// Survive broker restarts
    pub durable: bool,
    /// `(exchange, routing pattern)` pairs feeding this queue
    pub bindings: Vec<(String, String)>,
    /// Exchange receiving messages rejected without requeue
    pub dead_letter_exchange: Option<String>,
    /// Routing key used when dead-lettering (defaults to the original key)
    pub dead_letter_routing_key: Option<String>,
}

impl QueueDeclaration {
    /// A durable queue without bindings or dead-letter exchange.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            bindings: Vec::new(),
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }

    /// Bind to `exchange` with a topic routing pattern (`*` one word, `#` any).
    #[must_use]
    pub fn bind(mut self, exchange: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.bindings.push((exchange.into(), pattern.into()));
        self
    }

    /// Route rejected messages to `exchange`.
    #[must_use]
    pub fn dead_letter_to(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Override the routing key used for dead-lettered messages.
    #[must_use]
    pub fn dead_letter_routing_key(mut self, key: impl Into<String>) -> Self {
        self.dead_letter_routing_key = Some(key.into());
        self
    }

    /// Declaration arguments as sent to an AMQP-style broker.
    #[must_use]
    pub fn arguments(&self) -> BTreeMap<String, String> {
        let mut args = BTreeMap::new();
        if let Some(exchange) = &self.dead_letter_exchange {
            args.insert(DEAD_LETTER_EXCHANGE_ARG.to_string(), exchange.clone());
        }
        if let Some(key) = &self.dead_letter_routing_key {
            args.insert(DEAD_LETTER_ROUTING_KEY_ARG.to_string(), key.clone());
        }
        args
    }
}

/// Options applied when subscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Maximum unsettled deliveries in flight for this consumer
    pub prefetch: u16,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { prefetch: 10 }
    }
}

/// Settles one delivery with the broker.
///
/// Implementations are provided by broker adapters. Each delivery is settled
/// at most once; [`Delivery`] enforces this by consuming itself.
pub trait Acker: Send + Sync {
    /// Acknowledge: remove the message permanently.
    fn ack(&self) -> BrokerFuture<'_, ()>;

    /// Reject with requeue, redelivering `next` (same id, incremented attempt).
    fn requeue(&self, next: Envelope) -> BrokerFuture<'_, ()>;

    /// Reject without requeue, routing to the dead-letter exchange.
    fn dead_letter(&self, reason: String) -> BrokerFuture<'_, ()>;
}

/// A message handed to a consumer together with its settlement handle.
pub struct Delivery {
    envelope: Envelope,
    acker: Box<dyn Acker>,
}

impl Delivery {
    /// Pair an envelope with the broker handle that settles it.
    #[must_use]
    pub fn new(envelope: Envelope, acker: Box<dyn Acker>) -> Self {
        Self { envelope, acker }
    }

    /// The delivered message.
    #[must_use]
    pub const fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Acknowledge the message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SettlementFailed`] if the broker rejects the ack.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack().await
    }

    /// Reject and redeliver with the attempt counter incremented.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SettlementFailed`] if the broker rejects the requeue.
    pub async fn requeue(self) -> Result<(), BrokerError> {
        let next = self.envelope.next_attempt();
        self.acker.requeue(next).await
    }

    /// Reject without requeue so the broker dead-letters the message.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SettlementFailed`] if the broker rejects the nack.
    pub async fn dead_letter(self, reason: impl Into<String>) -> Result<(), BrokerError> {
        self.acker.dead_letter(reason.into()).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Trait for broker adapters.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; one broker handle is shared by every
/// publisher and consumer in the process.
pub trait MessageBroker: Send + Sync {
    /// Declare a queue, its bindings and its dead-letter exchange.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError`] if the declaration is refused.
    fn declare_queue(&self, declaration: &QueueDeclaration) -> BrokerFuture<'_, ()>;

    /// Publish and wait for the broker's confirm.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] or [`BrokerError::NotConfirmed`].
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> BrokerFuture<'_, ()>;

    /// Subscribe to a declared queue.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::SubscriptionFailed`] or [`BrokerError::UnknownQueue`].
    fn subscribe(&self, queue: &str, options: SubscribeOptions) -> BrokerFuture<'_, DeliveryStream>;
}

/// Whether a topic routing `pattern` matches `routing_key`.
///
/// Words are separated by `.`; `*` matches exactly one word and `#` zero or more.
/// Runs in `O(pattern words * key words)` however many `#` the pattern holds.
#[must_use]
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let key: Vec<&str> = routing_key.split('.').collect();

    // matched[j]: the pattern words seen so far match the first `j` key words.
    let mut matched = vec![false; key.len() + 1];
    matched[0] = true;

    for word in pattern.split('.') {
        if word == "#" {
            for j in 1..=key.len() {
                matched[j] = matched[j] || matched[j - 1];
            }
        } else {
            for j in (1..=key.len()).rev() {
                matched[j] = matched[j - 1] && (word == "*" || word == key[j - 1]);
            }
            matched[0] = false;
        }
    }

    matched[key.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_arguments_include_dead_letter_exchange() {
        let declaration = QueueDeclaration::new("task-events.analytics")
            .bind("task_events", "task.*")
            .dead_letter_to("task_events.dlx");

        let args = declaration.arguments();
        assert_eq!(
            args.get(DEAD_LETTER_EXCHANGE_ARG).map(String::as_str),
            Some("task_events.dlx")
        );
        assert!(!args.contains_key(DEAD_LETTER_ROUTING_KEY_ARG));
    }

    #[test]
    fn declaration_without_dead_letter_has_no_arguments() {
        assert!(QueueDeclaration::new("q").arguments().is_empty());
    }

    #[test]
    fn topic_patterns() {
        assert!(topic_matches("task.created", "task.created"));
        assert!(topic_matches("task.*", "task.created"));
        assert!(!topic_matches("task.*", "task.created.v2"));
        assert!(topic_matches("task.#", "task.created.v2"));
        assert!(topic_matches("task.#", "task"));
        assert!(topic_matches("#", "anything.at.all"));
        assert!(!topic_matches("user.*", "task.created"));
    }

    #[test]
    fn hash_wildcards_combine() {
        assert!(topic_matches("#.created", "task.created"));
        assert!(topic_matches("#.created", "created"));
        assert!(topic_matches("task.#.v2", "task.v2"));
        assert!(topic_matches("task.#.v2", "task.created.by.bot.v2"));
        assert!(topic_matches("#.#", "task"));
        assert!(topic_matches("*.#.*", "a.b"));
        assert!(!topic_matches("*.#.*", "a"));
        assert!(!topic_matches("task.#.v2", "task.created.v3"));
    }

    #[test]
    fn many_hash_segments_against_long_key() {
        let pattern = ["#"; 24].join(".x.") + ".y";
        let key = ["x"; 64].join(".");
        assert!(!topic_matches(&pattern, &key));
        assert!(topic_matches(&pattern, &(key + ".y")));
    }

    #[test]
    fn delivery_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<Delivery>();
    }
}
