//! Redpanda message broker for Conduit.
//!
//! Implements [`MessageBroker`] on top of rdkafka, so it works with Redpanda or
//! any other Kafka-protocol broker.
//!
//! # Queue mapping
//!
//! Kafka has topics and consumer groups rather than exchanges and queues. A
//! [`QueueDeclaration`] maps onto them like this:
//!
//! ```text
//!   publish(exchange, routing_key)  ──►  topic = exchange, key = routing_key
//!   publish("", queue)              ──►  topic = queue (direct delivery)
//!
//!   queue "notifications"
//!     consumer group  = "notifications"
//!     subscribes to   = every bound exchange topic + the "notifications" topic
//!     bindings        = routing patterns matched against the record key
//!     requeue         = re-produce to "notifications" with attempt + 1, then commit
//!     dead-letter     = produce to the dead-letter exchange topic
//!                       (or "notifications.dlq"), then commit
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once** with manual offset commits:
//! - publishes wait for the broker's acknowledgement (`acks=all` by default)
//! - offsets are committed only once a delivery is settled
//! - a requeue or dead-letter is produced *before* the original is committed,
//!   so a crash in between duplicates rather than loses the message
//! - records whose key matches no binding are committed and skipped
//!
//! Handlers must therefore be idempotent (deduplicate on `delivery_id`).
//!
//! # Example
//!
//! ```no_run
//! use conduit_core::broker::{MessageBroker, QueueDeclaration};
//! use conduit_redpanda::RedpandaBroker;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = RedpandaBroker::builder()
//!     .brokers("localhost:9092")
//!     .auto_offset_reset("earliest")
//!     .build()?;
//!
//! broker
//!     .declare_queue(
//!         &QueueDeclaration::new("notifications")
//!             .bind("task_events", "task.*")
//!             .dead_letter_to("task_events.dlx"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;

use conduit_core::broker::{
    Acker, BrokerError, BrokerFuture, DEAD_LETTER_REASON_HEADER, Delivery, DeliveryStream,
    MessageBroker, QueueDeclaration, SubscribeOptions, topic_matches,
};
use conduit_core::envelope::Envelope;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Suffix of the fallback dead-letter topic for queues without a dead-letter exchange.
pub const DEFAULT_DLQ_SUFFIX: &str = ".dlq";

/// Topics a consumer of `declaration` must subscribe to.
///
/// Bound exchanges, deduplicated, plus the queue's own topic.
#[must_use]
pub fn subscription_topics(declaration: &QueueDeclaration) -> Vec<String> {
    let mut topics: Vec<String> = declaration
        .bindings
        .iter()
        .map(|(exchange, _)| exchange.clone())
        .chain(std::iter::once(declaration.name.clone()))
        .collect();
    topics.sort();
    topics.dedup();
    topics
}

/// Whether a record read from `topic` with `key` belongs in `declaration`'s queue.
#[must_use]
pub fn accepts(declaration: &QueueDeclaration, topic: &str, key: &str) -> bool {
    topic == declaration.name
        || declaration
            .bindings
            .iter()
            .any(|(exchange, pattern)| exchange == topic && topic_matches(pattern, key))
}

/// Where dead-lettered messages from `declaration` are produced: `(topic, key)`.
#[must_use]
pub fn dead_letter_target(declaration: &QueueDeclaration, routing_key: &str) -> (String, String) {
    let topic = declaration
        .dead_letter_exchange
        .clone()
        .unwrap_or_else(|| format!("{}{DEFAULT_DLQ_SUFFIX}", declaration.name));
    let key = declaration
        .dead_letter_routing_key
        .clone()
        .unwrap_or_else(|| routing_key.to_string());
    (topic, key)
}

/// Redpanda-backed [`MessageBroker`].
///
/// # Configuration
///
/// - **Broker addresses**: bootstrap servers (required)
/// - **Producer settings**: acks, compression, timeout
/// - **Group prefix**: prepended to queue names to form consumer group ids
/// - **Offset reset**: where new consumer groups start reading (default: "latest")
///
/// # Example
///
/// ```no_run
/// use conduit_redpanda::RedpandaBroker;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = RedpandaBroker::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .compression("lz4")
///     .group_prefix("task-service.")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaBroker {
    producer: FutureProducer,
    brokers: String,
    timeout: Duration,
    group_prefix: String,
    auto_offset_reset: String,
    queues: Mutex<HashMap<String, QueueDeclaration>>,
}

impl RedpandaBroker {
    /// Create a broker with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if the producer cannot be created.
    pub fn new(brokers: &str) -> Result<Self, BrokerError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder.
    #[must_use]
    pub fn builder() -> RedpandaBrokerBuilder {
        RedpandaBrokerBuilder::default()
    }

    /// Bootstrap servers.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Consumer group id used for `queue`.
    #[must_use]
    pub fn group_id(&self, queue: &str) -> String {
        format!("{}{queue}", self.group_prefix)
    }

    fn declaration(&self, queue: &str) -> Option<QueueDeclaration> {
        self.queues
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
    }
}

impl std::fmt::Debug for RedpandaBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaBroker")
            .field("brokers", &self.brokers)
            .field("timeout", &self.timeout)
            .field("group_prefix", &self.group_prefix)
            .finish_non_exhaustive()
    }
}

/// Builder for configuring a [`RedpandaBroker`].
#[derive(Default)]
pub struct RedpandaBrokerBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    group_prefix: Option<String>,
    auto_offset_reset: Option<String>,
}

impl RedpandaBrokerBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "all". Anything weaker gives up the publish confirm guarantee.
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set how long a publish may wait for its acknowledgement.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Prefix consumer group ids, e.g. with the service name.
    #[must_use]
    pub fn group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.group_prefix = Some(prefix.into());
        self
    }

    /// Where new consumer groups start reading: "earliest", "latest" or "error".
    ///
    /// Default: "latest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaBroker`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionFailed`] if brokers are not set or the
    /// producer cannot be created.
    pub fn build(self) -> Result<RedpandaBroker, BrokerError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BrokerError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let acks = self.producer_acks.as_deref().unwrap_or("all");
        let compression = self.compression.as_deref().unwrap_or("none");

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| BrokerError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        let auto_offset_reset = self.auto_offset_reset.unwrap_or_else(|| "latest".to_string());
        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaBroker created"
        );

        Ok(RedpandaBroker {
            producer,
            brokers,
            timeout,
            group_prefix: self.group_prefix.unwrap_or_default(),
            auto_offset_reset,
            queues: Mutex::new(HashMap::new()),
        })
    }
}

/// Produce `envelope` and wait for the acknowledgement.
async fn produce(
    producer: &FutureProducer,
    timeout: Duration,
    topic: &str,
    key: &str,
    envelope: &Envelope,
) -> Result<(), BrokerError> {
    let record = FutureRecord::to(topic)
        .payload(envelope.body())
        .key(key)
        .headers(codec::encode_headers(envelope));

    match producer.send(record, Timeout::After(timeout)).await {
        Ok((partition, offset)) => {
            tracing::debug!(
                topic,
                key,
                partition,
                offset,
                delivery_id = %envelope.delivery_id(),
                "Message published"
            );
            Ok(())
        }
        Err((kafka_error, _)) => {
            tracing::error!(topic, key, error = %kafka_error, "Failed to publish message");
            Err(BrokerError::PublishFailed {
                destination: topic.to_string(),
                reason: kafka_error.to_string(),
            })
        }
    }
}

impl MessageBroker for RedpandaBroker {
    fn declare_queue(&self, declaration: &QueueDeclaration) -> BrokerFuture<'_, ()> {
        let result = {
            let mut queues = self.queues.lock().unwrap_or_else(PoisonError::into_inner);
            match queues.get(&declaration.name) {
                Some(existing) if existing != declaration => Err(BrokerError::Transport(format!(
                    "queue '{}' redeclared with different bindings",
                    declaration.name
                ))),
                Some(_) => Ok(()),
                None => {
                    tracing::info!(
                        queue = %declaration.name,
                        topics = ?subscription_topics(declaration),
                        dead_letter = ?declaration.dead_letter_exchange,
                        "Queue declared"
                    );
                    queues.insert(declaration.name.clone(), declaration.clone());
                    Ok(())
                }
            }
        };
        Box::pin(async move { result })
    }

    fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> BrokerFuture<'_, ()> {
        let topic = if exchange.is_empty() { routing_key } else { exchange }.to_string();
        let key = routing_key.to_string();
        let envelope = envelope.clone();

        Box::pin(async move { produce(&self.producer, self.timeout, &topic, &key, &envelope).await })
    }

    fn subscribe(&self, queue: &str, options: SubscribeOptions) -> BrokerFuture<'_, DeliveryStream> {
        let queue = queue.to_string();
        let declaration = self.declaration(&queue);

        Box::pin(async move {
            let declaration = declaration.ok_or_else(|| BrokerError::UnknownQueue(queue.clone()))?;
            let topics = subscription_topics(&declaration);
            let group_id = self.group_id(&queue);

            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &self.brokers)
                .set("group.id", &group_id)
                .set("enable.auto.commit", "false") // Settlement commits
                .set("auto.offset.reset", &self.auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| BrokerError::SubscriptionFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| BrokerError::SubscriptionFailed {
                    queue: queue.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                queue = %queue,
                topics = ?topics,
                consumer_group = %group_id,
                prefetch = options.prefetch,
                "Subscribed to queue"
            );

            let route = Arc::new(Route {
                consumer,
                producer: self.producer.clone(),
                timeout: self.timeout,
                declaration,
            });

            // Bounded by prefetch: the consumer task stops reading when the
            // subscriber has that many deliveries queued.
            let (tx, rx) = tokio::sync::mpsc::channel(usize::from(options.prefetch.max(1)));
            tokio::spawn(forward(route, tx));

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }
}

/// Everything a subscription needs to read and settle records.
struct Route {
    consumer: StreamConsumer,
    producer: FutureProducer,
    timeout: Duration,
    declaration: QueueDeclaration,
}

#[derive(Debug, Clone)]
struct Position {
    topic: String,
    partition: i32,
    offset: i64,
}

impl Route {
    fn commit(&self, position: &Position) -> KafkaResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Async)
    }

    fn commit_or_warn(&self, position: &Position, what: &str) {
        if let Err(e) = self.commit(position) {
            tracing::warn!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                error = %e,
                "Failed to commit {what} (message may be redelivered)"
            );
        }
    }
}

/// Read records, turn them into deliveries and hand them to the subscriber.
async fn forward(route: Arc<Route>, tx: tokio::sync::mpsc::Sender<Result<Delivery, BrokerError>>) {
    use futures::StreamExt;

    let mut stream = route.consumer.stream();
    while let Some(result) = stream.next().await {
        let item = match result {
            Ok(message) => {
                let position = Position {
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                };
                let routing_key = message
                    .key()
                    .and_then(|key| std::str::from_utf8(key).ok())
                    .unwrap_or_default()
                    .to_string();

                if !accepts(&route.declaration, &position.topic, &routing_key) {
                    tracing::trace!(topic = %position.topic, key = %routing_key, "Record matches no binding, skipping");
                    route.commit_or_warn(&position, "skipped record");
                    continue;
                }

                let decoded = codec::decode(message.headers(), message.payload(), || {
                    format!("{}-{}-{}", position.topic, position.partition, position.offset)
                });
                match decoded {
                    Ok(envelope) => {
                        let acker = KafkaAcker {
                            route: Arc::clone(&route),
                            position,
                            routing_key,
                            envelope: envelope.clone(),
                        };
                        Ok(Delivery::new(envelope, Box::new(acker)))
                    }
                    Err(e) => {
                        // Never deliverable; don't let it block the partition.
                        route.commit_or_warn(&position, "malformed record");
                        Err(e)
                    }
                }
            }
            Err(e) => Err(BrokerError::Transport(format!("Failed to receive message: {e}"))),
        };

        if tx.send(item).await.is_err() {
            tracing::debug!(queue = %route.declaration.name, "Subscriber dropped, stopping consumer task");
            break;
        }
    }

    tracing::debug!(queue = %route.declaration.name, "Consumer task exiting");
}

/// Settles one record: produce follow-ups first, then commit.
struct KafkaAcker {
    route: Arc<Route>,
    position: Position,
    routing_key: String,
    envelope: Envelope,
}

impl KafkaAcker {
    fn commit(&self) -> Result<(), BrokerError> {
        self.route
            .commit(&self.position)
            .map_err(|e| BrokerError::SettlementFailed(format!("commit failed: {e}")))
    }

    async fn produce_then_commit(&self, topic: &str, key: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        produce(&self.route.producer, self.route.timeout, topic, key, envelope)
            .await
            .map_err(|e| BrokerError::SettlementFailed(e.to_string()))?;
        self.commit()
    }
}

impl Acker for KafkaAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        let result = self.commit();
        Box::pin(async move { result })
    }

    fn requeue(&self, next: Envelope) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let queue = self.route.declaration.name.clone();
            self.produce_then_commit(&queue, &self.routing_key, &next).await
        })
    }

    fn dead_letter(&self, reason: String) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            let (topic, key) = dead_letter_target(&self.route.declaration, &self.routing_key);
            let dead = self
                .envelope
                .clone()
                .with_header(DEAD_LETTER_REASON_HEADER, reason);
            self.produce_then_commit(&topic, &key, &dead).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn declaration() -> QueueDeclaration {
        QueueDeclaration::new("notifications")
            .bind("task_events", "task.*")
            .bind("task_events", "user.deleted")
            .bind("user_events", "#")
    }

    #[test]
    fn redpanda_broker_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaBroker>();
        assert_sync::<RedpandaBroker>();
    }

    #[test]
    fn build_requires_brokers() {
        assert!(matches!(
            RedpandaBroker::builder().build(),
            Err(BrokerError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn subscribes_to_bound_exchanges_and_own_topic() {
        assert_eq!(
            subscription_topics(&declaration()),
            vec!["notifications", "task_events", "user_events"]
        );
    }

    #[test]
    fn bindings_filter_by_key() {
        let declaration = declaration();
        assert!(accepts(&declaration, "task_events", "task.created"));
        assert!(accepts(&declaration, "task_events", "user.deleted"));
        assert!(!accepts(&declaration, "task_events", "user.created"));
        assert!(accepts(&declaration, "user_events", "anything"));
        // Requeued records arrive on the queue's own topic.
        assert!(accepts(&declaration, "notifications", "task.created"));
        assert!(!accepts(&declaration, "billing_events", "task.created"));
    }

    #[test]
    fn dead_letter_target_defaults_to_queue_dlq() {
        assert_eq!(
            dead_letter_target(&declaration(), "task.created"),
            ("notifications.dlq".to_string(), "task.created".to_string())
        );

        let with_dlx = declaration()
            .dead_letter_to("task_events.dlx")
            .dead_letter_routing_key("dead");
        assert_eq!(
            dead_letter_target(&with_dlx, "task.created"),
            ("task_events.dlx".to_string(), "dead".to_string())
        );
    }
}
