//! In-memory [`MessageBroker`] with topic exchanges and dead-letter routing.
//!
//! Behaves like a single AMQP node closely enough for consumer and publisher
//! tests:
//!
//! - every exchange is a topic exchange; the empty exchange routes to the queue
//!   named by the routing key
//! - publishes are confirmed unless [`fail_next_publishes`](InMemoryBroker::fail_next_publishes)
//!   says otherwise; unroutable messages are confirmed and dropped
//! - requeue puts the next attempt at the back of the queue
//! - dead-lettering routes through the queue's dead-letter exchange, or into
//!   [`dead_letters`](InMemoryBroker::dead_letters) when the queue has none
//! - prefetch bounds unsettled deliveries per subscription
//! - a delivery dropped without being settled goes back to the front of its
//!   queue, flagged as redelivered, with the same attempt

use conduit_core::broker::{
    Acker, BrokerError, BrokerFuture, DEAD_LETTER_REASON_HEADER, Delivery, DeliveryStream,
    MessageBroker, QueueDeclaration, SubscribeOptions, topic_matches,
};
use conduit_core::envelope::Envelope;
use conduit_runtime::DeadLetterQueue;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// A publish the broker confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Target exchange
    pub exchange: String,
    /// Routing key used
    pub routing_key: String,
    /// Message as published
    pub envelope: Envelope,
}

#[derive(Debug, Clone)]
struct Message {
    routing_key: String,
    envelope: Envelope,
}

#[derive(Debug)]
struct QueueState {
    declaration: QueueDeclaration,
    ready: VecDeque<Message>,
    in_flight: usize,
}

impl QueueState {
    fn accepts(&self, exchange: &str, routing_key: &str) -> bool {
        if exchange.is_empty() {
            return self.declaration.name == routing_key;
        }
        self.declaration
            .bindings
            .iter()
            .any(|(bound, pattern)| bound == exchange && topic_matches(pattern, routing_key))
    }
}

#[derive(Debug, Default)]
struct State {
    queues: BTreeMap<String, QueueState>,
    published: Vec<PublishedMessage>,
    failing_publishes: usize,
    closed: bool,
}

impl State {
    /// Copy `envelope` into every queue bound to `exchange` for `routing_key`.
    fn route(&mut self, exchange: &str, routing_key: &str, envelope: &Envelope) -> usize {
        let mut routed = 0;
        for queue in self.queues.values_mut() {
            if queue.accepts(exchange, routing_key) {
                queue.ready.push_back(Message {
                    routing_key: routing_key.to_string(),
                    envelope: envelope.clone(),
                });
                routed += 1;
            }
        }
        routed
    }
}

enum Take {
    Message(Message),
    Empty,
    Closed,
}

struct Shared {
    state: Mutex<State>,
    changed: Notify,
    dead_letters: DeadLetterQueue<Envelope>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, queue: &str) -> Take {
        let mut state = self.lock();
        let closed = state.closed;
        match state.queues.get_mut(queue) {
            Some(q) => match q.ready.pop_front() {
                Some(message) => {
                    q.in_flight += 1;
                    Take::Message(message)
                }
                None if closed => Take::Closed,
                None => Take::Empty,
            },
            None => Take::Closed,
        }
    }

    /// Release one in-flight delivery of `queue`, then apply `settle` under the same lock.
    fn settle(&self, queue: &str, settle: impl FnOnce(&mut State)) {
        let mut state = self.lock();
        if let Some(q) = state.queues.get_mut(queue) {
            q.in_flight = q.in_flight.saturating_sub(1);
        }
        settle(&mut state);
        drop(state);
        self.changed.notify_waiters();
    }
}

/// Thread-safe in-memory broker.
///
/// Clones share the same exchanges and queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                changed: Notify::new(),
                dead_letters: DeadLetterQueue::default(),
            }),
        }
    }

    /// Refuse to confirm the next `count` publishes.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared.lock().failing_publishes = count;
    }

    /// Messages waiting in `queue`, oldest first.
    #[must_use]
    pub fn messages(&self, queue: &str) -> Vec<Envelope> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.envelope.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages waiting in `queue`.
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries of `queue` handed out but not yet settled.
    #[must_use]
    pub fn in_flight(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, |q| q.in_flight)
    }

    /// Every confirmed publish, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.shared.lock().published.clone()
    }

    /// Messages dead-lettered from queues without a dead-letter exchange.
    #[must_use]
    pub fn dead_letters(&self) -> DeadLetterQueue<Envelope> {
        self.shared.dead_letters.clone()
    }

    /// Stop accepting publishes and end every subscription once its queue drains.
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.changed.notify_waiters();
    }

    /// Wait until `queue` has nothing ready and nothing in flight.
    pub async fn wait_idle(&self, queue: &str) {
        loop {
            let changed = self.shared.changed.notified();
            let idle = self
                .shared
                .lock()
                .queues
                .get(queue)
                .is_none_or(|q| q.ready.is_empty() && q.in_flight == 0);
            if idle {
                return;
            }
            changed.await;
        }
    }

    fn publish_now(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(BrokerError::ConnectionFailed("broker closed".to_string()));
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::NotConfirmed(exchange.to_string()));
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            envelope: envelope.clone(),
        });
        if state.route(exchange, routing_key, envelope) == 0 {
            tracing::debug!(exchange, routing_key, "Unroutable message dropped");
        }
        drop(state);
        self.shared.changed.notify_waiters();
        Ok(())
    }

    fn declare(&self, declaration: &QueueDeclaration) -> Result<(), BrokerError> {
        let mut state = self.shared.lock();
        match state.queues.get(&declaration.name) {
            Some(existing) if existing.declaration != *declaration => Err(BrokerError::Transport(format!(
                "PRECONDITION_FAILED: queue '{}' redeclared with different arguments",
                declaration.name
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(
                    declaration.name.clone(),
                    QueueState {
                        declaration: declaration.clone(),
                        ready: VecDeque::new(),
                        in_flight: 0,
                    },
                );
                Ok(())
            }
        }
    }

    fn open_stream(&self, queue: &str, options: SubscribeOptions) -> Result<DeliveryStream, BrokerError> {
        if !self.shared.lock().queues.contains_key(queue) {
            return Err(BrokerError::UnknownQueue(queue.to_string()));
        }

        let shared = Arc::clone(&self.shared);
        let queue = queue.to_string();
        let prefetch = Arc::new(Semaphore::new(usize::from(options.prefetch.max(1))));

        let stream = async_stream::stream! {
            loop {
                let Ok(permit) = Arc::clone(&prefetch).acquire_owned().await else {
                    break;
                };
                let next = loop {
                    let changed = shared.changed.notified();
                    match shared.take(&queue) {
                        Take::Message(message) => break Some(message),
                        Take::Closed => break None,
                        Take::Empty => changed.await,
                    }
                };
                let Some(message) = next else {
                    break;
                };

                let acker = MemoryAcker {
                    shared: Arc::clone(&shared),
                    queue: queue.clone(),
                    routing_key: message.routing_key,
                    envelope: message.envelope.clone(),
                    settled: AtomicBool::new(false),
                    _permit: permit,
                };
                yield Ok(Delivery::new(message.envelope, Box::new(acker)));
            }
        };
        Ok(Box::pin(stream))
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("InMemoryBroker")
            .field("queues", &state.queues.keys().collect::<Vec<_>>())
            .field("published", &state.published.len())
            .finish_non_exhaustive()
    }
}

impl MessageBroker for InMemoryBroker {
    fn declare_queue(&self, declaration: &QueueDeclaration) -> BrokerFuture<'_, ()> {
        let result = self.declare(declaration);
        Box::pin(async move { result })
    }

    fn publish(&self, exchange: &str, routing_key: &str, envelope: &Envelope) -> BrokerFuture<'_, ()> {
        let result = self.publish_now(exchange, routing_key, envelope);
        Box::pin(async move { result })
    }

    fn subscribe(&self, queue: &str, options: SubscribeOptions) -> BrokerFuture<'_, DeliveryStream> {
        let result = self.open_stream(queue, options);
        Box::pin(async move { result })
    }
}

/// Settles one in-memory delivery. Holding it holds a prefetch slot.
struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    routing_key: String,
    envelope: Envelope,
    settled: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn settle(&self, apply: impl FnOnce(&mut State)) {
        if !self.settled.swap(true, Ordering::SeqCst) {
            self.shared.settle(&self.queue, apply);
        }
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        let returned = Envelope::from_parts(
            self.envelope.delivery_id().to_string(),
            self.envelope.body().to_vec(),
            self.envelope.headers().clone(),
            true,
        );
        let routing_key = self.routing_key.clone();
        let queue = self.queue.clone();
        self.settle(|state| {
            if let Some(q) = state.queues.get_mut(&queue) {
                tracing::debug!(queue = %queue, "Unsettled delivery returned to queue");
                q.ready.push_front(Message {
                    routing_key,
                    envelope: returned,
                });
            }
        });
    }
}

impl Acker for MemoryAcker {
    fn ack(&self) -> BrokerFuture<'_, ()> {
        self.settle(|_| {});
        Box::pin(async { Ok(()) })
    }

    fn requeue(&self, next: Envelope) -> BrokerFuture<'_, ()> {
        self.settle(|state| {
            if let Some(q) = state.queues.get_mut(&self.queue) {
                q.ready.push_back(Message {
                    routing_key: self.routing_key.clone(),
                    envelope: next,
                });
            }
        });
        Box::pin(async { Ok(()) })
    }

    fn dead_letter(&self, reason: String) -> BrokerFuture<'_, ()> {
        let dead = self
            .envelope
            .clone()
            .with_header(DEAD_LETTER_REASON_HEADER, reason.clone());

        self.settle(|state| {
            let target = state.queues.get(&self.queue).and_then(|q| {
                q.declaration.dead_letter_exchange.clone().map(|exchange| {
                    let key = q
                        .declaration
                        .dead_letter_routing_key
                        .clone()
                        .unwrap_or_else(|| self.routing_key.clone());
                    (exchange, key)
                })
            });

            let routed = target.is_some_and(|(exchange, key)| state.route(&exchange, &key, &dead) > 0);
            if !routed {
                self.shared.dead_letters.push(dead.clone(), reason, dead.attempt());
            }
        });
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn envelope(body: &str) -> Envelope {
        Envelope::new(body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn topic_bindings_fan_out() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(&QueueDeclaration::new("analytics").bind("task_events", "task.*"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDeclaration::new("deletions").bind("task_events", "task.deleted"))
            .await
            .unwrap();

        broker.publish("task_events", "task.created", &envelope("a")).await.unwrap();
        broker.publish("task_events", "task.deleted", &envelope("b")).await.unwrap();
        broker.publish("task_events", "user.created", &envelope("c")).await.unwrap();

        assert_eq!(broker.queue_len("analytics"), 2);
        assert_eq!(broker.queue_len("deletions"), 1);
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test]
    async fn default_exchange_routes_by_queue_name() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDeclaration::new("jobs")).await.unwrap();
        broker.publish("", "jobs", &envelope("x")).await.unwrap();
        assert_eq!(broker.messages("jobs")[0].body(), b"x");
    }

    #[tokio::test]
    async fn redeclaring_with_different_arguments_fails() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDeclaration::new("jobs")).await.unwrap();
        broker.declare_queue(&QueueDeclaration::new("jobs")).await.unwrap();
        assert!(
            broker
                .declare_queue(&QueueDeclaration::new("jobs").dead_letter_to("dlx"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn subscribing_to_unknown_queue_fails() {
        let broker = InMemoryBroker::new();
        let result = broker.subscribe("missing", SubscribeOptions::default()).await;
        assert!(matches!(result, Err(BrokerError::UnknownQueue(_))));
    }

    #[tokio::test]
    async fn failing_publishes_are_not_confirmed() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1);
        assert!(matches!(
            broker.publish("ex", "k", &envelope("a")).await,
            Err(BrokerError::NotConfirmed(_))
        ));
        assert!(broker.publish("ex", "k", &envelope("a")).await.is_ok());
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn requeue_puts_next_attempt_back() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDeclaration::new("jobs")).await.unwrap();
        broker.publish("", "jobs", &envelope("x")).await.unwrap();

        let mut stream = broker.subscribe("jobs", SubscribeOptions::default()).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.in_flight("jobs"), 1);
        delivery.requeue().await.unwrap();

        let redelivered = stream.next().await.unwrap().unwrap();
        assert_eq!(redelivered.envelope().attempt(), 2);
        assert!(redelivered.envelope().is_redelivered());
        redelivered.ack().await.unwrap();

        broker.wait_idle("jobs").await;
        assert_eq!(broker.queue_len("jobs"), 0);
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDeclaration::new("jobs")).await.unwrap();
        broker.publish("", "jobs", &envelope("x")).await.unwrap();

        let mut stream = broker.subscribe("jobs", SubscribeOptions::default()).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        let delivery_id = delivery.envelope().delivery_id().to_string();
        drop(delivery);

        assert_eq!(broker.in_flight("jobs"), 0);
        assert_eq!(broker.queue_len("jobs"), 1);

        let again = stream.next().await.unwrap().unwrap();
        assert_eq!(again.envelope().delivery_id(), delivery_id);
        assert_eq!(again.envelope().attempt(), 1);
        assert!(again.envelope().is_redelivered());
        again.ack().await.unwrap();

        tokio::time::timeout(std::time::Duration::from_millis(500), broker.wait_idle("jobs"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn settled_delivery_is_not_returned_on_drop() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDeclaration::new("jobs")).await.unwrap();
        broker.publish("", "jobs", &envelope("x")).await.unwrap();

        let mut stream = broker.subscribe("jobs", SubscribeOptions::default()).await.unwrap();
        stream.next().await.unwrap().unwrap().ack().await.unwrap();

        assert_eq!(broker.queue_len("jobs"), 0);
        assert_eq!(broker.in_flight("jobs"), 0);
    }

    #[tokio::test]
    async fn dead_letter_routes_through_exchange() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(&QueueDeclaration::new("jobs").dead_letter_to("jobs.dlx"))
            .await
            .unwrap();
        broker
            .declare_queue(&QueueDeclaration::new("jobs.dlq").bind("jobs.dlx", "#"))
            .await
            .unwrap();
        broker.publish("", "jobs", &envelope("x")).await.unwrap();

        let mut stream = broker.subscribe("jobs", SubscribeOptions::default()).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.dead_letter("fatal failure").await.unwrap();

        let dead = broker.messages("jobs.dlq");
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].header(DEAD_LETTER_REASON_HEADER), Some("fatal failure"));
        assert!(broker.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn dead_letter_without_exchange_is_captured() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDeclaration::new("jobs")).await.unwrap();
        broker.publish("", "jobs", &envelope("x")).await.unwrap();

        let mut stream = broker.subscribe("jobs", SubscribeOptions::default()).await.unwrap();
        stream.next().await.unwrap().unwrap().dead_letter("bad").await.unwrap();

        let captured = broker.dead_letters().snapshot();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].reason, "bad");
        assert_eq!(captured[0].attempt, 1);
    }

    #[tokio::test]
    async fn close_ends_stream_after_drain() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDeclaration::new("jobs")).await.unwrap();
        broker.publish("", "jobs", &envelope("x")).await.unwrap();
        broker.close();

        let mut stream = broker.subscribe("jobs", SubscribeOptions::default()).await.unwrap();
        stream.next().await.unwrap().unwrap().ack().await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn prefetch_bounds_unsettled_deliveries() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueDeclaration::new("jobs")).await.unwrap();
        broker.publish("", "jobs", &envelope("a")).await.unwrap();
        broker.publish("", "jobs", &envelope("b")).await.unwrap();

        let mut stream = broker
            .subscribe("jobs", SubscribeOptions { prefetch: 1 })
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(std::time::Duration::from_millis(20), stream.next()).await;
        assert!(blocked.is_err());

        first.ack().await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.envelope().body(), b"b");
    }
}
