//! Integration tests for [`RedpandaBroker`] against a real Kafka container.
//!
//! Marked `#[ignore]`: they need Docker and take 15-60 seconds to start Kafka.
//!
//! ```bash
//! cargo test -p conduit-redpanda --test integration_tests -- --ignored
//! ```

#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use conduit_core::broker::{DEAD_LETTER_REASON_HEADER, MessageBroker, QueueDeclaration, SubscribeOptions};
use conduit_core::{CorrelationContext, Envelope};
use conduit_redpanda::RedpandaBroker;
use conduit_runtime::{MessageConsumer, Outcome, handler_fn};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::kafka::{KAFKA_PORT, Kafka};

async fn start_kafka() -> (ContainerAsync<Kafka>, String) {
    let kafka = Kafka::default()
        .with_env_var("KAFKA_AUTO_CREATE_TOPICS_ENABLE", "true")
        .start()
        .await
        .expect("Failed to start Kafka container");

    let host = kafka.get_host().await.expect("Failed to get host");
    let port = kafka
        .get_host_port_ipv4(KAFKA_PORT)
        .await
        .expect("Failed to get port");
    (kafka, format!("{host}:{port}"))
}

/// Publish warmup records until the topic exists and metadata has propagated.
async fn ensure_topic_exists(broker: &RedpandaBroker, topic: &str) {
    for attempt in 1..=60 {
        let warmup = Envelope::new(b"warmup".to_vec());
        if broker.publish(topic, "warmup", &warmup).await.is_ok() {
            tokio::time::sleep(Duration::from_secs(2)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(attempt != 60, "Failed to create topic {topic}");
    }
}

fn broker(brokers: &str) -> RedpandaBroker {
    RedpandaBroker::builder()
        .brokers(brokers)
        .auto_offset_reset("earliest")
        .build()
        .expect("Failed to create broker")
}

#[tokio::test]
#[ignore]
async fn publish_and_consume_preserves_envelope() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = broker(&brokers);
    ensure_topic_exists(&broker, "task_events").await;
    ensure_topic_exists(&broker, "audit").await;

    broker
        .declare_queue(&QueueDeclaration::new("audit").bind("task_events", "task.*"))
        .await
        .unwrap();
    let mut deliveries = broker.subscribe("audit", SubscribeOptions::default()).await.unwrap();

    let ctx = CorrelationContext::new_root();
    let sent = Envelope::new(b"{\"task_id\":1}".to_vec()).with_context(&ctx);
    broker.publish("task_events", "task.created", &sent).await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let delivery = deliveries.next().await.expect("Stream ended").expect("Delivery failed");
            if delivery.envelope().delivery_id() == sent.delivery_id() {
                return delivery;
            }
            // Warmup record
            delivery.ack().await.unwrap();
        }
    })
    .await
    .expect("Timeout waiting for delivery");

    assert_eq!(delivery.envelope().delivery_id(), sent.delivery_id());
    assert_eq!(delivery.envelope().context(), ctx);
    assert_eq!(delivery.envelope().body(), sent.body());
    delivery.ack().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn exhausted_redeliveries_land_on_dead_letter_topic() {
    let (_kafka, brokers) = start_kafka().await;
    let broker = Arc::new(broker(&brokers));
    for topic in ["task_events", "notifications", "task_events.dlx"] {
        ensure_topic_exists(&broker, topic).await;
    }

    broker
        .declare_queue(
            &QueueDeclaration::new("notifications")
                .bind("task_events", "task.*")
                .dead_letter_to("task_events.dlx"),
        )
        .await
        .unwrap();
    broker
        .declare_queue(&QueueDeclaration::new("notifications.dead").bind("task_events.dlx", "#"))
        .await
        .unwrap();
    let mut dead = broker
        .subscribe("notifications.dead", SubscribeOptions::default())
        .await
        .unwrap();

    let consumer = MessageConsumer::new(
        broker.clone(),
        "notifications",
        handler_fn(|_envelope| async { Ok(Outcome::RetryableFailure) }),
    )
    .with_max_redeliveries(1);
    let consumer_task = tokio::spawn(async move { consumer.run().await });

    let sent = Envelope::new(b"{}".to_vec());
    broker.publish("task_events", "task.created", &sent).await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let delivery = dead.next().await.expect("Stream ended").expect("Delivery failed");
            if delivery.envelope().delivery_id() == sent.delivery_id() {
                return delivery;
            }
            delivery.ack().await.unwrap();
        }
    })
    .await
    .expect("Timeout waiting for dead letter");

    assert_eq!(delivery.envelope().attempt(), 2);
    assert_eq!(
        delivery.envelope().header(DEAD_LETTER_REASON_HEADER),
        Some("redeliveries exhausted after attempt 2")
    );
    consumer_task.abort();
}
