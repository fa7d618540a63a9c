use std::{sync::Arc, time::Duration};

use anyhow::Result;
use notification_dispatch::{
    clients::{
        broker::{Broker, GroupMember},
        memory::InMemoryBroker,
    },
    config::Config,
    models::{event::NotificationChannel, stats::DispatchStats, status::EventStatus},
    services::{
        consumer::{NotificationConsumer, ProcessOutcome},
        dispatcher::NotificationDispatcher,
        producer::NotificationProducer,
        redelivery::{LocalRedeliveryTracker, RedeliveryTracker},
        senders::SenderConfig,
    },
};

use crate::common::{PanickingSender, RecordingSender, decode, event, memory_broker, test_config};

struct Harness {
    config: Config,
    broker: InMemoryBroker,
    producer: NotificationProducer,
    consumer: NotificationConsumer,
    tracker: Arc<LocalRedeliveryTracker>,
    stats: Arc<DispatchStats>,
}

impl Harness {
    fn new(config: Config, dispatcher: NotificationDispatcher) -> Self {
        let broker = memory_broker(&config);
        let stats = Arc::new(DispatchStats::default());
        let tracker = Arc::new(LocalRedeliveryTracker::new());
        let producer =
            NotificationProducer::new(Arc::new(broker.clone()), &config, Arc::clone(&stats));
        let consumer = NotificationConsumer::new(
            producer.clone(),
            Arc::new(dispatcher),
            tracker.clone(),
            Arc::clone(&stats),
            config.max_redeliveries,
        );

        Self {
            config,
            broker,
            producer,
            consumer,
            tracker,
            stats,
        }
    }

    async fn member(&self, topic: &str, group_id: &str) -> Result<Box<dyn GroupMember>> {
        Ok(self.broker.subscribe(topic, group_id, 1).await?.remove(0))
    }

    async fn primary_member(&self) -> Result<Box<dyn GroupMember>> {
        self.member(&self.config.notifications_topic, &self.config.consumer_group_id)
            .await
    }

    fn primary_committed(&self) -> Result<Vec<u64>> {
        self.broker
            .committed_offsets(&self.config.notifications_topic, &self.config.consumer_group_id)
    }

    fn dead_letters(&self) -> Result<usize> {
        Ok(self.broker.records(&self.config.dlq_topic)?.len())
    }
}

fn dispatcher(failure_probability: f64) -> NotificationDispatcher {
    NotificationDispatcher::with_simulated_senders(&SenderConfig::uniform(failure_probability))
}

/// Test: A delivered notification is acknowledged and never dead-lettered
#[tokio::test]
async fn test_successful_dispatch_is_acked() -> Result<()> {
    let harness = Harness::new(test_config(), dispatcher(0.0));
    harness.producer.publish(event(NotificationChannel::Push)).await??;

    let mut member = harness.primary_member().await?;
    let delivery = member.poll(Duration::from_millis(100)).await?.unwrap();

    let outcome = harness.consumer.handle_delivery(delivery).await;

    assert_eq!(outcome, ProcessOutcome::Sent);
    assert_eq!(harness.primary_committed()?, vec![1]);
    assert_eq!(harness.dead_letters()?, 0);
    assert_eq!(harness.stats.snapshot().sent, 1);

    Ok(())
}

/// Test: A failed send produces exactly one dead letter and is acknowledged
#[tokio::test]
async fn test_failed_dispatch_routes_to_dlq_once() -> Result<()> {
    let harness = Harness::new(test_config(), dispatcher(1.0));
    let original = event(NotificationChannel::Email);
    harness.producer.publish(original.clone()).await??;

    let mut member = harness.primary_member().await?;
    let delivery = member.poll(Duration::from_millis(100)).await?.unwrap();

    let outcome = harness.consumer.handle_delivery(delivery).await;

    assert_eq!(outcome, ProcessOutcome::DeadLettered);
    assert_eq!(harness.primary_committed()?, vec![1]);

    let dead_letters = harness.broker.records(&harness.config.dlq_topic)?;
    assert_eq!(dead_letters.len(), 1);
    assert_eq!(dead_letters[0].key, original.event_id());

    let parked = decode(&dead_letters[0].payload);
    assert_eq!(parked.event_id(), original.event_id());
    assert_eq!(parked.status(), EventStatus::Failed);

    assert!(
        member.poll(Duration::from_millis(50)).await?.is_none(),
        "A dead-lettered record must not come back"
    );

    let snapshot = harness.stats.snapshot();
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.dlq_routed, 1);
    assert_eq!(snapshot.success_rate, 0.0);

    Ok(())
}

/// Test: Malformed payloads are skipped without blocking the partition or reaching the DLQ
#[tokio::test]
async fn test_poison_record_is_skipped() -> Result<()> {
    let harness = Harness::new(test_config(), dispatcher(0.0));
    let topic = harness.config.notifications_topic.clone();

    harness.broker.send(&topic, "garbage", b"{not json").await?;
    harness.producer.publish(event(NotificationChannel::Sms)).await??;

    let mut member = harness.primary_member().await?;

    let poison = member.poll(Duration::from_millis(100)).await?.unwrap();
    assert_eq!(harness.consumer.handle_delivery(poison).await, ProcessOutcome::Poison);

    let valid = member.poll(Duration::from_millis(100)).await?.unwrap();
    assert_eq!(harness.consumer.handle_delivery(valid).await, ProcessOutcome::Sent);

    assert_eq!(harness.primary_committed()?, vec![2]);
    assert_eq!(harness.dead_letters()?, 0);
    assert_eq!(harness.stats.snapshot().poison, 1);

    Ok(())
}

/// Test: An unexpected failure leaves the record unacknowledged for redelivery
#[tokio::test]
async fn test_unexpected_failure_is_not_acked() -> Result<()> {
    let sender = PanickingSender::new(NotificationChannel::Webhook, 1);
    let harness = Harness::new(test_config(), NotificationDispatcher::new().register(sender.clone()));
    harness.producer.publish(event(NotificationChannel::Webhook)).await??;

    let mut member = harness.primary_member().await?;

    let first = member.poll(Duration::from_millis(100)).await?.unwrap();
    assert_eq!(harness.consumer.handle_delivery(first).await, ProcessOutcome::Redeliver);
    assert_eq!(harness.primary_committed()?, vec![0]);

    let second = member.poll(Duration::from_secs(2)).await?.unwrap();
    assert!(second.record.is_redelivery());
    assert_eq!(harness.consumer.handle_delivery(second).await, ProcessOutcome::Sent);

    assert_eq!(sender.calls(), 2);
    assert_eq!(harness.primary_committed()?, vec![1]);
    assert_eq!(harness.dead_letters()?, 0);

    let snapshot = harness.stats.snapshot();
    assert_eq!(snapshot.unexpected_errors, 1);
    assert_eq!(snapshot.redelivered, 1);
    assert_eq!(snapshot.sent, 1);

    Ok(())
}

/// Test: Repeated unexpected failures end on the dead letter topic once the cap is hit
#[tokio::test]
async fn test_redelivery_cap_routes_to_dlq() -> Result<()> {
    let config = Config {
        max_redeliveries: 2,
        ..test_config()
    };
    let sender = PanickingSender::always(NotificationChannel::Chat);
    let harness = Harness::new(config, NotificationDispatcher::new().register(sender.clone()));
    let original = event(NotificationChannel::Chat);
    harness.producer.publish(original.clone()).await??;

    let mut member = harness.primary_member().await?;
    let mut outcomes = Vec::new();

    for _ in 0..3 {
        let delivery = member.poll(Duration::from_secs(2)).await?.unwrap();
        outcomes.push(harness.consumer.handle_delivery(delivery).await);
    }

    assert_eq!(
        outcomes,
        vec![
            ProcessOutcome::Redeliver,
            ProcessOutcome::Redeliver,
            ProcessOutcome::DeadLettered
        ]
    );
    assert_eq!(harness.primary_committed()?, vec![1]);
    assert_eq!(harness.dead_letters()?, 1);

    // The count is cleared once the event reaches an outcome.
    assert_eq!(harness.tracker.record_failure(original.event_id()).await?, 1);

    Ok(())
}

/// Test: Without a cap the record keeps coming back
#[tokio::test]
async fn test_uncapped_failures_keep_redelivering() -> Result<()> {
    let sender = PanickingSender::always(NotificationChannel::Email);
    let harness = Harness::new(test_config(), NotificationDispatcher::new().register(sender.clone()));
    harness.producer.publish(event(NotificationChannel::Email)).await??;

    let mut member = harness.primary_member().await?;

    for attempt in 1..=4 {
        let delivery = member.poll(Duration::from_secs(2)).await?.unwrap();
        assert_eq!(delivery.record.delivery_count, attempt);
        assert_eq!(harness.consumer.handle_delivery(delivery).await, ProcessOutcome::Redeliver);
    }

    assert_eq!(harness.dead_letters()?, 0);
    assert_eq!(harness.primary_committed()?, vec![0]);

    Ok(())
}

/// Test: Dead letters are logged, counted and acknowledged, never re-dispatched
#[tokio::test]
async fn test_dead_letter_consumer_acks() -> Result<()> {
    let recorder = RecordingSender::new(NotificationChannel::Email, true);
    let harness = Harness::new(test_config(), NotificationDispatcher::new().register(recorder.clone()));

    let mut parked = event(NotificationChannel::Email);
    harness.producer.publish_to_dlq(&mut parked).await;
    harness
        .broker
        .send(&harness.config.dlq_topic, "broken", b"not json")
        .await?;

    let dlq_group = harness.config.dlq_group_id();
    let mut member = harness.member(&harness.config.dlq_topic, &dlq_group).await?;

    let first = member.poll(Duration::from_millis(100)).await?.unwrap();
    assert_eq!(
        harness.consumer.handle_dead_letter(first).await,
        ProcessOutcome::DeadLetterLogged
    );

    let second = member.poll(Duration::from_millis(100)).await?.unwrap();
    assert_eq!(harness.consumer.handle_dead_letter(second).await, ProcessOutcome::Poison);

    assert_eq!(
        harness
            .broker
            .committed_offsets(&harness.config.dlq_topic, &dlq_group)?,
        vec![2]
    );
    assert!(recorder.seen().is_empty(), "Dead letters must not be re-sent");
    assert_eq!(harness.stats.snapshot().dead_letters_seen, 1);

    Ok(())
}
