use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use notification_dispatch::{
    clients::{
        broker::{Broker, GroupMember},
        memory::{InMemoryBroker, MemoryBrokerSettings},
    },
    config::{BrokerKind, Config},
    models::{
        event::{EventType, NotificationChannel, NotificationEvent},
        message::RecordMetadata,
    },
    services::senders::ChannelSender,
};
use tokio::time::{Instant, sleep};

/// Small timeouts and a single partition so scenarios run in well under a second.
pub fn test_config() -> Config {
    Config {
        broker_kind: BrokerKind::Memory,
        topic_partitions: 1,
        dlq_partitions: 1,
        consumer_concurrency: 1,
        session_timeout_ms: 300,
        poll_interval_ms: 20,
        max_redeliveries: 0,
        max_retry_attempts: 2,
        initial_retry_delay_ms: 5,
        max_retry_delay_ms: 20,
        ..Config::default()
    }
}

pub fn partitioned_config(partitions: u32) -> Config {
    Config {
        topic_partitions: partitions,
        consumer_concurrency: partitions as usize,
        ..test_config()
    }
}

pub fn memory_broker(config: &Config) -> InMemoryBroker {
    let broker = InMemoryBroker::new(MemoryBrokerSettings::from_config(config));
    broker
        .create_topic(&config.notifications_topic, config.topic_partitions)
        .unwrap();
    broker
        .create_topic(&config.dlq_topic, config.dlq_partitions)
        .unwrap();
    broker
}

pub fn event(channel: NotificationChannel) -> NotificationEvent {
    NotificationEvent::new(
        EventType::OrderPlaced,
        "customer@example.com",
        "Order confirmed",
        "Your order #1042 has been placed",
        channel,
    )
    .unwrap()
}

pub fn event_for(channel: NotificationChannel, recipient: &str, message: &str) -> NotificationEvent {
    NotificationEvent::new(EventType::OrderShipped, recipient, "Update", message, channel).unwrap()
}

pub fn decode(payload: &[u8]) -> NotificationEvent {
    serde_json::from_slice(payload).unwrap()
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }

    condition()
}

/// Wraps the in-memory broker and refuses sends or subscriptions on selected topics.
pub struct FlakyBroker {
    pub inner: InMemoryBroker,
    failing_topics: Mutex<HashSet<String>>,
    failing_subscriptions: Mutex<HashSet<String>>,
    pub send_attempts: AtomicU32,
}

impl FlakyBroker {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            failing_topics: Mutex::new(HashSet::new()),
            failing_subscriptions: Mutex::new(HashSet::new()),
            send_attempts: AtomicU32::new(0),
        }
    }

    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics.lock().unwrap().insert(topic.to_string());
    }

    pub fn fail_subscribe(&self, topic: &str) {
        self.failing_subscriptions
            .lock()
            .unwrap()
            .insert(topic.to_string());
    }

    fn check(&self, topic: &str) -> Result<(), Error> {
        self.send_attempts.fetch_add(1, Ordering::SeqCst);

        if self.failing_topics.lock().unwrap().contains(topic) {
            return Err(anyhow!("Broker unavailable for {}", topic));
        }

        Ok(())
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<RecordMetadata, Error> {
        self.check(topic)?;
        self.inner.send(topic, key, payload).await
    }

    async fn send_to_partition(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: &[u8],
    ) -> Result<RecordMetadata, Error> {
        self.check(topic)?;
        self.inner.send_to_partition(topic, partition, key, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        concurrency: usize,
    ) -> Result<Vec<Box<dyn GroupMember>>, Error> {
        if self.failing_subscriptions.lock().unwrap().contains(topic) {
            return Err(anyhow!("Cannot subscribe to {}", topic));
        }

        self.inner.subscribe(topic, group_id, concurrency).await
    }

    async fn health_check(&self) -> Result<(), Error> {
        Err(anyhow!("Flaky broker is never healthy"))
    }
}

/// Remembers the event ids it was asked to send, in order.
pub struct RecordingSender {
    channel: NotificationChannel,
    delivered: bool,
    pub seen: Mutex<Vec<String>>,
}

impl RecordingSender {
    pub fn new(channel: NotificationChannel, delivered: bool) -> Arc<Self> {
        Arc::new(Self {
            channel,
            delivered,
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelSender for RecordingSender {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(&self, event: &NotificationEvent) -> bool {
        self.seen.lock().unwrap().push(event.event_id().to_string());
        self.delivered
    }
}

/// Panics on the first `panics` sends, then delivers.
pub struct PanickingSender {
    channel: NotificationChannel,
    panics: u32,
    pub calls: AtomicU32,
}

impl PanickingSender {
    pub fn new(channel: NotificationChannel, panics: u32) -> Arc<Self> {
        Arc::new(Self {
            channel,
            panics,
            calls: AtomicU32::new(0),
        })
    }

    pub fn always(channel: NotificationChannel) -> Arc<Self> {
        Self::new(channel, u32::MAX)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelSender for PanickingSender {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(&self, event: &NotificationEvent) -> bool {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.panics {
            panic!("sender blew up on {}", event.event_id());
        }
        true
    }
}
