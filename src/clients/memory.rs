use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tokio::{
    sync::Notify,
    time::{Instant, timeout_at},
};
use tracing::{debug, info, warn};

use crate::{
    clients::broker::{Acknowledger, Broker, Delivery, GroupMember},
    config::Config,
    models::message::{Record, RecordMetadata},
    utils::partition_for_key,
};

#[derive(Debug, Clone)]
pub struct MemoryBrokerSettings {
    /// Partition count for topics created implicitly by a send or subscribe.
    pub default_partitions: u32,
    /// A member that has not polled for this long is evicted from its group.
    pub session_timeout: Duration,
    /// How long a handed-out record stays invisible before it is handed out again.
    pub visibility_timeout: Duration,
}

impl MemoryBrokerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_partitions: config.topic_partitions,
            session_timeout: Duration::from_millis(config.session_timeout_ms),
            visibility_timeout: Duration::from_millis(config.session_timeout_ms),
        }
    }
}

impl Default for MemoryBrokerSettings {
    fn default() -> Self {
        Self {
            default_partitions: 3,
            session_timeout: Duration::from_secs(30),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

type GroupKey = (String, String);

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<GroupKey, GroupState>,
    next_member: u64,
}

struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions).map(|_| Vec::new()).collect(),
        }
    }
}

struct StoredRecord {
    key: String,
    payload: Vec<u8>,
}

struct GroupState {
    cursors: Vec<PartitionCursor>,
    members: HashMap<String, Instant>,
}

#[derive(Default)]
struct PartitionCursor {
    committed: u64,
    owner: Option<String>,
    in_flight_until: Option<Instant>,
    /// Hand-outs of the record at `committed`.
    deliveries: u32,
}

impl GroupState {
    fn new(partitions: usize) -> Self {
        Self {
            cursors: (0..partitions).map(|_| PartitionCursor::default()).collect(),
            members: HashMap::new(),
        }
    }

    fn owns(&self, member_id: &str) -> usize {
        self.cursors
            .iter()
            .filter(|cursor| cursor.owner.as_deref() == Some(member_id))
            .count()
    }

    fn release(&mut self, member_id: &str) -> usize {
        let mut released = 0;
        for cursor in &mut self.cursors {
            if cursor.owner.as_deref() == Some(member_id) {
                cursor.owner = None;
                cursor.in_flight_until = None;
                released += 1;
            }
        }
        released
    }

    fn evict_expired(&mut self, current: &str, now: Instant, session_timeout: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .members
            .iter()
            .filter(|(id, last_seen)| {
                id.as_str() != current && now.duration_since(**last_seen) >= session_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            self.members.remove(id);
            self.release(id);
        }

        expired
    }

    /// Sticky assignment: a member takes unowned partitions up to its fair
    /// share, never revoking partitions from a live member.
    fn claim(&mut self, member_id: &str) {
        let share = self.cursors.len().div_ceil(self.members.len().max(1));
        let mut owned = self.owns(member_id);

        for cursor in &mut self.cursors {
            if owned >= share {
                break;
            }
            if cursor.owner.is_none() {
                cursor.owner = Some(member_id.to_string());
                owned += 1;
            }
        }
    }

    fn next_expiry(&self, current: &str, session_timeout: Duration) -> Option<Instant> {
        self.members
            .iter()
            .filter(|(id, _)| id.as_str() != current && self.owns(id) > 0)
            .map(|(_, last_seen)| *last_seen + session_timeout)
            .min()
    }
}

fn lock(state: &Mutex<BrokerState>) -> Result<MutexGuard<'_, BrokerState>, Error> {
    state
        .lock()
        .map_err(|_| anyhow!("In-memory broker state is poisoned"))
}

/// Partitioned append-only log with consumer groups, kept in process memory.
///
/// Groups start from the earliest offset. Each partition hands out one
/// record at a time: the record at the committed offset stays in flight
/// until it is acknowledged or its visibility timeout lapses, which keeps
/// per-partition delivery in publish order.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    settings: MemoryBrokerSettings,
}

impl InMemoryBroker {
    pub fn new(settings: MemoryBrokerSettings) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            notify: Arc::new(Notify::new()),
            settings,
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), Error> {
        if partitions == 0 {
            return Err(anyhow!("Topic {} needs at least one partition", topic));
        }

        let mut state = lock(&self.state)?;
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(partitions));

        Ok(())
    }

    pub fn partition_count(&self, topic: &str) -> Result<Option<u32>, Error> {
        let state = lock(&self.state)?;
        Ok(state
            .topics
            .get(topic)
            .map(|log| log.partitions.len() as u32))
    }

    /// Every record stored on `topic`, ordered by partition then offset.
    pub fn records(&self, topic: &str) -> Result<Vec<Record>, Error> {
        let state = lock(&self.state)?;
        let Some(log) = state.topics.get(topic) else {
            return Ok(Vec::new());
        };

        let records = log
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, stored)| {
                stored.iter().enumerate().map(move |(offset, record)| Record {
                    topic: topic.to_string(),
                    partition: partition as u32,
                    offset: offset as u64,
                    key: record.key.clone(),
                    payload: record.payload.clone(),
                    delivery_count: 0,
                })
            })
            .collect();

        Ok(records)
    }

    pub fn committed_offsets(&self, topic: &str, group_id: &str) -> Result<Vec<u64>, Error> {
        let state = lock(&self.state)?;
        let key = (topic.to_string(), group_id.to_string());

        Ok(state
            .groups
            .get(&key)
            .map(|group| group.cursors.iter().map(|cursor| cursor.committed).collect())
            .unwrap_or_default())
    }

    pub fn live_members(&self, topic: &str, group_id: &str) -> Result<usize, Error> {
        let state = lock(&self.state)?;
        let key = (topic.to_string(), group_id.to_string());

        Ok(state
            .groups
            .get(&key)
            .map(|group| group.members.len())
            .unwrap_or(0))
    }

    fn append(
        &self,
        topic: &str,
        partition: Option<u32>,
        key: &str,
        payload: &[u8],
    ) -> Result<RecordMetadata, Error> {
        let metadata = {
            let mut state = lock(&self.state)?;
            let default_partitions = self.settings.default_partitions.max(1);
            let log = state
                .topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicLog::new(default_partitions));

            let partitions = log.partitions.len() as u32;
            let partition = partition.unwrap_or_else(|| partition_for_key(key, partitions));
            let records = log.partitions.get_mut(partition as usize).ok_or_else(|| {
                anyhow!(
                    "Partition {} does not exist on topic {} ({} partitions)",
                    partition,
                    topic,
                    partitions
                )
            })?;

            records.push(StoredRecord {
                key: key.to_string(),
                payload: payload.to_vec(),
            });

            RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset: Some(records.len() as u64 - 1),
            }
        };

        self.notify.notify_waiters();

        Ok(metadata)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(MemoryBrokerSettings::default())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<RecordMetadata, Error> {
        self.append(topic, None, key, payload)
    }

    async fn send_to_partition(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: &[u8],
    ) -> Result<RecordMetadata, Error> {
        self.append(topic, Some(partition), key, payload)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        concurrency: usize,
    ) -> Result<Vec<Box<dyn GroupMember>>, Error> {
        let mut state = lock(&self.state)?;
        let default_partitions = self.settings.default_partitions.max(1);
        let partitions = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicLog::new(default_partitions))
            .partitions
            .len();

        let group_key = (topic.to_string(), group_id.to_string());
        let now = Instant::now();
        let mut members: Vec<Box<dyn GroupMember>> = Vec::with_capacity(concurrency);

        for _ in 0..concurrency {
            state.next_member += 1;
            let member_id = format!("{}-{}", group_id, state.next_member);

            state
                .groups
                .entry(group_key.clone())
                .or_insert_with(|| GroupState::new(partitions))
                .members
                .insert(member_id.clone(), now);

            members.push(Box::new(MemoryMember {
                state: Arc::clone(&self.state),
                notify: Arc::clone(&self.notify),
                settings: self.settings.clone(),
                topic: topic.to_string(),
                group_key: group_key.clone(),
                member_id,
                next_partition: 0,
            }));
        }

        info!(topic, group_id, concurrency, partitions, "Joined in-memory consumer group");

        Ok(members)
    }

    async fn health_check(&self) -> Result<(), Error> {
        lock(&self.state).map(|_| ())
    }
}

enum Attempt {
    Taken(Delivery),
    Idle(Option<Instant>),
}

struct MemoryMember {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    settings: MemoryBrokerSettings,
    topic: String,
    group_key: GroupKey,
    member_id: String,
    next_partition: usize,
}

impl MemoryMember {
    fn try_take(&mut self) -> Result<Attempt, Error> {
        let now = Instant::now();
        let mut guard = lock(&self.state)?;
        let BrokerState { topics, groups, .. } = &mut *guard;

        let log = topics
            .get(&self.topic)
            .ok_or_else(|| anyhow!("Topic {} no longer exists", self.topic))?;
        let group = groups
            .get_mut(&self.group_key)
            .ok_or_else(|| anyhow!("Consumer group {} no longer exists", self.group_key.1))?;

        if group.members.insert(self.member_id.clone(), now).is_none() {
            info!(member_id = %self.member_id, topic = %self.topic, "Rejoined consumer group");
        }

        for evicted in group.evict_expired(&self.member_id, now, self.settings.session_timeout) {
            warn!(
                member_id = %evicted,
                group_id = %self.group_key.1,
                topic = %self.topic,
                "Evicted consumer group member after session timeout"
            );
        }

        group.claim(&self.member_id);

        let mut wake_at = group.next_expiry(&self.member_id, self.settings.session_timeout);
        let partitions = group.cursors.len();

        for step in 0..partitions {
            let index = (self.next_partition + step) % partitions;
            let cursor = &mut group.cursors[index];

            if cursor.owner.as_deref() != Some(self.member_id.as_str()) {
                continue;
            }

            if let Some(until) = cursor.in_flight_until {
                if until > now {
                    wake_at = Some(wake_at.map_or(until, |at| at.min(until)));
                    continue;
                }
            }

            let Some(stored) = log
                .partitions
                .get(index)
                .and_then(|records| records.get(cursor.committed as usize))
            else {
                continue;
            };

            cursor.deliveries += 1;
            cursor.in_flight_until = Some(now + self.settings.visibility_timeout);
            self.next_partition = index + 1;

            let record = Record {
                topic: self.topic.clone(),
                partition: index as u32,
                offset: cursor.committed,
                key: stored.key.clone(),
                payload: stored.payload.clone(),
                delivery_count: cursor.deliveries,
            };

            let acker = MemoryAcker {
                state: Arc::clone(&self.state),
                notify: Arc::clone(&self.notify),
                group_key: self.group_key.clone(),
                member_id: self.member_id.clone(),
                partition: index,
                offset: cursor.committed,
            };

            return Ok(Attempt::Taken(Delivery::new(record, Box::new(acker))));
        }

        Ok(Attempt::Idle(wake_at))
    }
}

#[async_trait]
impl GroupMember for MemoryMember {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    async fn poll(&mut self, max_wait: Duration) -> Result<Option<Delivery>, Error> {
        let deadline = Instant::now() + max_wait;

        loop {
            let notify = Arc::clone(&self.notify);
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = match self.try_take()? {
                Attempt::Taken(delivery) => {
                    debug!(
                        member_id = %self.member_id,
                        partition = delivery.record.partition,
                        offset = delivery.record.offset,
                        delivery_count = delivery.record.delivery_count,
                        "Handed out record"
                    );
                    return Ok(Some(delivery));
                }
                Attempt::Idle(wake_at) => wake_at,
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = wake_at.map_or(deadline, |at| at.min(deadline));
            let _ = timeout_at(wake_at, notified).await;
        }
    }

    async fn leave(self: Box<Self>) -> Result<(), Error> {
        let released = {
            let mut state = lock(&self.state)?;
            match state.groups.get_mut(&self.group_key) {
                Some(group) => {
                    group.members.remove(&self.member_id);
                    group.release(&self.member_id)
                }
                None => 0,
            }
        };

        self.notify.notify_waiters();

        info!(
            member_id = %self.member_id,
            topic = %self.topic,
            released,
            "Left consumer group"
        );

        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    notify: Arc<Notify>,
    group_key: GroupKey,
    member_id: String,
    partition: usize,
    offset: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<(), Error> {
        {
            let mut state = lock(&self.state)?;
            let cursor = state
                .groups
                .get_mut(&self.group_key)
                .and_then(|group| group.cursors.get_mut(self.partition))
                .ok_or_else(|| anyhow!("Partition {} is not tracked by this group", self.partition))?;

            if self.offset < cursor.committed {
                return Ok(());
            }

            if cursor.owner.as_deref() != Some(self.member_id.as_str()) {
                return Err(anyhow!(
                    "Member {} no longer owns partition {}",
                    self.member_id,
                    self.partition
                ));
            }

            if self.offset != cursor.committed || cursor.in_flight_until.is_none() {
                return Err(anyhow!(
                    "Offset {} on partition {} is not in flight",
                    self.offset,
                    self.partition
                ));
            }

            cursor.committed += 1;
            cursor.in_flight_until = None;
            cursor.deliveries = 0;
        }

        self.notify.notify_waiters();

        Ok(())
    }
}
