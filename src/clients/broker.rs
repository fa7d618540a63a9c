use std::time::Duration;

use anyhow::{Error, Result};
use async_trait::async_trait;

use crate::models::message::{Record, RecordMetadata};

/// Client side of a partitioned publish/subscribe broker with consumer
/// groups. Implementations are shared between every producer caller and
/// consumer worker, so they must be safe to use concurrently.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short name used in logs and health output.
    fn name(&self) -> &'static str;

    /// Publishes `payload` to the partition selected by hashing `key`.
    /// Resolves once the broker has durably accepted the record.
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<RecordMetadata, Error>;

    /// Publishes `payload` to an explicit partition.
    async fn send_to_partition(
        &self,
        topic: &str,
        partition: u32,
        key: &str,
        payload: &[u8],
    ) -> Result<RecordMetadata, Error>;

    /// Joins `group_id` on `topic` with `concurrency` members. Each member
    /// owns a disjoint subset of the topic's partitions.
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
        concurrency: usize,
    ) -> Result<Vec<Box<dyn GroupMember>>, Error>;

    async fn health_check(&self) -> Result<(), Error>;
}

/// One worker's seat in a consumer group.
#[async_trait]
pub trait GroupMember: Send {
    fn member_id(&self) -> &str;

    /// Waits up to `max_wait` for the next record from an owned partition.
    /// Returns `Ok(None)` when nothing arrived in time. Dropping the returned
    /// future before it completes must not lose a record.
    async fn poll(&mut self, max_wait: Duration) -> Result<Option<Delivery>, Error>;

    /// Leaves the group, releasing owned partitions to the remaining members.
    /// Unacknowledged records become available to them again.
    async fn leave(self: Box<Self>) -> Result<(), Error>;
}

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), Error>;
}

/// A record together with the handle that commits it.
pub struct Delivery {
    pub record: Record,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(record: Record, acker: Box<dyn Acknowledger>) -> Self {
        Self { record, acker }
    }

    /// Commits the group's position past this record.
    pub async fn ack(&self) -> Result<(), Error> {
        self.acker.ack().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}
