use std::sync::Arc;

use anyhow::{Context, Error, Result};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{
    clients::broker::Broker,
    config::Config,
    models::{
        event::NotificationEvent, retry::RetryConfig, stats::DispatchStats, status::EventStatus,
    },
    utils::retry_with_backoff,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub event_id: String,
    pub topic: String,
    pub partition: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// Publishes notification events, falling back to the dead letter topic
/// when the primary topic cannot take them.
#[derive(Clone)]
pub struct NotificationProducer {
    broker: Arc<dyn Broker>,
    notifications_topic: String,
    dlq_topic: String,
    retry_config: RetryConfig,
    stats: Arc<DispatchStats>,
}

impl NotificationProducer {
    pub fn new(broker: Arc<dyn Broker>, config: &Config, stats: Arc<DispatchStats>) -> Self {
        Self {
            broker,
            notifications_topic: config.notifications_topic.clone(),
            dlq_topic: config.dlq_topic.clone(),
            retry_config: config.retry_config(),
            stats,
        }
    }

    /// Publishes in the background. Await the handle to learn the outcome;
    /// a failed publish has already been diverted to the dead letter topic
    /// by the time the handle resolves.
    pub fn publish(&self, event: NotificationEvent) -> JoinHandle<Result<PublishReceipt, Error>> {
        let producer = self.clone();
        tokio::spawn(async move { producer.publish_and_wait(event, None).await })
    }

    /// Like [`publish`](Self::publish) but pins the record to `partition`.
    pub fn publish_to_partition(
        &self,
        event: NotificationEvent,
        partition: u32,
    ) -> JoinHandle<Result<PublishReceipt, Error>> {
        let producer = self.clone();
        tokio::spawn(async move { producer.publish_and_wait(event, Some(partition)).await })
    }

    pub async fn publish_and_wait(
        &self,
        mut event: NotificationEvent,
        partition: Option<u32>,
    ) -> Result<PublishReceipt, Error> {
        let payload = serde_json::to_vec(&event)
            .with_context(|| format!("Failed to serialize event {}", event.event_id()))?;

        info!(
            event_id = event.event_id(),
            topic = %self.notifications_topic,
            channel = %event.channel,
            "Publishing notification event"
        );

        let sent = retry_with_backoff(&self.retry_config, || {
            let topic = self.notifications_topic.as_str();
            let key = event.event_id();
            let payload = payload.as_slice();

            async move {
                match partition {
                    Some(partition) => {
                        self.broker
                            .send_to_partition(topic, partition, key, payload)
                            .await
                    }
                    None => self.broker.send(topic, key, payload).await,
                }
            }
        })
        .await;

        match sent {
            Ok(metadata) => {
                self.stats.record_published();
                info!(
                    event_id = event.event_id(),
                    partition = metadata.partition,
                    offset = ?metadata.offset,
                    "Event published"
                );

                Ok(PublishReceipt {
                    event_id: event.event_id().to_string(),
                    topic: metadata.topic,
                    partition: metadata.partition,
                    offset: metadata.offset,
                })
            }
            Err(e) => {
                self.stats.record_publish_failed();
                error!(
                    event_id = event.event_id(),
                    error = %e,
                    "Failed to publish event, diverting to dead letter topic"
                );

                self.publish_to_dlq(&mut event).await;

                Err(e.context(format!(
                    "Failed to publish event {} to {}",
                    event.event_id(),
                    self.notifications_topic
                )))
            }
        }
    }

    /// Best effort: marks the event failed and parks it on the dead letter
    /// topic under its original id. A failure here is only logged.
    pub async fn publish_to_dlq(&self, event: &mut NotificationEvent) {
        event.set_status(EventStatus::Failed);

        let payload = match serde_json::to_vec(&*event) {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.record_dlq_publish_failed();
                error!(event_id = event.event_id(), error = %e, "Failed to serialize dead letter");
                return;
            }
        };

        let sent = retry_with_backoff(&self.retry_config, || {
            self.broker
                .send(&self.dlq_topic, event.event_id(), &payload)
        })
        .await;

        match sent {
            Ok(metadata) => {
                self.stats.record_dlq_routed();
                warn!(
                    event_id = event.event_id(),
                    topic = %self.dlq_topic,
                    partition = metadata.partition,
                    "Event moved to dead letter topic"
                );
            }
            Err(e) => {
                self.stats.record_dlq_publish_failed();
                error!(
                    event_id = event.event_id(),
                    error = %e,
                    "Failed to publish to dead letter topic, event is lost"
                );
            }
        }
    }
}
