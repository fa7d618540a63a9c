use std::sync::Arc;

use anyhow::Error;
use tracing::{debug, error, info, warn};

use crate::{
    clients::broker::Delivery,
    models::{event::NotificationEvent, stats::DispatchStats, status::EventStatus},
    services::{
        dispatcher::NotificationDispatcher, producer::NotificationProducer,
        redelivery::RedeliveryTracker,
    },
};

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Dispatched successfully and acknowledged.
    Sent,
    /// Dispatch failed; parked on the dead letter topic and acknowledged.
    DeadLettered,
    /// Payload could not be decoded; acknowledged and dropped.
    Poison,
    /// Unexpected failure; left unacknowledged for broker redelivery.
    Redeliver,
    /// Dead letter logged and acknowledged.
    DeadLetterLogged,
}

pub struct NotificationConsumer {
    producer: NotificationProducer,
    dispatcher: Arc<NotificationDispatcher>,
    tracker: Arc<dyn RedeliveryTracker>,
    stats: Arc<DispatchStats>,
    max_redeliveries: u32,
}

impl NotificationConsumer {
    /// `max_redeliveries` bounds how often an event may fail unexpectedly
    /// before it is dead-lettered; 0 leaves it to broker redelivery alone.
    pub fn new(
        producer: NotificationProducer,
        dispatcher: Arc<NotificationDispatcher>,
        tracker: Arc<dyn RedeliveryTracker>,
        stats: Arc<DispatchStats>,
        max_redeliveries: u32,
    ) -> Self {
        Self {
            producer,
            dispatcher,
            tracker,
            stats,
            max_redeliveries,
        }
    }

    /// Handles one record from the notifications topic.
    pub async fn handle_delivery(&self, delivery: Delivery) -> ProcessOutcome {
        let record = &delivery.record;

        info!(
            partition = record.partition,
            offset = record.offset,
            delivery_count = record.delivery_count,
            "Received notification record"
        );

        let mut event = match serde_json::from_slice::<NotificationEvent>(&record.payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.record_poison();
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    key = %record.key,
                    error = %e,
                    payload = %String::from_utf8_lossy(&record.payload),
                    "Failed to deserialize record, skipping it"
                );
                self.acknowledge(&delivery).await;
                return ProcessOutcome::Poison;
            }
        };

        if record.is_redelivery() {
            self.stats.record_redelivered();
            event.set_status(EventStatus::Retrying);
            info!(
                event_id = event.event_id(),
                delivery_count = record.delivery_count,
                status = %event.status(),
                "Retrying redelivered notification"
            );
        }

        event.set_status(EventStatus::Processing);
        info!(
            event_id = event.event_id(),
            event_type = ?event.event_type,
            channel = %event.channel,
            "Processing notification"
        );

        match self.dispatcher.dispatch(&event).await {
            Ok(true) => {
                event.set_status(EventStatus::Sent);
                self.stats.record_sent();
                self.forget(&event).await;
                self.acknowledge(&delivery).await;
                info!(event_id = event.event_id(), "Notification processed successfully");
                ProcessOutcome::Sent
            }
            Ok(false) => {
                event.set_status(EventStatus::Failed);
                self.stats.record_failed();
                warn!(
                    event_id = event.event_id(),
                    "Notification dispatch failed, sending to dead letter topic"
                );
                self.dead_letter(&delivery, &mut event).await
            }
            Err(e) => self.handle_unexpected(&delivery, &mut event, e).await,
        }
    }

    /// Handles one record from the dead letter topic: log it for operators
    /// and move on.
    pub async fn handle_dead_letter(&self, delivery: Delivery) -> ProcessOutcome {
        let record = &delivery.record;

        let outcome = match serde_json::from_slice::<NotificationEvent>(&record.payload) {
            Ok(event) => {
                self.stats.record_dead_letter_seen();
                error!(
                    event_id = event.event_id(),
                    event_type = ?event.event_type,
                    recipient = %event.recipient,
                    status = %event.status(),
                    partition = record.partition,
                    "Dead letter"
                );
                ProcessOutcome::DeadLetterLogged
            }
            Err(e) => {
                self.stats.record_poison();
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to deserialize dead letter"
                );
                ProcessOutcome::Poison
            }
        };

        self.acknowledge(&delivery).await;
        outcome
    }

    async fn handle_unexpected(
        &self,
        delivery: &Delivery,
        event: &mut NotificationEvent,
        cause: Error,
    ) -> ProcessOutcome {
        self.stats.record_unexpected_error();

        if self.max_redeliveries == 0 {
            error!(
                event_id = event.event_id(),
                error = %cause,
                "Error processing notification, leaving it for redelivery"
            );
            return ProcessOutcome::Redeliver;
        }

        match self.tracker.record_failure(event.event_id()).await {
            Ok(failures) if failures > self.max_redeliveries => {
                error!(
                    event_id = event.event_id(),
                    failures,
                    max_redeliveries = self.max_redeliveries,
                    error = %cause,
                    "Redeliveries exhausted, sending to dead letter topic"
                );
                event.set_status(EventStatus::Failed);
                self.stats.record_failed();
                self.dead_letter(delivery, event).await
            }
            Ok(failures) => {
                error!(
                    event_id = event.event_id(),
                    failures,
                    max_redeliveries = self.max_redeliveries,
                    error = %cause,
                    "Error processing notification, leaving it for redelivery"
                );
                ProcessOutcome::Redeliver
            }
            Err(tracker_error) => {
                error!(
                    event_id = event.event_id(),
                    error = %cause,
                    tracker = self.tracker.name(),
                    tracker_error = %tracker_error,
                    "Error processing notification and redelivery count unavailable, leaving it for redelivery"
                );
                ProcessOutcome::Redeliver
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, event: &mut NotificationEvent) -> ProcessOutcome {
        self.producer.publish_to_dlq(event).await;
        self.forget(event).await;
        self.acknowledge(delivery).await;
        ProcessOutcome::DeadLettered
    }

    async fn forget(&self, event: &NotificationEvent) {
        if self.max_redeliveries == 0 {
            return;
        }

        if let Err(e) = self.tracker.clear(event.event_id()).await {
            debug!(event_id = event.event_id(), error = %e, "Failed to clear redelivery count");
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        if let Err(e) = delivery.ack().await {
            warn!(
                partition = delivery.record.partition,
                offset = delivery.record.offset,
                error = %e,
                "Failed to acknowledge record, it will be redelivered"
            );
        }
    }
}
