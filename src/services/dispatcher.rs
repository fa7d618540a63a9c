use std::{collections::HashMap, sync::Arc};

use anyhow::{Error, Result, anyhow};
use tracing::{debug, warn};

use crate::{
    models::event::{NotificationChannel, NotificationEvent},
    services::senders::{ChannelSender, SenderConfig, SimulatedSender},
};

/// Routes events to the sender registered for their channel.
#[derive(Clone, Default)]
pub struct NotificationDispatcher {
    senders: HashMap<NotificationChannel, Arc<dyn ChannelSender>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_simulated_senders(config: &SenderConfig) -> Self {
        NotificationChannel::ALL
            .into_iter()
            .fold(Self::new(), |dispatcher, channel| {
                dispatcher.register(Arc::new(SimulatedSender::new(
                    channel,
                    config.profile(channel),
                )))
            })
    }

    /// Registers `sender` for its channel, replacing any previous sender.
    pub fn register(mut self, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(sender.channel(), sender);
        self
    }

    /// Runs the channel send on its own task and waits for the outcome.
    ///
    /// `Ok(false)` is an ordinary delivery failure. `Err` means the send
    /// itself broke (no sender for the channel, or the task panicked or was
    /// cancelled) and nothing is known about whether the notification went out.
    pub async fn dispatch(&self, event: &NotificationEvent) -> Result<bool, Error> {
        let Some(sender) = self.senders.get(&event.channel).cloned() else {
            warn!(
                channel = %event.channel,
                event_id = event.event_id(),
                "No sender registered for channel"
            );
            return Err(anyhow!("No sender registered for channel {}", event.channel));
        };

        let channel = event.channel;
        let task_event = event.clone();
        let handle = tokio::spawn(async move { sender.send(&task_event).await });

        let delivered = handle
            .await
            .map_err(|e| anyhow!("{} sender task for {} failed: {}", channel, event.event_id(), e))?;

        debug!(
            channel = %channel,
            event_id = event.event_id(),
            delivered,
            "Dispatch finished"
        );

        Ok(delivered)
    }
}
