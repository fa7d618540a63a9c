use std::collections::HashMap;

use async_trait::async_trait;
use tokio::time::{Duration, sleep};
use tracing::{error, info, warn};

use crate::{
    models::event::{NotificationChannel, NotificationEvent},
    utils::truncate,
};

/// Delivers an event over one channel. `false` means the attempt failed and
/// the event should be treated as undeliverable for now.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    async fn send(&self, event: &NotificationEvent) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelProfile {
    pub failure_probability: f64,
    pub max_latency_ms: u64,
    pub preview_chars: usize,
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    profiles: HashMap<NotificationChannel, ChannelProfile>,
}

impl SenderConfig {
    pub fn profile(&self, channel: NotificationChannel) -> ChannelProfile {
        self.profiles
            .get(&channel)
            .copied()
            .unwrap_or_else(|| default_profile(channel))
    }

    pub fn with_failure_probability(mut self, channel: NotificationChannel, probability: f64) -> Self {
        let mut profile = self.profile(channel);
        profile.failure_probability = bounded_probability(probability);
        self.profiles.insert(channel, profile);
        self
    }

    pub fn with_max_latency_ms(mut self, channel: NotificationChannel, max_latency_ms: u64) -> Self {
        let mut profile = self.profile(channel);
        profile.max_latency_ms = max_latency_ms;
        self.profiles.insert(channel, profile);
        self
    }

    /// Same failure probability and no latency on every channel.
    pub fn uniform(failure_probability: f64) -> Self {
        NotificationChannel::ALL
            .into_iter()
            .fold(Self::default(), |config, channel| {
                config
                    .with_failure_probability(channel, failure_probability)
                    .with_max_latency_ms(channel, 0)
            })
    }
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            profiles: NotificationChannel::ALL
                .into_iter()
                .map(|channel| (channel, default_profile(channel)))
                .collect(),
        }
    }
}

fn default_profile(channel: NotificationChannel) -> ChannelProfile {
    let (failure_probability, max_latency_ms, preview_chars) = match channel {
        NotificationChannel::Email => (0.05, 100, 100),
        NotificationChannel::Sms => (0.05, 50, 160),
        NotificationChannel::Webhook => (0.10, 200, 200),
        NotificationChannel::Push => (0.0, 150, 100),
        NotificationChannel::Chat => (0.0, 100, 200),
    };

    ChannelProfile {
        failure_probability,
        max_latency_ms,
        preview_chars,
    }
}

/// Stand-in for a real provider: waits a random time up to the profile's
/// latency bound and fails with the profile's probability.
#[derive(Debug, Clone)]
pub struct SimulatedSender {
    channel: NotificationChannel,
    profile: ChannelProfile,
}

impl SimulatedSender {
    pub fn new(channel: NotificationChannel, mut profile: ChannelProfile) -> Self {
        let requested = profile.failure_probability;
        profile.failure_probability = bounded_probability(requested);

        if profile.failure_probability != requested {
            warn!(
                channel = %channel,
                requested,
                applied = profile.failure_probability,
                "Failure probability out of range, adjusted"
            );
        }

        Self { channel, profile }
    }
}

/// NaN never fails; anything else is clamped into 0.0..=1.0.
fn bounded_probability(probability: f64) -> f64 {
    if probability.is_nan() {
        0.0
    } else {
        probability.clamp(0.0, 1.0)
    }
}

#[async_trait]
impl ChannelSender for SimulatedSender {
    fn channel(&self) -> NotificationChannel {
        self.channel
    }

    async fn send(&self, event: &NotificationEvent) -> bool {
        info!(
            channel = %self.channel,
            event_id = event.event_id(),
            recipient = %event.recipient,
            subject = %event.subject,
            preview = %truncate(&event.message, self.profile.preview_chars),
            "Sending notification"
        );

        if self.profile.max_latency_ms > 0 {
            let latency = rand::random_range(0..=self.profile.max_latency_ms);
            sleep(Duration::from_millis(latency)).await;
        }

        let delivered = !rand::random_bool(self.profile.failure_probability);

        if delivered {
            info!(
                channel = %self.channel,
                event_id = event.event_id(),
                recipient = %event.recipient,
                "Notification sent"
            );
        } else {
            error!(
                channel = %self.channel,
                event_id = event.event_id(),
                recipient = %event.recipient,
                "Notification send failed"
            );
        }

        delivered
    }
}
