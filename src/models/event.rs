use std::{
    collections::HashMap,
    fmt::{Display, Formatter},
};

use anyhow::{Error, Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use uuid::Uuid;

use crate::models::status::EventStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    UserRegistered,
    PasswordReset,
    OrderPlaced,
    OrderShipped,
    PaymentReceived,
    AlertTriggered,
    SystemNotification,
    Custom,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationChannel {
    #[default]
    Email,
    Sms,
    Webhook,
    Push,
    #[serde(alias = "SLACK")]
    Chat,
}

impl NotificationChannel {
    pub const ALL: [NotificationChannel; 5] = [
        NotificationChannel::Email,
        NotificationChannel::Sms,
        NotificationChannel::Webhook,
        NotificationChannel::Push,
        NotificationChannel::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "EMAIL",
            NotificationChannel::Sms => "SMS",
            NotificationChannel::Webhook => "WEBHOOK",
            NotificationChannel::Push => "PUSH",
            NotificationChannel::Chat => "CHAT",
        }
    }
}

impl Display for NotificationChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Request handed to the producer by the inbound API layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequest {
    pub event_type: EventType,
    pub recipient: String,
    pub subject: String,
    pub message: String,

    #[serde(default)]
    pub channel: NotificationChannel,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NotificationRequest {
    pub fn new(
        event_type: EventType,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            recipient: recipient.into(),
            subject: subject.into(),
            message: message.into(),
            channel: NotificationChannel::default(),
            priority: Priority::default(),
            source: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_channel(mut self, channel: NotificationChannel) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A notification travelling through the broker.
///
/// `event_id` is assigned once at construction and doubles as the broker
/// message key, so every copy of the event (retries, dead letters) lands on
/// the same partition and can be traced across topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    event_id: String,
    pub event_type: EventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    pub recipient: String,
    pub subject: String,
    pub message: String,
    pub channel: NotificationChannel,

    #[serde(default, deserialize_with = "null_as_default")]
    pub priority: Priority,

    #[serde(default, deserialize_with = "null_as_default")]
    pub metadata: HashMap<String, serde_json::Value>,

    #[serde(deserialize_with = "utc_or_local_timestamp")]
    timestamp: DateTime<Utc>,

    #[serde(default, deserialize_with = "null_as_default")]
    status: EventStatus,
}

impl NotificationEvent {
    pub fn new(
        event_type: EventType,
        recipient: impl Into<String>,
        subject: impl Into<String>,
        message: impl Into<String>,
        channel: NotificationChannel,
    ) -> Result<Self, Error> {
        let recipient = require("recipient", recipient.into())?;
        let subject = require("subject", subject.into())?;
        let message = require("message", message.into())?;

        Ok(Self {
            event_id: Uuid::new_v4().to_string(),
            event_type,
            source: None,
            recipient,
            subject,
            message,
            channel,
            priority: Priority::default(),
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            status: EventStatus::Pending,
        })
    }

    pub fn from_request(request: NotificationRequest) -> Result<Self, Error> {
        let mut event = Self::new(
            request.event_type,
            request.recipient,
            request.subject,
            request.message,
            request.channel,
        )?
        .with_priority(request.priority)
        .with_metadata(request.metadata);

        event.source = request.source;

        Ok(event)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn status(&self) -> EventStatus {
        self.status
    }

    pub(crate) fn set_status(&mut self, status: EventStatus) {
        self.status = status;
    }
}

/// Producers that write explicit nulls mean "not set".
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// RFC 3339, or a local date-time without offset which is taken as UTC.
fn utc_or_local_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    raw.parse::<NaiveDateTime>()
        .or_else(|_| NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M"))
        .map(|naive| naive.and_utc())
        .map_err(|e| de::Error::custom(format!("invalid timestamp {:?}: {}", raw, e)))
}

fn require(field: &str, value: String) -> Result<String, Error> {
    if value.trim().is_empty() {
        return Err(anyhow!("{} is required", field));
    }

    Ok(value)
}
