use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// Lifecycle of a notification event as seen by one consumer.
///
/// The status is only ever mutated locally by the consumer handling a
/// delivery; it is not written back to the broker except when the event
/// is re-published to the dead letter topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    #[default]
    Pending,
    Processing,
    Sent,
    Delivered,
    Failed,
    Retrying,
}

impl EventStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Sent | EventStatus::Delivered)
    }
}

impl Display for EventStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            EventStatus::Pending => write!(f, "PENDING"),
            EventStatus::Processing => write!(f, "PROCESSING"),
            EventStatus::Sent => write!(f, "SENT"),
            EventStatus::Delivered => write!(f, "DELIVERED"),
            EventStatus::Failed => write!(f, "FAILED"),
            EventStatus::Retrying => write!(f, "RETRYING"),
        }
    }
}
