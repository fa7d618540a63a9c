use serde::{Deserialize, Serialize};

/// A record as handed out by a broker to a consumer group member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,

    /// How many times this record has been handed out, starting at 1.
    pub delivery_count: u32,
}

impl Record {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Where the broker placed a published record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}
