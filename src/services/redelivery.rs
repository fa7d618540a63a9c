use std::{
    collections::HashMap,
    sync::Mutex,
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;

/// Counts unexpected processing failures per event so a record that keeps
/// failing can be routed to the dead letter topic instead of looping on
/// broker redelivery forever.
#[async_trait]
pub trait RedeliveryTracker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Records one more failure for `event_id` and returns the running count.
    async fn record_failure(&self, event_id: &str) -> Result<u32, Error>;

    /// Forgets `event_id` once it reached a terminal outcome.
    async fn clear(&self, event_id: &str) -> Result<(), Error>;

    async fn health_check(&self) -> Result<(), Error>;
}

/// Process-local tracker. Only correct when every member of the consumer
/// group runs in this process.
#[derive(Debug, Default)]
pub struct LocalRedeliveryTracker {
    failures: Mutex<HashMap<String, u32>>,
}

impl LocalRedeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RedeliveryTracker for LocalRedeliveryTracker {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn record_failure(&self, event_id: &str) -> Result<u32, Error> {
        let mut failures = self
            .failures
            .lock()
            .map_err(|_| anyhow!("Redelivery tracker state is poisoned"))?;

        let count = failures.entry(event_id.to_string()).or_insert(0);
        *count += 1;

        Ok(*count)
    }

    async fn clear(&self, event_id: &str) -> Result<(), Error> {
        self.failures
            .lock()
            .map_err(|_| anyhow!("Redelivery tracker state is poisoned"))?
            .remove(event_id);

        Ok(())
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failures_accumulate_until_cleared() {
        let tracker = LocalRedeliveryTracker::new();

        assert_eq!(tracker.record_failure("evt-1").await.unwrap(), 1);
        assert_eq!(tracker.record_failure("evt-1").await.unwrap(), 2);
        assert_eq!(tracker.record_failure("evt-2").await.unwrap(), 1);

        tracker.clear("evt-1").await.unwrap();
        assert_eq!(tracker.record_failure("evt-1").await.unwrap(), 1);
    }
}
