use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Running totals for the dispatch pipeline, shared by the producer and all
/// consumer workers.
#[derive(Debug, Default)]
pub struct DispatchStats {
    published: AtomicU64,
    publish_failed: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    dlq_routed: AtomicU64,
    dlq_publish_failed: AtomicU64,
    poison: AtomicU64,
    redelivered: AtomicU64,
    unexpected_errors: AtomicU64,
    dead_letters_seen: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub published: u64,
    pub publish_failed: u64,
    pub sent: u64,
    pub failed: u64,
    pub dlq_routed: u64,
    pub dlq_publish_failed: u64,
    pub poison: u64,
    pub redelivered: u64,
    pub unexpected_errors: u64,
    pub dead_letters_seen: u64,
    pub success_rate: f64,
}

impl DispatchStats {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish_failed(&self) {
        self.publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_routed(&self) {
        self.dlq_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dlq_publish_failed(&self) {
        self.dlq_publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poison(&self) {
        self.poison.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redelivered(&self) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unexpected_error(&self) {
        self.unexpected_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter_seen(&self) {
        self.dead_letters_seen.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let sent = self.sent.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);

        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            publish_failed: self.publish_failed.load(Ordering::Relaxed),
            sent,
            failed,
            dlq_routed: self.dlq_routed.load(Ordering::Relaxed),
            dlq_publish_failed: self.dlq_publish_failed.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            unexpected_errors: self.unexpected_errors.load(Ordering::Relaxed),
            dead_letters_seen: self.dead_letters_seen.load(Ordering::Relaxed),
            success_rate: success_rate(sent, failed),
        }
    }
}

fn success_rate(sent: u64, failed: u64) -> f64 {
    let total = sent + failed;
    if total == 0 {
        return 100.0;
    }

    sent as f64 / total as f64 * 100.0
}
