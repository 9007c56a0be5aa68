// ── Engine counters ──

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters updated from the delivery paths.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    delivered_events: AtomicU64,
    delivered_batches: AtomicU64,
    suppressed_events: AtomicU64,
    dropped_events: AtomicU64,
    notifications_delivered: AtomicU64,
    notifications_read: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_batch(&self, events: usize) {
        self.delivered_batches.fetch_add(1, Ordering::Relaxed);
        self.delivered_events
            .fetch_add(events as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_suppressed(&self) {
        self.suppressed_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self, events: u64) {
        self.dropped_events.fetch_add(events, Ordering::Relaxed);
    }

    pub(crate) fn record_notification_delivered(&self) {
        self.notifications_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_notification_read(&self) {
        self.notifications_read.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered_events(&self) -> u64 {
        self.delivered_events.load(Ordering::Relaxed)
    }

    pub fn delivered_batches(&self) -> u64 {
        self.delivered_batches.load(Ordering::Relaxed)
    }

    pub fn suppressed_events(&self) -> u64 {
        self.suppressed_events.load(Ordering::Relaxed)
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Share of delivered notifications the recipient went on to read,
    /// as a percentage. Zero until something has been delivered.
    pub fn engagement_score(&self) -> f64 {
        let delivered = self.notifications_delivered.load(Ordering::Relaxed);
        if delivered == 0 {
            return 0.0;
        }
        let read = self.notifications_read.load(Ordering::Relaxed).min(delivered);
        #[allow(clippy::cast_precision_loss)]
        let score = read as f64 / delivered as f64 * 100.0;
        score
    }
}

/// Point-in-time view returned by `Engine::get_metrics`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub active_recipients: usize,
    pub buffered_events: usize,
    pub delivered_count: u64,
    pub reconnect_count: u64,
    pub engagement_score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engagement_is_read_share_of_delivered() {
        let m = EngineMetrics::new();
        assert!(m.engagement_score().abs() < f64::EPSILON);

        for _ in 0..4 {
            m.record_notification_delivered();
        }
        m.record_notification_read();
        assert!((m.engagement_score() - 25.0).abs() < 1e-9);
    }

    #[test]
    fn batches_accumulate_events() {
        let m = EngineMetrics::new();
        m.record_batch(3);
        m.record_batch(2);
        assert_eq!(m.delivered_events(), 5);
        assert_eq!(m.delivered_batches(), 2);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let snap = MetricsSnapshot {
            active_recipients: 1,
            buffered_events: 0,
            delivered_count: 9,
            reconnect_count: 2,
            engagement_score: 50.0,
        };
        let json = serde_json::to_value(&snap).unwrap_or_default();
        assert_eq!(json["deliveredCount"], 9);
        assert_eq!(json["reconnectCount"], 2);
    }
}
