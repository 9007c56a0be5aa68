// ── Engine tuning ──
//
// Every knob the engine reads at runtime. Core never touches disk:
// `fanout-config` (or a test) builds an `EngineConfig` and hands it in.

use std::time::Duration;

use fanout_api::FeedConfig;
use secrecy::SecretString;
use url::Url;

use crate::consensus::DEFAULT_SHIFT_THRESHOLD;
use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the global flush timer.
    pub batch_interval: Duration,
    /// Buffer length that triggers an immediate flush.
    pub max_batch_size: usize,
    /// Hard per-recipient cap; overflow drops the oldest entry.
    pub max_buffered_events: usize,
    /// Failed flushes tolerated before a recipient's buffer is dropped.
    pub max_flush_retries: u32,
    /// Capacity of each recipient's batch and notification channels.
    pub session_capacity: usize,
    /// How long a routed payload suppresses byte-identical repeats.
    pub dedup_ttl: Duration,
    /// Entries kept in the in-memory event log.
    pub event_log_capacity: usize,
    /// Minimum mean-confidence move, in points, that counts as a shift.
    pub shift_threshold: f64,
    /// Period of the notification expiry/retry sweep.
    pub sweep_interval: Duration,
    /// How long the sweep keeps a notification after its last status
    /// change, whatever its expiry.
    pub notification_retention: Duration,
    /// Upstream snapshot endpoint; snapshots are unavailable when unset.
    pub snapshot_url: Option<Url>,
    /// Bearer token for the snapshot endpoint.
    pub snapshot_token: Option<SecretString>,
    /// Bound on every upstream snapshot request.
    pub request_timeout: Duration,
    /// How long cached snapshot values live.
    pub snapshot_ttl: Duration,
    /// Time `shutdown` spends draining buffers before discarding them.
    pub shutdown_grace: Duration,
    /// Reconnect and heartbeat tuning for the upstream feed.
    pub feed: FeedConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_interval: Duration::from_millis(100),
            max_batch_size: 10,
            max_buffered_events: 1000,
            max_flush_retries: 3,
            session_capacity: 64,
            dedup_ttl: Duration::from_secs(60),
            event_log_capacity: 100,
            shift_threshold: DEFAULT_SHIFT_THRESHOLD,
            sweep_interval: Duration::from_secs(60),
            notification_retention: Duration::from_secs(24 * 60 * 60),
            snapshot_url: None,
            snapshot_token: None,
            request_timeout: Duration::from_secs(10),
            snapshot_ttl: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
            feed: FeedConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), CoreError> {
        let invalid = |message: &str| {
            Err(CoreError::Config {
                message: message.to_owned(),
            })
        };

        if self.batch_interval.is_zero() {
            return invalid("batch_interval must be greater than zero");
        }
        if self.sweep_interval.is_zero() {
            return invalid("sweep_interval must be greater than zero");
        }
        if self.notification_retention.is_zero() {
            return invalid("notification_retention must be greater than zero");
        }
        if self.max_batch_size == 0 {
            return invalid("max_batch_size must be at least 1");
        }
        if self.max_buffered_events < self.max_batch_size {
            return invalid("max_buffered_events must be at least max_batch_size");
        }
        if self.session_capacity == 0 {
            return invalid("session_capacity must be at least 1");
        }
        if !self.shift_threshold.is_finite() || self.shift_threshold < 0.0 {
            return invalid("shift_threshold must be a non-negative number");
        }
        if self.feed.heartbeat.missed_limit == 0 {
            return invalid("heartbeat missed_limit must be at least 1");
        }
        Ok(())
    }
}
