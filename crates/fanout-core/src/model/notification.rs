// ── Notification types ──

use chrono::{DateTime, TimeDelta, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::ids::{NotificationId, RecipientId};
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationCategory {
    SubmissionConfirmation,
    DeadlineWarning,
    ResultAnnouncement,
    ConsensusShift,
    ConnectionFailure,
    System,
}

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

/// Where a notification can be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryChannel {
    /// Pushed over the recipient's live session; needs a connected link.
    LivePush,
    /// Stored for retrieval through `get_pending`.
    InApp,
}

/// Lifecycle status. Moves forward only: `Pending < Delivered < Read < Dismissed`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NotificationStatus {
    #[default]
    Pending,
    Delivered,
    Read,
    Dismissed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: NotificationStatus,
    pub at: DateTime<Utc>,
}

/// Per-channel delivery bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub delivered: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub recipient: RecipientId,
    pub category: NotificationCategory,
    pub severity: Severity,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    status: NotificationStatus,
    deliveries: IndexMap<DeliveryChannel, ChannelDelivery>,
    history: Vec<StatusChange>,
}

impl Notification {
    /// A pending notification targeting both channels, live push first.
    pub fn new(
        recipient: impl Into<RecipientId>,
        category: NotificationCategory,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let mut deliveries = IndexMap::new();
        deliveries.insert(DeliveryChannel::LivePush, ChannelDelivery::default());
        deliveries.insert(DeliveryChannel::InApp, ChannelDelivery::default());
        Self {
            id: NotificationId::new(),
            recipient: recipient.into(),
            category,
            severity: Severity::default(),
            title: title.into(),
            body: body.into(),
            created_at: now,
            expires_at: None,
            status: NotificationStatus::Pending,
            deliveries,
            history: vec![StatusChange {
                status: NotificationStatus::Pending,
                at: now,
            }],
        }
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Replace the target channels. Duplicates collapse; order is kept.
    #[must_use]
    pub fn with_channels(mut self, channels: impl IntoIterator<Item = DeliveryChannel>) -> Self {
        self.deliveries = channels
            .into_iter()
            .map(|c| (c, ChannelDelivery::default()))
            .collect();
        self
    }

    #[must_use]
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    #[must_use]
    pub fn expires_in(mut self, ttl: TimeDelta) -> Self {
        self.expires_at = Some(self.created_at + ttl);
        self
    }

    pub fn status(&self) -> NotificationStatus {
        self.status
    }

    /// Every status this notification has held, oldest first.
    pub fn history(&self) -> &[StatusChange] {
        &self.history
    }

    /// When the status last changed; creation for a fresh notification.
    pub fn last_changed_at(&self) -> DateTime<Utc> {
        self.history.last().map_or(self.created_at, |c| c.at)
    }

    pub fn channels(&self) -> impl Iterator<Item = DeliveryChannel> + '_ {
        self.deliveries.keys().copied()
    }

    pub fn delivery(&self, channel: DeliveryChannel) -> Option<&ChannelDelivery> {
        self.deliveries.get(&channel)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Channels that still owe a successful delivery.
    pub fn undelivered_channels(&self) -> Vec<DeliveryChannel> {
        self.deliveries
            .iter()
            .filter(|(_, d)| !d.delivered)
            .map(|(c, _)| *c)
            .collect()
    }

    pub(crate) fn record_attempt(&mut self, channel: DeliveryChannel, result: Result<(), String>) {
        let entry = self.deliveries.entry(channel).or_default();
        entry.attempts = entry.attempts.saturating_add(1);
        match result {
            Ok(()) => {
                entry.delivered = true;
                entry.last_error = None;
            }
            Err(reason) => entry.last_error = Some(reason),
        }
    }

    /// Move to `to`, recording the change. Returns `false` when already
    /// there; moving backwards is rejected.
    pub(crate) fn advance(
        &mut self,
        to: NotificationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        if to < self.status {
            return Err(CoreError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        if to == self.status {
            return Ok(false);
        }
        self.status = to;
        self.history.push(StatusChange { status: to, at });
        Ok(true)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> Notification {
        Notification::new("r1", NotificationCategory::System, "hello", "world")
    }

    #[test]
    fn new_notification_is_pending_on_both_channels() {
        let n = sample();
        assert_eq!(n.status(), NotificationStatus::Pending);
        assert_eq!(
            n.channels().collect::<Vec<_>>(),
            vec![DeliveryChannel::LivePush, DeliveryChannel::InApp]
        );
        assert_eq!(n.history().len(), 1);
    }

    #[test]
    fn status_only_moves_forward() {
        let mut n = sample();
        let now = Utc::now();
        assert!(n.advance(NotificationStatus::Delivered, now).unwrap());
        assert!(n.advance(NotificationStatus::Read, now).unwrap());
        assert!(!n.advance(NotificationStatus::Read, now).unwrap());
        assert!(matches!(
            n.advance(NotificationStatus::Delivered, now),
            Err(CoreError::InvalidTransition { .. })
        ));
        let statuses: Vec<_> = n.history().iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                NotificationStatus::Pending,
                NotificationStatus::Delivered,
                NotificationStatus::Read
            ]
        );
    }

    #[test]
    fn expiry_is_inclusive() {
        let n = sample().expires_in(TimeDelta::seconds(5));
        let at = n.expires_at.unwrap();
        assert!(!n.is_expired(at - TimeDelta::seconds(1)));
        assert!(n.is_expired(at));
    }

    #[test]
    fn attempts_track_per_channel() {
        let mut n = sample();
        n.record_attempt(DeliveryChannel::LivePush, Err("offline".into()));
        n.record_attempt(DeliveryChannel::InApp, Ok(()));
        assert_eq!(n.undelivered_channels(), vec![DeliveryChannel::LivePush]);
        let live = n.delivery(DeliveryChannel::LivePush).unwrap();
        assert_eq!(live.attempts, 1);
        assert_eq!(live.last_error.as_deref(), Some("offline"));
    }

    #[test]
    fn with_channels_collapses_duplicates() {
        let n = sample().with_channels([DeliveryChannel::InApp, DeliveryChannel::InApp]);
        assert_eq!(n.channels().count(), 1);
    }
}
