// ── Notification delivery pipeline ──
//
// Stores notifications per id, attempts each requested channel on its
// own, and keeps retrying channels that need a live session until the
// notification is delivered, dismissed or expired. The sweep also drops
// anything untouched for longer than the retention window, so the store
// stays bounded for notifications without an expiry.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::CoreError;
use crate::metrics::EngineMetrics;
use crate::model::{DeliveryChannel, Notification, NotificationId, NotificationStatus, RecipientId};
use crate::session::SessionTable;

/// A delivery mechanism for notifications.
///
/// Implementations must not block: the pipeline calls `deliver` while
/// holding the notification's entry.
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> DeliveryChannel;

    /// Channels that need an open recipient session are skipped, not
    /// failed, while the recipient is offline.
    fn requires_live_connection(&self) -> bool {
        false
    }

    fn deliver(&self, notification: &Notification) -> Result<(), CoreError>;
}

/// Pushes over the recipient's notification session.
pub struct LivePushChannel {
    sessions: Arc<SessionTable>,
}

impl LivePushChannel {
    pub fn new(sessions: Arc<SessionTable>) -> Self {
        Self { sessions }
    }
}

impl NotificationChannel for LivePushChannel {
    fn kind(&self) -> DeliveryChannel {
        DeliveryChannel::LivePush
    }

    fn requires_live_connection(&self) -> bool {
        true
    }

    fn deliver(&self, notification: &Notification) -> Result<(), CoreError> {
        let recipient = &notification.recipient;
        let tx = self
            .sessions
            .notification_sender(recipient)
            .ok_or(CoreError::Disconnected)?;
        tx.try_send(Arc::new(notification.clone()))
            .map_err(|e| CoreError::Delivery {
                recipient: recipient.clone(),
                reason: match e {
                    TrySendError::Full(_) => "notification channel full".into(),
                    TrySendError::Closed(_) => "notification channel closed".into(),
                },
            })
    }
}

/// In-app inbox. The pipeline's store is the inbox, so delivery only
/// marks the notification as available to `get_pending`.
#[derive(Debug, Default)]
pub struct InAppChannel;

impl NotificationChannel for InAppChannel {
    fn kind(&self) -> DeliveryChannel {
        DeliveryChannel::InApp
    }

    fn deliver(&self, notification: &Notification) -> Result<(), CoreError> {
        trace!(notification = %notification.id, "stored in inbox");
        Ok(())
    }
}

#[derive(Debug)]
struct Stored {
    seq: u64,
    notification: Notification,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    /// Dropped for outliving the retention window.
    pub retired: usize,
    pub retried: usize,
}

pub struct NotificationPipeline {
    store: DashMap<NotificationId, Stored>,
    /// Ids per recipient, in insertion order.
    inbox: DashMap<RecipientId, Vec<NotificationId>>,
    retention: TimeDelta,
    channels: HashMap<DeliveryChannel, Arc<dyn NotificationChannel>>,
    sessions: Arc<SessionTable>,
    metrics: Arc<EngineMetrics>,
    next_seq: AtomicU64,
}

impl NotificationPipeline {
    /// Pipeline with the built-in live-push and in-app channels.
    pub fn new(sessions: Arc<SessionTable>, metrics: Arc<EngineMetrics>) -> Self {
        let mut pipeline = Self {
            store: DashMap::new(),
            inbox: DashMap::new(),
            retention: TimeDelta::hours(24),
            channels: HashMap::new(),
            sessions: Arc::clone(&sessions),
            metrics,
            next_seq: AtomicU64::new(0),
        };
        pipeline.register_channel(Arc::new(LivePushChannel::new(sessions)));
        pipeline.register_channel(Arc::new(InAppChannel));
        pipeline
    }

    /// Keep notifications at most `retention` past their last status change.
    #[must_use]
    pub fn with_retention(mut self, retention: TimeDelta) -> Self {
        self.retention = retention;
        self
    }

    /// Install or replace the channel for its `kind()`.
    pub fn register_channel(&mut self, channel: Arc<dyn NotificationChannel>) {
        self.channels.insert(channel.kind(), channel);
    }

    /// Store `notification` and attempt every requested channel.
    pub fn notify(&self, notification: Notification) -> Result<NotificationId, CoreError> {
        if notification.title.trim().is_empty() {
            return Err(CoreError::validation("notification title must not be empty"));
        }
        if notification.channels().next().is_none() {
            return Err(CoreError::validation("notification must request at least one channel"));
        }
        if notification.is_expired(Utc::now()) {
            return Err(CoreError::validation("notification is already expired"));
        }

        let id = notification.id;
        let recipient = notification.recipient.clone();
        debug!(
            notification = %id,
            recipient = %notification.recipient,
            category = %notification.category,
            "notification queued"
        );
        self.store.insert(
            id,
            Stored {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                notification,
            },
        );
        self.inbox.entry(recipient).or_default().push(id);
        self.attempt(id, Utc::now());
        Ok(id)
    }

    /// Try every channel still owing a delivery. Returns whether any
    /// channel was attempted.
    fn attempt(&self, id: NotificationId, now: DateTime<Utc>) -> bool {
        let Some(mut stored) = self.store.get_mut(&id) else {
            return false;
        };
        let n = &mut stored.notification;
        if n.status() == NotificationStatus::Dismissed || n.is_expired(now) {
            return false;
        }

        let mut attempted = false;
        for kind in n.undelivered_channels() {
            let Some(channel) = self.channels.get(&kind) else {
                n.record_attempt(kind, Err(format!("no {kind} channel registered")));
                continue;
            };
            if channel.requires_live_connection() && !self.sessions.is_connected(&n.recipient) {
                trace!(notification = %id, channel = %kind, "recipient offline, deferring");
                continue;
            }
            attempted = true;
            let result = channel.deliver(n).map_err(|e| e.to_string());
            if let Err(ref reason) = result {
                debug!(notification = %id, channel = %kind, reason = %reason, "delivery attempt failed");
            }
            n.record_attempt(kind, result);
        }

        let any_delivered = n.channels().any(|c| n.delivery(c).is_some_and(|d| d.delivered));
        if any_delivered && n.status() == NotificationStatus::Pending {
            // Pending -> Delivered is always forward.
            if let Ok(true) = n.advance(NotificationStatus::Delivered, now) {
                self.metrics.record_notification_delivered();
            }
        }
        attempted
    }

    /// Unexpired notifications for `recipient` still awaiting action
    /// (pending or delivered), oldest first.
    pub fn get_pending(&self, recipient: &RecipientId) -> Vec<Notification> {
        let now = Utc::now();
        let mut pending: Vec<(u64, Notification)> = self
            .ids_for(recipient)
            .into_iter()
            .filter_map(|id| {
                let stored = self.store.get(&id)?;
                let n = &stored.notification;
                (n.status() <= NotificationStatus::Delivered && !n.is_expired(now))
                    .then(|| (stored.seq, n.clone()))
            })
            .collect();
        pending.sort_by_key(|(seq, _)| *seq);
        pending.into_iter().map(|(_, n)| n).collect()
    }

    /// Snapshot of the recipient's ids. The inbox lock is released before
    /// the store is touched.
    fn ids_for(&self, recipient: &RecipientId) -> Vec<NotificationId> {
        self.inbox.get(recipient).map(|ids| ids.clone()).unwrap_or_default()
    }

    pub fn get(&self, id: NotificationId) -> Option<Notification> {
        self.store.get(&id).map(|e| e.value().notification.clone())
    }

    pub fn mark_read(&self, id: NotificationId) -> Result<(), CoreError> {
        let changed = self.transition(id, NotificationStatus::Read)?;
        if changed {
            self.metrics.record_notification_read();
        }
        Ok(())
    }

    pub fn dismiss(&self, id: NotificationId) -> Result<(), CoreError> {
        self.transition(id, NotificationStatus::Dismissed).map(|_| ())
    }

    fn transition(&self, id: NotificationId, to: NotificationStatus) -> Result<bool, CoreError> {
        let mut stored = self
            .store
            .get_mut(&id)
            .ok_or_else(|| CoreError::not_found("Notification", id))?;
        let changed = stored.notification.advance(to, Utc::now())?;
        if changed {
            debug!(notification = %id, status = %to, "notification status changed");
        }
        Ok(changed)
    }

    /// Drop expired notifications, whatever their status, and any left
    /// untouched past the retention window. Then retry channels still
    /// owed a delivery.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let cutoff = now.checked_sub_signed(self.retention);
        let mut removed: Vec<(RecipientId, NotificationId)> = Vec::new();
        let (mut expired, mut retired) = (0, 0);
        self.store.retain(|id, s| {
            let n = &s.notification;
            let keep = if n.is_expired(now) {
                expired += 1;
                false
            } else if cutoff.is_some_and(|c| n.last_changed_at() <= c) {
                retired += 1;
                false
            } else {
                true
            };
            if !keep {
                removed.push((n.recipient.clone(), *id));
            }
            keep
        });
        self.unindex(&removed);

        let owed: Vec<NotificationId> = self
            .store
            .iter()
            .filter(|e| {
                let n = &e.value().notification;
                n.status() != NotificationStatus::Dismissed && !n.undelivered_channels().is_empty()
            })
            .map(|e| *e.key())
            .collect();
        let retried = owed.into_iter().filter(|id| self.attempt(*id, now)).count();

        if expired > 0 || retired > 0 || retried > 0 {
            debug!(expired, retired, retried, "notification sweep");
        }
        SweepReport {
            expired,
            retired,
            retried,
        }
    }

    fn unindex(&self, removed: &[(RecipientId, NotificationId)]) {
        for (recipient, id) in removed {
            if let Some(mut ids) = self.inbox.get_mut(recipient) {
                ids.retain(|i| i != id);
            }
            self.inbox.remove_if(recipient, |_, ids| ids.is_empty());
        }
    }

    /// Retry owed deliveries for one recipient, e.g. when their session
    /// comes online.
    pub fn retry_recipient(&self, recipient: &RecipientId) -> usize {
        let now = Utc::now();
        self.ids_for(recipient)
            .into_iter()
            .filter(|id| self.attempt(*id, now))
            .count()
    }

    /// Send the notification built by `build` to every recipient.
    pub fn notify_all(
        &self,
        recipients: &[RecipientId],
        build: impl Fn(&RecipientId) -> Notification,
    ) -> usize {
        let mut sent = 0;
        for recipient in recipients {
            match self.notify(build(recipient)) {
                Ok(_) => sent += 1,
                Err(e) => warn!(recipient = %recipient, error = %e, "broadcast notification rejected"),
            }
        }
        info!(sent, total = recipients.len(), "broadcast notification");
        sent
    }

    pub fn remove_recipient(&self, recipient: &RecipientId) -> usize {
        let Some((_, ids)) = self.inbox.remove(recipient) else {
            return 0;
        };
        ids.iter().filter(|id| self.store.remove(id).is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Periodic expiry and retry sweep until cancelled.
pub(crate) async fn sweep_loop(
    pipeline: Arc<NotificationPipeline>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                pipeline.sweep(Utc::now());
            }
        }
    }
    debug!("notification sweep stopped");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use crate::model::{NotificationCategory, Severity};

    fn pipeline() -> (NotificationPipeline, Arc<SessionTable>, Arc<EngineMetrics>) {
        let sessions = Arc::new(SessionTable::new(8));
        let metrics = Arc::new(EngineMetrics::new());
        let p = NotificationPipeline::new(Arc::clone(&sessions), Arc::clone(&metrics));
        (p, sessions, metrics)
    }

    fn note(recipient: &str, title: &str) -> Notification {
        Notification::new(recipient, NotificationCategory::System, title, "body")
    }

    #[test]
    fn offline_recipient_gets_in_app_only() {
        let (p, _, _) = pipeline();
        let id = p.notify(note("r", "hi")).unwrap();
        let n = p.get(id).unwrap();
        assert_eq!(n.status(), NotificationStatus::Delivered);
        assert!(n.delivery(DeliveryChannel::InApp).unwrap().delivered);
        let live = n.delivery(DeliveryChannel::LivePush).unwrap();
        assert!(!live.delivered);
        assert_eq!(live.attempts, 0, "skipped, not failed");
    }

    #[test]
    fn live_push_reaches_connected_session() {
        let (p, sessions, _) = pipeline();
        let mut rx = sessions.open_notifications(&"r".into());
        let id = p
            .notify(note("r", "hi").with_channels([DeliveryChannel::LivePush]))
            .unwrap();
        assert_eq!(rx.try_recv().unwrap().id, id);
        assert_eq!(p.get(id).unwrap().status(), NotificationStatus::Delivered);
    }

    #[test]
    fn sweep_retries_once_recipient_connects() {
        let (p, sessions, _) = pipeline();
        let id = p
            .notify(note("r", "hi").with_channels([DeliveryChannel::LivePush]))
            .unwrap();
        assert_eq!(p.get(id).unwrap().status(), NotificationStatus::Pending);

        let mut rx = sessions.open_notifications(&"r".into());
        let report = p.sweep(Utc::now());
        assert_eq!(report.retried, 1);
        assert_eq!(rx.try_recv().unwrap().id, id);
        assert_eq!(p.get(id).unwrap().status(), NotificationStatus::Delivered);
    }

    #[test]
    fn expired_notifications_leave_pending_and_store() {
        let (p, _, _) = pipeline();
        let short = p
            .notify(note("r", "short").expires_in(TimeDelta::seconds(30)))
            .unwrap();
        let long = p.notify(note("r", "long")).unwrap();

        let later = Utc::now() + TimeDelta::seconds(31);
        let report = p.sweep(later);
        assert_eq!(report.expired, 1);
        assert!(p.get(short).is_none());
        assert!(p.get(long).is_some());
    }

    #[test]
    fn sweep_retires_notifications_past_retention() {
        let (p, _, _) = pipeline();
        let p = p.with_retention(TimeDelta::hours(1));
        let read = p.notify(note("r", "read")).unwrap();
        let dismissed = p.notify(note("r", "dismissed")).unwrap();
        let unread = p.notify(note("r", "unread")).unwrap();
        p.mark_read(read).unwrap();
        p.dismiss(dismissed).unwrap();

        assert_eq!(p.sweep(Utc::now() + TimeDelta::minutes(59)).retired, 0);
        assert_eq!(p.len(), 3);

        let report = p.sweep(Utc::now() + TimeDelta::minutes(61));
        assert_eq!(report.retired, 3);
        assert_eq!(report.expired, 0);
        assert!(p.is_empty());
        assert!(p.get(unread).is_none());
        assert!(p.get_pending(&"r".into()).is_empty());
        assert_eq!(p.remove_recipient(&"r".into()), 0, "index emptied too");
    }

    #[test]
    fn get_pending_excludes_expired_read_and_dismissed() {
        let (p, _, _) = pipeline();
        let first = p.notify(note("r", "first")).unwrap();
        let read = p.notify(note("r", "read")).unwrap();
        let gone = p.notify(note("r", "gone")).unwrap();
        let mut expiring = note("r", "expiring");
        expiring.expires_at = Some(Utc::now() + TimeDelta::milliseconds(50));
        p.notify(expiring).unwrap();
        p.notify(note("someone-else", "x")).unwrap();

        p.mark_read(read).unwrap();
        p.dismiss(gone).unwrap();
        std::thread::sleep(Duration::from_millis(80));

        let pending: Vec<_> = p.get_pending(&"r".into()).into_iter().map(|n| n.id).collect();
        assert_eq!(pending, vec![first]);
    }

    #[test]
    fn already_expired_notification_is_rejected() {
        let (p, _, _) = pipeline();
        let n = note("r", "late").expires_at(Utc::now() - TimeDelta::seconds(1));
        assert!(matches!(p.notify(n), Err(CoreError::Validation { .. })));
        assert!(p.is_empty());
    }

    #[test]
    fn status_never_moves_backwards() {
        let (p, _, metrics) = pipeline();
        let id = p.notify(note("r", "x").with_severity(Severity::Warning)).unwrap();
        p.dismiss(id).unwrap();
        assert!(matches!(
            p.mark_read(id),
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(metrics.engagement_score().abs() < f64::EPSILON);
        assert!(matches!(
            p.mark_read(NotificationId::new()),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn dismissed_notifications_are_not_retried() {
        let (p, sessions, _) = pipeline();
        let id = p
            .notify(note("r", "x").with_channels([DeliveryChannel::LivePush]))
            .unwrap();
        p.dismiss(id).unwrap();
        let mut rx = sessions.open_notifications(&"r".into());
        assert_eq!(p.sweep(Utc::now()).retried, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn read_after_delivery_counts_toward_engagement() {
        let (p, _, metrics) = pipeline();
        let a = p.notify(note("r", "a")).unwrap();
        p.notify(note("r", "b")).unwrap();
        p.mark_read(a).unwrap();
        assert!((metrics.engagement_score() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn notify_all_reaches_each_recipient() {
        let (p, _, _) = pipeline();
        let recipients = vec![RecipientId::from("a"), RecipientId::from("b")];
        let sent = p.notify_all(&recipients, |r| note(r.as_str(), "down"));
        assert_eq!(sent, 2);
        assert_eq!(p.get_pending(&"a".into()).len(), 1);
        assert_eq!(p.remove_recipient(&"a".into()), 1);
        assert_eq!(p.len(), 1);
    }
}
