// ── Recipient sessions ──
//
// Delivery endpoints per recipient: a bounded batch channel and an
// optional live-push notification channel. The table only hands out
// sender clones; sends happen outside the map.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::batch::Batch;
use crate::model::{Notification, RecipientId};

#[derive(Debug, Default)]
struct Session {
    batches: Option<mpsc::Sender<Batch>>,
    notifications: Option<mpsc::Sender<Arc<Notification>>>,
}

#[derive(Debug)]
pub struct SessionTable {
    sessions: DashMap<RecipientId, Session>,
    capacity: usize,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Make sure `recipient` is known, without attaching any endpoint.
    pub fn register(&self, recipient: &RecipientId) {
        self.sessions.entry(recipient.clone()).or_default();
    }

    /// Attach a fresh batch endpoint, replacing any previous one.
    pub fn open_batches(&self, recipient: &RecipientId) -> mpsc::Receiver<Batch> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.sessions.entry(recipient.clone()).or_default().batches = Some(tx);
        debug!(recipient = %recipient, "batch endpoint opened");
        rx
    }

    /// Attach a fresh live-push endpoint, replacing any previous one.
    pub fn open_notifications(&self, recipient: &RecipientId) -> mpsc::Receiver<Arc<Notification>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.sessions.entry(recipient.clone()).or_default().notifications = Some(tx);
        debug!(recipient = %recipient, "notification endpoint opened");
        rx
    }

    pub fn batch_sender(&self, recipient: &RecipientId) -> Option<mpsc::Sender<Batch>> {
        self.sessions
            .get(recipient)
            .and_then(|s| s.batches.as_ref().filter(|tx| !tx.is_closed()).cloned())
    }

    pub fn notification_sender(
        &self,
        recipient: &RecipientId,
    ) -> Option<mpsc::Sender<Arc<Notification>>> {
        self.sessions
            .get(recipient)
            .and_then(|s| s.notifications.as_ref().filter(|tx| !tx.is_closed()).cloned())
    }

    /// A recipient is live when its push endpoint has an open receiver.
    pub fn is_connected(&self, recipient: &RecipientId) -> bool {
        self.notification_sender(recipient).is_some()
    }

    pub fn contains(&self, recipient: &RecipientId) -> bool {
        self.sessions.contains_key(recipient)
    }

    /// Snapshot of every registered recipient.
    pub fn recipients(&self) -> Vec<RecipientId> {
        let mut ids: Vec<RecipientId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn remove(&self, recipient: &RecipientId) -> bool {
        self.sessions.remove(recipient).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_follows_receiver_lifetime() {
        let table = SessionTable::new(4);
        let r = RecipientId::from("r1");
        table.register(&r);
        assert!(!table.is_connected(&r));

        let rx = table.open_notifications(&r);
        assert!(table.is_connected(&r));

        drop(rx);
        assert!(!table.is_connected(&r));
        assert!(table.contains(&r));
    }

    #[test]
    fn reopening_replaces_the_endpoint() {
        let table = SessionTable::new(4);
        let r = RecipientId::from("r1");
        let first = table.open_batches(&r);
        let _second = table.open_batches(&r);
        drop(first);
        assert!(table.batch_sender(&r).is_some());
    }

    #[test]
    fn recipients_are_sorted_snapshot() {
        let table = SessionTable::new(1);
        table.register(&"b".into());
        table.register(&"a".into());
        assert_eq!(
            table.recipients(),
            vec![RecipientId::from("a"), RecipientId::from("b")]
        );
        assert!(table.remove(&"a".into()));
        assert_eq!(table.len(), 1);
    }
}
