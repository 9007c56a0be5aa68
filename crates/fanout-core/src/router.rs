// ── Update router ──
//
// Resolves who gets an event, suppresses byte-identical repeats per
// recipient, enqueues into the batch buffer and runs any flush the
// enqueue asked for. Every routed event lands in a bounded log.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::batch::{BatchBuffer, FlushOutcome};
use crate::cache::DataCache;
use crate::error::CoreError;
use crate::metrics::EngineMetrics;
use crate::model::{BroadcastScope, Event, Priority, RecipientId, SubscriptionId};
use crate::registry::SubscriptionRegistry;
use crate::session::SessionTable;

/// Dedup key: one last-seen payload per recipient, channel and entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    recipient: RecipientId,
    channel: String,
    entity_id: Option<String>,
}

impl DedupKey {
    fn new(recipient: &RecipientId, event: &Event) -> Self {
        Self {
            recipient: recipient.clone(),
            channel: event.channel().to_owned(),
            entity_id: event.entity_id().map(str::to_owned),
        }
    }
}

/// Last payload queued or delivered per dedup key.
///
/// Owned by the batch buffer: an entry that is dropped before delivery
/// releases its key so an identical re-broadcast is not suppressed.
#[derive(Debug, Default)]
pub(crate) struct DedupIndex {
    seen: DataCache<DedupKey, Bytes>,
}

impl DedupIndex {
    /// True when `recipient` already has this exact payload for the
    /// event's channel and entity. Otherwise records it as the last seen.
    pub(crate) fn check_and_record(&self, recipient: &RecipientId, event: &Event, ttl: Duration) -> bool {
        let key = DedupKey::new(recipient, event);
        let payload = event.encoded_payload();
        if self.seen.get(&key).as_ref() == Some(payload) {
            return true;
        }
        self.seen.set(key, payload.clone(), ttl);
        false
    }

    /// Forget `event` for `recipient` if it is still the recorded payload.
    pub(crate) fn release(&self, recipient: &RecipientId, event: &Event) {
        let payload = event.encoded_payload();
        self.seen
            .remove_if(&DedupKey::new(recipient, event), |seen| seen == payload);
    }

    pub(crate) fn forget_recipient(&self, recipient: &RecipientId) {
        self.seen.remove_where(|k| k.recipient == *recipient);
    }
}

/// What happened to one routed event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteOutcome {
    /// Recipients the event was queued for.
    pub enqueued: usize,
    /// Recipients skipped because they already had this exact payload.
    pub suppressed: usize,
    /// Immediate flushes that delivered a batch.
    pub flushed: usize,
    /// Recipients whose buffer was dropped during an immediate flush.
    pub failed: usize,
}

struct Target {
    recipient: RecipientId,
    subscription: Option<SubscriptionId>,
    priority: Priority,
}

pub struct Router {
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionTable>,
    buffer: Arc<BatchBuffer>,
    metrics: Arc<EngineMetrics>,
    dedup_ttl: Duration,
    log: Mutex<VecDeque<Arc<Event>>>,
    log_capacity: usize,
}

impl Router {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        sessions: Arc<SessionTable>,
        buffer: Arc<BatchBuffer>,
        metrics: Arc<EngineMetrics>,
        dedup_ttl: Duration,
        log_capacity: usize,
    ) -> Self {
        Self {
            registry,
            sessions,
            buffer,
            metrics,
            dedup_ttl,
            log: Mutex::new(VecDeque::with_capacity(log_capacity)),
            log_capacity,
        }
    }

    /// Fan `event` out to its recipients.
    ///
    /// Invalid events are rejected before anything is logged or queued.
    /// A failure in one recipient's immediate flush is counted and does
    /// not stop delivery to the others.
    pub fn route(&self, event: Arc<Event>) -> Result<RouteOutcome, CoreError> {
        validate(&event)?;
        self.append_log(&event);

        let mut outcome = RouteOutcome::default();
        for target in self.targets(&event) {
            if !event.is_gap() && self.is_duplicate(&target.recipient, &event) {
                outcome.suppressed += 1;
                self.metrics.record_suppressed();
                trace!(recipient = %target.recipient, channel = event.channel(), "duplicate suppressed");
                continue;
            }

            outcome.enqueued += 1;
            let Some(reason) = self.buffer.enqueue(
                &target.recipient,
                Arc::clone(&event),
                target.subscription,
                target.priority,
            ) else {
                continue;
            };

            match self.buffer.flush(&target.recipient, reason) {
                Ok(FlushOutcome::Delivered { .. }) => outcome.flushed += 1,
                Ok(_) => {}
                Err(e) => {
                    outcome.failed += 1;
                    warn!(recipient = %target.recipient, error = %e, "immediate flush failed");
                }
            }
        }

        debug!(
            channel = event.channel(),
            kind = event.payload().type_name(),
            enqueued = outcome.enqueued,
            suppressed = outcome.suppressed,
            flushed = outcome.flushed,
            "event routed"
        );
        Ok(outcome)
    }

    /// Recipients for `event` per its scope, each at most once.
    fn targets(&self, event: &Event) -> Vec<Target> {
        let direct = |recipient: RecipientId| Target {
            recipient,
            subscription: None,
            priority: event.priority(),
        };

        match event.scope() {
            BroadcastScope::All => self.sessions.recipients().into_iter().map(direct).collect(),
            BroadcastScope::SpecificRecipients { recipients } => {
                let mut seen = HashSet::new();
                recipients
                    .iter()
                    .filter(|r| seen.insert(*r))
                    .cloned()
                    .map(direct)
                    .collect()
            }
            BroadcastScope::TopicSubscribers => {
                // Subscribers arrive highest priority first, so the first
                // match per recipient is the one to attribute.
                let mut seen = HashSet::new();
                self.registry
                    .resolve(event)
                    .into_iter()
                    .filter(|s| seen.insert(s.recipient().clone()))
                    .map(|s| Target {
                        recipient: s.recipient().clone(),
                        subscription: Some(s.id()),
                        priority: event.priority().max(s.priority()),
                    })
                    .collect()
            }
        }
    }

    fn is_duplicate(&self, recipient: &RecipientId, event: &Event) -> bool {
        self.buffer
            .dedup()
            .check_and_record(recipient, event, self.dedup_ttl)
    }

    fn append_log(&self, event: &Arc<Event>) {
        if self.log_capacity == 0 {
            return;
        }
        let mut log = self.log.lock();
        if log.len() == self.log_capacity {
            log.pop_front();
        }
        log.push_back(Arc::clone(event));
    }

    /// The most recent `limit` routed events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<Arc<Event>> {
        let log = self.log.lock();
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }

    /// Forget dedup history for `recipient`.
    pub fn forget_recipient(&self, recipient: &RecipientId) {
        self.buffer.dedup().forget_recipient(recipient);
    }
}

fn validate(event: &Event) -> Result<(), CoreError> {
    if event.channel().trim().is_empty() {
        return Err(CoreError::validation("event channel must not be empty"));
    }
    if let BroadcastScope::SpecificRecipients { recipients } = event.scope() {
        if recipients.is_empty() {
            return Err(CoreError::validation(
                "specific-recipients scope needs at least one recipient",
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BufferLimits};
    use crate::model::EventPayload;
    use crate::registry::SubscribeOptions;
    use tokio::sync::mpsc;

    struct Fixture {
        router: Router,
        registry: Arc<SubscriptionRegistry>,
        sessions: Arc<SessionTable>,
        buffer: Arc<BatchBuffer>,
    }

    fn fixture(log_capacity: usize) -> Fixture {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sessions = Arc::new(SessionTable::new(16));
        let metrics = Arc::new(EngineMetrics::new());
        let buffer = Arc::new(BatchBuffer::new(
            BufferLimits {
                max_batch_size: 10,
                max_buffered_events: 100,
                max_flush_retries: 3,
            },
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&metrics),
        ));
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&buffer),
            metrics,
            Duration::from_secs(60),
            log_capacity,
        );
        Fixture {
            router,
            registry,
            sessions,
            buffer,
        }
    }

    fn score(home: u32) -> Event {
        Event::new(
            "game:42",
            EventPayload::ScoreUpdate {
                home,
                away: 0,
                period: None,
            },
        )
        .with_entity("42")
    }

    fn subscribe(f: &Fixture, recipient: &str, priority: Priority) -> mpsc::Receiver<Batch> {
        let r = RecipientId::from(recipient);
        let rx = f.sessions.open_batches(&r);
        f.registry
            .subscribe(r, "game:42", SubscribeOptions::default().priority(priority))
            .unwrap();
        rx
    }

    #[test]
    fn critical_subscriber_is_flushed_immediately() {
        let f = fixture(100);
        let mut rx = subscribe(&f, "r", Priority::Critical);

        let event = Arc::new(score(1));
        let outcome = f.router.route(Arc::clone(&event)).unwrap();
        assert_eq!(outcome.flushed, 1);

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].encoded_payload(), event.encoded_payload());
    }

    #[test]
    fn normal_subscriber_waits_for_the_timer() {
        let f = fixture(100);
        let mut rx = subscribe(&f, "r", Priority::Normal);
        let outcome = f.router.route(Arc::new(score(1))).unwrap();
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(outcome.flushed, 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(f.buffer.buffered_for(&"r".into()), 1);
    }

    #[test]
    fn identical_payload_is_suppressed() {
        let f = fixture(100);
        let _rx = subscribe(&f, "r", Priority::Normal);

        assert_eq!(f.router.route(Arc::new(score(1))).unwrap().enqueued, 1);
        let again = f.router.route(Arc::new(score(1))).unwrap();
        assert_eq!(again.enqueued, 0);
        assert_eq!(again.suppressed, 1);
        assert_eq!(f.router.route(Arc::new(score(2))).unwrap().enqueued, 1);
        assert_eq!(f.buffer.buffered_for(&"r".into()), 2);
    }

    #[test]
    fn payload_dropped_before_delivery_can_be_sent_again() {
        let f = fixture(100);
        let r = RecipientId::from("r");
        f.registry
            .subscribe(r.clone(), "game:42", SubscribeOptions::default().priority(Priority::Critical))
            .unwrap();

        // No batch endpoint yet: the immediate flush fails and is retried.
        let first = f.router.route(Arc::new(score(7))).unwrap();
        assert_eq!(first.enqueued, 1);
        assert_eq!(first.flushed, 0);
        for _ in 0..2 {
            f.buffer.flush(&r, crate::batch::FlushReason::Interval).unwrap();
        }
        assert!(f.buffer.flush(&r, crate::batch::FlushReason::Interval).is_err());
        assert_eq!(f.buffer.buffered_for(&r), 0);

        let mut rx = f.sessions.open_batches(&r);
        let again = f.router.route(Arc::new(score(7))).unwrap();
        assert_eq!(again.suppressed, 0);
        assert_eq!(again.flushed, 1);
        assert_eq!(rx.try_recv().unwrap().events.len(), 1);

        let repeat = f.router.route(Arc::new(score(7))).unwrap();
        assert_eq!(repeat.suppressed, 1, "delivered payload is deduplicated again");
    }

    #[test]
    fn overflowed_payload_is_not_suppressed() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sessions = Arc::new(SessionTable::new(16));
        let metrics = Arc::new(EngineMetrics::new());
        let buffer = Arc::new(BatchBuffer::new(
            BufferLimits {
                max_batch_size: 10,
                max_buffered_events: 1,
                max_flush_retries: 3,
            },
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&metrics),
        ));
        let router = Router::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&buffer),
            metrics,
            Duration::from_secs(60),
            10,
        );
        let r = RecipientId::from("r");
        registry
            .subscribe(r.clone(), "game:42", SubscribeOptions::default())
            .unwrap();

        router.route(Arc::new(score(1))).unwrap();
        // Pushes score 1 out of the one-slot buffer.
        router.route(Arc::new(score(2))).unwrap();
        let resent = router.route(Arc::new(score(1))).unwrap();
        assert_eq!(resent.suppressed, 0);
        assert_eq!(resent.enqueued, 1);
    }

    #[test]
    fn recipient_with_two_matching_subscriptions_gets_one_copy() {
        let f = fixture(100);
        let r = RecipientId::from("r");
        let mut rx = f.sessions.open_batches(&r);
        f.registry
            .subscribe(r.clone(), "game:42", SubscribeOptions::default())
            .unwrap();
        f.registry
            .subscribe(
                r.clone(),
                "game:42",
                SubscribeOptions::default().entity("42").priority(Priority::Critical),
            )
            .unwrap();

        let outcome = f.router.route(Arc::new(score(1))).unwrap();
        assert_eq!(outcome.enqueued, 1);
        assert_eq!(outcome.flushed, 1, "attributed to the critical subscription");
        assert_eq!(rx.try_recv().unwrap().events.len(), 1);
    }

    #[test]
    fn scope_all_reaches_every_session() {
        let f = fixture(100);
        for r in ["a", "b", "c"] {
            f.sessions.register(&r.into());
        }
        let event = Event::new("system", EventPayload::GameState { status: "halted".into() })
            .with_scope(BroadcastScope::All);
        assert_eq!(f.router.route(Arc::new(event)).unwrap().enqueued, 3);
    }

    #[test]
    fn specific_recipients_ignore_subscriptions() {
        let f = fixture(100);
        let _rx = subscribe(&f, "subscriber", Priority::Normal);
        let event = score(1).with_scope(BroadcastScope::SpecificRecipients {
            recipients: vec!["x".into(), "x".into(), "y".into()],
        });
        assert_eq!(f.router.route(Arc::new(event)).unwrap().enqueued, 2);
        assert_eq!(f.buffer.buffered_for(&"subscriber".into()), 0);
    }

    #[test]
    fn invalid_events_are_rejected_and_not_logged() {
        let f = fixture(100);
        let empty = Event::new(" ", EventPayload::GameState { status: "x".into() });
        assert!(matches!(
            f.router.route(Arc::new(empty)),
            Err(CoreError::Validation { .. })
        ));
        let nobody = score(1).with_scope(BroadcastScope::SpecificRecipients { recipients: vec![] });
        assert!(f.router.route(Arc::new(nobody)).is_err());
        assert!(f.router.recent_events(10).is_empty());
    }

    #[test]
    fn event_log_is_bounded() {
        let f = fixture(3);
        for home in 0..5 {
            f.router.route(Arc::new(score(home))).unwrap();
        }
        let homes: Vec<u32> = f
            .router
            .recent_events(10)
            .iter()
            .filter_map(|e| match e.payload() {
                EventPayload::ScoreUpdate { home, .. } => Some(*home),
                _ => None,
            })
            .collect();
        assert_eq!(homes, vec![2, 3, 4]);
        assert_eq!(f.router.recent_events(1).len(), 1);
    }
}
