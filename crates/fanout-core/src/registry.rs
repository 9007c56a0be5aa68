// ── Subscription registry ──
//
// Channel → subscriber index read by the router on every event while
// control-path calls add and remove subscriptions. The channel index is
// copy-on-write behind an `ArcSwap`: readers load an immutable snapshot
// and never block writers or each other. Writers take `writes` so the id
// map and the channel index change together.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::CoreError;
use crate::model::{Event, Priority, RecipientId, SubscriptionId};

/// Predicate on event content, evaluated after channel and entity match.
pub enum ContentFilter {
    /// Payload type tag equals the given name.
    EventType(String),
    /// Event priority is at least this level.
    MinPriority(Priority),
    /// The JSON pointer into the payload resolves to this value.
    FieldEquals {
        pointer: String,
        value: serde_json::Value,
    },
    Custom(Box<dyn Fn(&Event) -> bool + Send + Sync>),
}

impl ContentFilter {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::EventType(name) => event.payload().type_name() == name,
            Self::MinPriority(min) => event.priority() >= *min,
            Self::FieldEquals { pointer, value } => serde_json::to_value(event.payload())
                .ok()
                .and_then(|doc| doc.pointer(pointer).cloned())
                .is_some_and(|found| found == *value),
            Self::Custom(f) => f(event),
        }
    }
}

impl fmt::Debug for ContentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EventType(name) => f.debug_tuple("EventType").field(name).finish(),
            Self::MinPriority(p) => f.debug_tuple("MinPriority").field(p).finish(),
            Self::FieldEquals { pointer, value } => f
                .debug_struct("FieldEquals")
                .field("pointer", pointer)
                .field("value", value)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Optional parameters for [`SubscriptionRegistry::subscribe`].
#[derive(Debug, Default)]
pub struct SubscribeOptions {
    pub entity_id: Option<String>,
    pub filters: Vec<ContentFilter>,
    /// Minimum spacing between deliveries; zero disables throttling.
    pub throttle: Duration,
    pub priority: Priority,
}

impl SubscribeOptions {
    #[must_use]
    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: ContentFilter) -> Self {
        self.filters.push(filter);
        self
    }

    #[must_use]
    pub fn throttle(mut self, interval: Duration) -> Self {
        self.throttle = interval;
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug)]
pub struct Subscriber {
    id: SubscriptionId,
    recipient: RecipientId,
    channel: String,
    entity_id: Option<String>,
    filters: Vec<ContentFilter>,
    throttle: Duration,
    priority: Priority,
    seq: u64,
    last_delivery: Mutex<Option<Instant>>,
}

impl Subscriber {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn recipient(&self) -> &RecipientId {
        &self.recipient
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    pub fn throttle(&self) -> Duration {
        self.throttle
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn last_delivery(&self) -> Option<Instant> {
        *self.last_delivery.lock()
    }

    /// Channel is assumed to match; checks entity and content filters.
    pub fn accepts(&self, event: &Event) -> bool {
        let entity_ok = match (event.entity_id(), self.entity_id.as_deref()) {
            (Some(ev), Some(want)) => ev == want,
            (None, Some(_)) => false,
            (_, None) => true,
        };
        entity_ok && self.filters.iter().all(|f| f.matches(event))
    }

    fn throttle_ready(&self, now: Instant) -> bool {
        if self.throttle.is_zero() {
            return true;
        }
        self.last_delivery
            .lock()
            .is_none_or(|last| now.saturating_duration_since(last) >= self.throttle)
    }

    fn ordering_key(&self) -> (std::cmp::Reverse<Priority>, u64) {
        (std::cmp::Reverse(self.priority), self.seq)
    }
}

type ChannelIndex = HashMap<String, Vec<Arc<Subscriber>>>;

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    channels: ArcSwap<ChannelIndex>,
    by_id: DashMap<SubscriptionId, Arc<Subscriber>>,
    writes: Mutex<()>,
    next_seq: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        recipient: RecipientId,
        channel: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, CoreError> {
        let channel = channel.into();
        if channel.trim().is_empty() {
            return Err(CoreError::validation("subscription channel must not be empty"));
        }
        if recipient.as_str().is_empty() {
            return Err(CoreError::validation("recipient id must not be empty"));
        }
        if options.entity_id.as_deref().is_some_and(str::is_empty) {
            return Err(CoreError::validation("entity filter must not be empty"));
        }

        let subscriber = Arc::new(Subscriber {
            id: SubscriptionId::new(),
            recipient,
            channel,
            entity_id: options.entity_id,
            filters: options.filters,
            throttle: options.throttle,
            priority: options.priority,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            last_delivery: Mutex::new(None),
        });
        let id = subscriber.id;

        {
            let _writes = self.writes.lock();
            self.by_id.insert(id, Arc::clone(&subscriber));
            self.channels.rcu(|current| {
                let mut next = ChannelIndex::clone(current);
                let list = next.entry(subscriber.channel.clone()).or_default();
                list.push(Arc::clone(&subscriber));
                list.sort_by_key(|s| s.ordering_key());
                next
            });
        }

        debug!(
            subscription = %id,
            recipient = %subscriber.recipient,
            channel = %subscriber.channel,
            priority = %subscriber.priority,
            "subscribed"
        );
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<Arc<Subscriber>, CoreError> {
        let _writes = self.writes.lock();
        let (_, subscriber) = self
            .by_id
            .remove(&id)
            .ok_or_else(|| CoreError::not_found("Subscription", id))?;
        self.detach(&[Arc::clone(&subscriber)]);
        debug!(subscription = %id, "unsubscribed");
        Ok(subscriber)
    }

    /// Drop every subscription held by `recipient`. Returns how many.
    pub fn remove_recipient(&self, recipient: &RecipientId) -> usize {
        let _writes = self.writes.lock();
        let ids: Vec<SubscriptionId> = self
            .by_id
            .iter()
            .filter(|e| e.value().recipient == *recipient)
            .map(|e| *e.key())
            .collect();
        let removed: Vec<Arc<Subscriber>> = ids
            .iter()
            .filter_map(|id| self.by_id.remove(id).map(|(_, s)| s))
            .collect();
        self.detach(&removed);
        removed.len()
    }

    /// Callers hold `writes`.
    fn detach(&self, removed: &[Arc<Subscriber>]) {
        if removed.is_empty() {
            return;
        }
        self.channels.rcu(|current| {
            let mut next = ChannelIndex::clone(current);
            for sub in removed {
                if let Some(list) = next.get_mut(&sub.channel) {
                    list.retain(|s| s.id != sub.id);
                    if list.is_empty() {
                        next.remove(&sub.channel);
                    }
                }
            }
            next
        });
    }

    /// Subscribers that should receive `event`, ordered by priority
    /// (highest first) then subscription order.
    pub fn resolve(&self, event: &Event) -> Vec<Arc<Subscriber>> {
        let index = self.channels.load();
        index
            .get(event.channel())
            .map(|list| list.iter().filter(|s| s.accepts(event)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscriber>> {
        self.by_id.get(&id).map(|e| Arc::clone(e.value()))
    }

    pub fn subscriptions_for(&self, recipient: &RecipientId) -> Vec<Arc<Subscriber>> {
        let mut subs: Vec<_> = self
            .by_id
            .iter()
            .filter(|e| e.value().recipient == *recipient)
            .map(|e| Arc::clone(e.value()))
            .collect();
        subs.sort_by_key(|s| s.seq);
        subs
    }

    /// Whether the subscription's throttle window is open at `now`.
    /// Unknown ids are never throttled.
    pub fn throttle_ready(&self, id: SubscriptionId, now: Instant) -> bool {
        self.by_id
            .get(&id)
            .is_none_or(|s| s.value().throttle_ready(now))
    }

    /// Stamp a delivery so the throttle window restarts at `now`.
    pub fn record_delivery(&self, id: SubscriptionId, now: Instant) {
        if let Some(sub) = self.by_id.get(&id) {
            *sub.value().last_delivery.lock() = Some(now);
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
