// ── Batch buffer and flush scheduler ──
//
// One FIFO queue per recipient. A flush takes deliverable entries from
// the head of the queue in batches of at most `max_batch_size` and
// `try_send`s each to the recipient's session. A throttled entry holds
// everything behind it; only critical entries pass it. `try_send` never
// blocks, so the queue's shard lock is held across the hand-off and two
// concurrent flushes cannot reorder a recipient's events.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::CoreError;
use crate::metrics::EngineMetrics;
use crate::model::{Event, Priority, RecipientId, SubscriptionId};
use crate::registry::SubscriptionRegistry;
use crate::router::DedupIndex;
use crate::session::SessionTable;

/// An ordered group of events handed to one recipient.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub recipient: RecipientId,
    /// Per-recipient, starting at 1, incremented per delivered batch.
    pub sequence: u64,
    pub events: Vec<Arc<Event>>,
    pub created_at: DateTime<Utc>,
}

/// Why a flush ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FlushReason {
    Interval,
    Critical,
    BatchFull,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was deliverable.
    Idle,
    /// `sequence` is the last batch handed off; `events` counts all of them.
    Delivered { sequence: u64, events: usize },
    /// Delivery failed; entries kept for the next scheduled flush.
    Retrying { attempt: u32 },
}

/// Surfaced when a recipient's buffer is dropped after repeated failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub recipient: RecipientId,
    pub dropped: usize,
    pub reason: String,
}

#[derive(Debug)]
struct Queued {
    event: Arc<Event>,
    subscription: Option<SubscriptionId>,
    priority: Priority,
}

#[derive(Debug, Default)]
struct RecipientQueue {
    entries: VecDeque<Queued>,
    /// Events dropped on overflow since the last delivered batch.
    missed: u64,
    failed_flushes: u32,
    sequence: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BufferLimits {
    pub max_batch_size: usize,
    pub max_buffered_events: usize,
    pub max_flush_retries: u32,
}

#[derive(Debug)]
pub struct BatchBuffer {
    queues: DashMap<RecipientId, RecipientQueue>,
    limits: BufferLimits,
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionTable>,
    metrics: Arc<EngineMetrics>,
    dedup: DedupIndex,
    failures: broadcast::Sender<DeliveryFailure>,
}

impl BatchBuffer {
    pub fn new(
        limits: BufferLimits,
        registry: Arc<SubscriptionRegistry>,
        sessions: Arc<SessionTable>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        let (failures, _) = broadcast::channel(64);
        Self {
            queues: DashMap::new(),
            limits,
            registry,
            sessions,
            metrics,
            dedup: DedupIndex::default(),
            failures,
        }
    }

    pub(crate) fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    /// Receiver for buffers dropped after exhausting their retries.
    pub fn failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.failures.subscribe()
    }

    /// Append `event` to the recipient's queue. Returns the reason the
    /// caller should flush right away, if any.
    pub fn enqueue(
        &self,
        recipient: &RecipientId,
        event: Arc<Event>,
        subscription: Option<SubscriptionId>,
        priority: Priority,
    ) -> Option<FlushReason> {
        let mut queue = self.queues.entry(recipient.clone()).or_default();
        if queue.entries.len() >= self.limits.max_buffered_events {
            if let Some(oldest) = queue.entries.pop_front() {
                self.dedup.release(recipient, &oldest.event);
            }
            queue.missed += 1;
            self.metrics.record_dropped(1);
            warn!(
                recipient = %recipient,
                missed = queue.missed,
                "buffer full, dropped oldest event"
            );
        }
        queue.entries.push_back(Queued {
            event,
            subscription,
            priority,
        });

        if priority == Priority::Critical {
            Some(FlushReason::Critical)
        } else if queue.entries.len() >= self.limits.max_batch_size {
            Some(FlushReason::BatchFull)
        } else {
            None
        }
    }

    /// Deliver whatever is deliverable for `recipient`.
    ///
    /// Entries go out in routing order, at most `max_batch_size` per
    /// batch. An entry whose subscription is still inside its throttle
    /// window holds the rest of the queue; critical entries pass it. A
    /// failed hand-off keeps everything for the next flush; after
    /// `max_flush_retries` failures the queue is dropped and a
    /// [`CoreError::Delivery`] is returned.
    pub fn flush(&self, recipient: &RecipientId, reason: FlushReason) -> Result<FlushOutcome, CoreError> {
        let sender = self.sessions.batch_sender(recipient);
        let Some(mut queue) = self.queues.get_mut(recipient) else {
            return Ok(FlushOutcome::Idle);
        };

        let now = Instant::now();
        let mut delivered: Option<(u64, usize)> = None;
        loop {
            let taken = self.take_ready(&mut queue, reason, now);
            if taken.is_empty() && queue.missed == 0 {
                break;
            }

            let sequence = queue.sequence + 1;
            let mut events = Vec::with_capacity(taken.len() + 1);
            if queue.missed > 0 {
                events.push(Arc::new(Event::gap(recipient, queue.missed)));
            }
            events.extend(taken.iter().map(|q| Arc::clone(&q.event)));
            let count = events.len();
            let batch = Batch {
                recipient: recipient.clone(),
                sequence,
                events,
                created_at: Utc::now(),
            };

            let sent = match &sender {
                Some(tx) => tx.try_send(batch).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => "session channel full",
                    mpsc::error::TrySendError::Closed(_) => "session closed",
                }),
                None => Err("no open session"),
            };

            let why = match sent {
                Ok(()) => {
                    queue.sequence = sequence;
                    queue.missed = 0;
                    queue.failed_flushes = 0;
                    for entry in &taken {
                        if let Some(id) = entry.subscription {
                            self.registry.record_delivery(id, now);
                        }
                    }
                    self.metrics.record_batch(count);
                    trace!(recipient = %recipient, %reason, sequence, events = count, "batch delivered");
                    let total = delivered.map_or(0, |(_, n)| n) + count;
                    delivered = Some((sequence, total));
                    continue;
                }
                Err(why) => why,
            };

            // Put the batch back ahead of anything still queued.
            for entry in taken.into_iter().rev() {
                queue.entries.push_front(entry);
            }
            if delivered.is_some() {
                // Earlier batches got through; the rest waits for the next flush.
                trace!(recipient = %recipient, reason = why, "backlog left for next flush");
                break;
            }
            queue.failed_flushes += 1;
            let attempt = queue.failed_flushes;
            if attempt <= self.limits.max_flush_retries {
                debug!(recipient = %recipient, attempt, reason = why, "flush failed, will retry");
                return Ok(FlushOutcome::Retrying { attempt });
            }

            let lost: Vec<Queued> = queue.entries.drain(..).collect();
            let dropped = lost.len();
            queue.missed = 0;
            queue.failed_flushes = 0;
            drop(queue);

            for entry in &lost {
                self.dedup.release(recipient, &entry.event);
            }
            self.metrics.record_dropped(dropped as u64);
            let message =
                format!("{why}; dropped {dropped} events after {attempt} failed flushes");
            warn!(recipient = %recipient, dropped, "{message}");
            let _ = self.failures.send(DeliveryFailure {
                recipient: recipient.clone(),
                dropped,
                reason: message.clone(),
            });
            return Err(CoreError::Delivery {
                recipient: recipient.clone(),
                reason: message,
            });
        }

        Ok(delivered.map_or(FlushOutcome::Idle, |(sequence, events)| {
            FlushOutcome::Delivered { sequence, events }
        }))
    }

    /// Remove the next batch's worth of deliverable entries, in order.
    fn take_ready(&self, queue: &mut RecipientQueue, reason: FlushReason, now: Instant) -> Vec<Queued> {
        let room = self
            .limits
            .max_batch_size
            .saturating_sub(usize::from(queue.missed > 0))
            .max(1);
        let mut taken = Vec::new();
        let mut kept = VecDeque::new();
        let mut held = false;
        for entry in queue.entries.drain(..) {
            if taken.len() == room {
                kept.push_back(entry);
                continue;
            }
            let ready = reason == FlushReason::Shutdown
                || entry.priority == Priority::Critical
                || (!held
                    && entry
                        .subscription
                        .is_none_or(|id| self.registry.throttle_ready(id, now)));
            if ready {
                taken.push(entry);
            } else {
                held = true;
                kept.push_back(entry);
            }
        }
        queue.entries = kept;
        taken
    }

    /// Flush every recipient with queued entries. Failures are isolated
    /// per recipient and collected.
    pub fn flush_all(&self, reason: FlushReason) -> Vec<CoreError> {
        let mut errors = Vec::new();
        for recipient in self.pending_recipients() {
            if let Err(e) = self.flush(&recipient, reason) {
                errors.push(e);
            }
        }
        errors
    }

    /// Recipients with something to deliver, snapshotted.
    pub fn pending_recipients(&self) -> Vec<RecipientId> {
        self.queues
            .iter()
            .filter(|q| !q.entries.is_empty() || q.missed > 0)
            .map(|q| q.key().clone())
            .collect()
    }

    pub fn buffered_events(&self) -> usize {
        self.queues.iter().map(|q| q.entries.len()).sum()
    }

    pub fn buffered_for(&self, recipient: &RecipientId) -> usize {
        self.queues.get(recipient).map_or(0, |q| q.entries.len())
    }

    pub fn remove_recipient(&self, recipient: &RecipientId) -> usize {
        self.queues
            .remove(recipient)
            .map_or(0, |(_, q)| q.entries.len())
    }

    /// Discard every queue. Returns how many events were thrown away.
    pub fn clear(&self) -> usize {
        let discarded = self.buffered_events();
        self.queues.clear();
        discarded
    }
}

/// Periodic flush of all non-empty buffers until cancelled.
pub(crate) async fn flush_loop(buffer: Arc<BatchBuffer>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let errors = buffer.flush_all(FlushReason::Interval);
                if !errors.is_empty() {
                    debug!(count = errors.len(), "interval flush dropped buffers");
                }
            }
        }
    }
    debug!("flush scheduler stopped");
}
