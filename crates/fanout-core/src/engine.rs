// ── Engine ──
//
// Full lifecycle facade: owns every component, spawns the background
// workers, and exposes the subscriber, submission, notification and
// metrics APIs. Cheaply cloneable via `Arc<EngineInner>`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::TimeDelta;
use dashmap::DashSet;
use fanout_api::{FeedCredentials, FeedStatus, SnapshotClient, SnapshotConfig};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::batch::{self, BatchBuffer, BufferLimits, DeliveryFailure, FlushReason};
use crate::cache::{DataCache, Lookup};
use crate::config::EngineConfig;
use crate::connection::{ConnectionManager, ConnectionState, LinkChannels};
use crate::consensus::{ConsensusAggregator, ConsensusSnapshot, SubmitOutcome};
use crate::convert::{self, ImpactAssessor};
use crate::error::CoreError;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::model::{
    BroadcastScope, ConsensusShift, Event, EventPayload, Notification, NotificationCategory,
    NotificationId, RecipientId, Severity, SubscriptionId, TopicId,
};
use crate::notify::{self, NotificationChannel, NotificationPipeline, SweepReport};
use crate::registry::{SubscribeOptions, SubscriptionRegistry};
use crate::router::{RouteOutcome, Router};
use crate::session::SessionTable;
use crate::stream::{BatchStream, NotificationStream, RecipientStream};

/// Channel carrying upstream link status events to every session.
pub const CONNECTION_CHANNEL: &str = "system:connection";

// ── Builder ──────────────────────────────────────────────────────────

/// Collects optional plug-ins before the engine is assembled.
pub struct EngineBuilder {
    config: EngineConfig,
    impact: Option<Arc<dyn ImpactAssessor>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
}

impl EngineBuilder {
    /// Annotate injury reports with this assessor.
    #[must_use]
    pub fn impact_assessor(mut self, assessor: Arc<dyn ImpactAssessor>) -> Self {
        self.impact = Some(assessor);
        self
    }

    /// Add or replace a notification channel (keyed by its kind).
    #[must_use]
    pub fn notification_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn build(self) -> Result<Engine, CoreError> {
        let config = self.config;
        config.validate()?;

        let snapshots = config
            .snapshot_url
            .clone()
            .map(|url| {
                SnapshotClient::new(
                    url,
                    SnapshotConfig {
                        timeout: config.request_timeout,
                        token: config.snapshot_token.clone(),
                    },
                )
            })
            .transpose()?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let sessions = Arc::new(SessionTable::new(config.session_capacity));
        let metrics = Arc::new(EngineMetrics::new());
        let buffer = Arc::new(BatchBuffer::new(
            BufferLimits {
                max_batch_size: config.max_batch_size,
                max_buffered_events: config.max_buffered_events,
                max_flush_retries: config.max_flush_retries,
            },
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&metrics),
        ));
        let router = Arc::new(Router::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
            Arc::clone(&buffer),
            Arc::clone(&metrics),
            config.dedup_ttl,
            config.event_log_capacity,
        ));
        // Out-of-range retention means keep until expiry.
        let retention = TimeDelta::from_std(config.notification_retention).unwrap_or(TimeDelta::MAX);
        let mut pipeline = NotificationPipeline::new(Arc::clone(&sessions), Arc::clone(&metrics))
            .with_retention(retention);
        for channel in self.channels {
            pipeline.register_channel(channel);
        }

        Ok(Engine {
            inner: Arc::new(EngineInner {
                consensus: ConsensusAggregator::new(config.shift_threshold),
                connection: Arc::new(ConnectionManager::new(config.feed.clone())),
                notifications: Arc::new(pipeline),
                snapshots,
                snapshot_cache: DataCache::new(),
                refreshing: DashSet::new(),
                impact: self.impact,
                cancel: CancellationToken::new(),
                worker_handles: Mutex::new(Vec::new()),
                link_handles: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                registry,
                sessions,
                buffer,
                router,
                metrics,
                config,
            }),
        })
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// The real-time distribution engine.
///
/// `new` → `start` → `connect` → … → `shutdown`. Every API is safe to
/// call from any task; background work runs on tokio tasks scoped to
/// the engine's cancellation token.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    registry: Arc<SubscriptionRegistry>,
    sessions: Arc<SessionTable>,
    buffer: Arc<BatchBuffer>,
    router: Arc<Router>,
    consensus: ConsensusAggregator,
    notifications: Arc<NotificationPipeline>,
    metrics: Arc<EngineMetrics>,
    connection: Arc<ConnectionManager>,
    snapshots: Option<SnapshotClient>,
    snapshot_cache: DataCache<String, serde_json::Value>,
    /// Keys with a background refresh in flight.
    refreshing: DashSet<String>,
    impact: Option<Arc<dyn ImpactAssessor>>,
    cancel: CancellationToken,
    /// Flush scheduler and notification sweep.
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
    /// Feed bridge and status watcher for the current link.
    link_handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    closing: AtomicBool,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, CoreError> {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            impact: None,
            channels: Vec::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.inner.closing.load(Ordering::Acquire) {
            return Err(CoreError::ShuttingDown);
        }
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Spawn the flush scheduler and notification sweep. Idempotent.
    pub fn start(&self) -> Result<(), CoreError> {
        self.ensure_open()?;
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let config = &self.inner.config;
        let mut handles = self.inner.worker_handles.lock();
        handles.push(tokio::spawn(batch::flush_loop(
            Arc::clone(&self.inner.buffer),
            config.batch_interval,
            self.inner.cancel.child_token(),
        )));
        handles.push(tokio::spawn(notify::sweep_loop(
            Arc::clone(&self.inner.notifications),
            config.sweep_interval,
            self.inner.cancel.child_token(),
        )));

        info!(
            batch_interval_ms = u64::try_from(config.batch_interval.as_millis()).unwrap_or(u64::MAX),
            sweep_interval_s = config.sweep_interval.as_secs(),
            "engine started"
        );
        Ok(())
    }

    /// Open the upstream link. Returns once the connection loop is
    /// running; use [`wait_connected`](Self::wait_connected) to await
    /// the handshake.
    pub fn connect(&self, endpoint: Url, credentials: FeedCredentials) -> Result<(), CoreError> {
        self.ensure_open()?;
        self.abort_link_tasks();

        let LinkChannels {
            events,
            status,
            cancel,
        } = self
            .inner
            .connection
            .connect(endpoint, credentials, &self.inner.cancel)?;

        let mut handles = self.inner.link_handles.lock();
        handles.push(tokio::spawn(bridge_feed(
            events,
            Arc::clone(&self.inner.router),
            self.inner.impact.clone(),
            cancel.clone(),
        )));
        handles.push(tokio::spawn(watch_link(
            status,
            Arc::clone(&self.inner.connection),
            Arc::clone(&self.inner.router),
            Arc::clone(&self.inner.notifications),
            Arc::clone(&self.inner.sessions),
            cancel,
        )));
        Ok(())
    }

    pub async fn wait_connected(&self) -> Result<(), CoreError> {
        self.inner.connection.wait_connected().await
    }

    /// Close the upstream link. Subscriptions and buffers are kept.
    pub async fn disconnect(&self) {
        self.inner.connection.disconnect();
        let handles: Vec<_> = self.inner.link_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    fn abort_link_tasks(&self) {
        for handle in self.inner.link_handles.lock().drain(..) {
            handle.abort();
        }
    }

    /// Leave the `Failed` state and retry the upstream link.
    pub fn reset_connection(&self) -> Result<(), CoreError> {
        self.inner.connection.reset()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn connection_states(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch()
    }

    /// Stop everything. Buffered events get one grace period to drain,
    /// then whatever is left is discarded.
    pub async fn shutdown(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("engine shutting down");
        self.disconnect().await;

        let inner = &self.inner;
        let drain = async {
            loop {
                inner.buffer.flush_all(FlushReason::Shutdown);
                if inner.buffer.pending_recipients().is_empty() {
                    break;
                }
                tokio::time::sleep(inner.config.batch_interval).await;
            }
        };
        if tokio::time::timeout(inner.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            let discarded = inner.buffer.clear();
            warn!(discarded, "shutdown grace elapsed, discarding buffered events");
        }

        inner.cancel.cancel();
        let handles: Vec<_> = inner.worker_handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("engine stopped");
    }

    // ── Subscriber API ───────────────────────────────────────────────

    pub fn subscribe(
        &self,
        recipient: impl Into<RecipientId>,
        channel: impl Into<String>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, CoreError> {
        self.ensure_open()?;
        let recipient = recipient.into();
        let id = self.inner.registry.subscribe(recipient.clone(), channel, options)?;
        self.inner.sessions.register(&recipient);
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<(), CoreError> {
        self.inner.registry.unsubscribe(id).map(|_| ())
    }

    /// Open the recipient's batch endpoint, replacing any previous one.
    pub fn on_batch(&self, recipient: impl Into<RecipientId>) -> BatchStream {
        let recipient = recipient.into();
        let rx = self.inner.sessions.open_batches(&recipient);
        RecipientStream::new(recipient, rx)
    }

    /// Open the recipient's live-push endpoint. Deferred live-push
    /// notifications are retried right away.
    pub fn on_notification(&self, recipient: impl Into<RecipientId>) -> NotificationStream {
        let recipient = recipient.into();
        let rx = self.inner.sessions.open_notifications(&recipient);
        self.inner.notifications.retry_recipient(&recipient);
        RecipientStream::new(recipient, rx)
    }

    /// Tear down a recipient's session: subscriptions, buffered events
    /// and dedup history. Stored notifications stay until they expire.
    pub fn remove_recipient(&self, recipient: &RecipientId) -> usize {
        let removed = self.inner.registry.remove_recipient(recipient);
        let discarded = self.inner.buffer.remove_recipient(recipient);
        self.inner.router.forget_recipient(recipient);
        self.inner.sessions.remove(recipient);
        debug!(recipient = %recipient, removed, discarded, "recipient removed");
        removed
    }

    /// Buffers dropped after exhausting their delivery retries.
    pub fn delivery_failures(&self) -> broadcast::Receiver<DeliveryFailure> {
        self.inner.buffer.failures()
    }

    /// Route an application-originated event.
    pub fn publish(&self, event: Event) -> Result<RouteOutcome, CoreError> {
        self.ensure_open()?;
        self.inner.router.route(Arc::new(event))
    }

    /// The last `limit` routed events, oldest first.
    pub fn recent_events(&self, limit: usize) -> Vec<Arc<Event>> {
        self.inner.router.recent_events(limit)
    }

    // ── Submission API ───────────────────────────────────────────────

    /// Record a submission, confirm it to the submitter, and announce a
    /// consensus shift if it caused one.
    pub fn submit(
        &self,
        topic: impl Into<TopicId>,
        recipient: impl Into<RecipientId>,
        choice: &str,
        confidence: f64,
    ) -> Result<SubmitOutcome, CoreError> {
        self.ensure_open()?;
        let topic = topic.into();
        let recipient = recipient.into();
        let outcome = self
            .inner
            .consensus
            .submit(&topic, &recipient, choice, confidence)?;

        let confirmation = Notification::new(
            recipient.clone(),
            NotificationCategory::SubmissionConfirmation,
            "Submission received",
            format!("Your pick {choice} ({confidence:.0}% confidence) was recorded for {topic}."),
        );
        if let Err(e) = self.inner.notifications.notify(confirmation) {
            warn!(recipient = %recipient, error = %e, "confirmation not sent");
        }

        if let Some(shift) = &outcome.shift {
            self.announce_shift(shift);
        }
        Ok(outcome)
    }

    fn announce_shift(&self, shift: &ConsensusShift) {
        let event = Event::new(
            convert::consensus_channel(&shift.topic),
            EventPayload::ConsensusShift(shift.clone()),
        )
        .with_entity(shift.topic.as_str());
        if let Err(e) = self.inner.router.route(Arc::new(event)) {
            warn!(topic = %shift.topic, error = %e, "shift event not routed");
        }

        let body = format!(
            "Majority is now {} with {:.1}% mean confidence (was {:.1}%).",
            shift.majority, shift.mean_confidence, shift.previous_mean_confidence
        );
        let participants = self.inner.consensus.participants(&shift.topic);
        self.inner.notifications.notify_all(&participants, |r| {
            Notification::new(
                r.clone(),
                NotificationCategory::ConsensusShift,
                format!("Consensus shifted on {}", shift.topic),
                body.clone(),
            )
        });
    }

    pub fn consensus(&self, topic: &TopicId) -> Option<ConsensusSnapshot> {
        self.inner.consensus.snapshot(topic)
    }

    pub fn close_topic(&self, topic: &TopicId) -> Result<ConsensusSnapshot, CoreError> {
        self.inner.consensus.close_topic(topic)
    }

    // ── Notification API ─────────────────────────────────────────────

    pub fn notify(&self, notification: Notification) -> Result<NotificationId, CoreError> {
        self.ensure_open()?;
        self.inner.notifications.notify(notification)
    }

    pub fn get_pending(&self, recipient: &RecipientId) -> Vec<Notification> {
        self.inner.notifications.get_pending(recipient)
    }

    pub fn mark_read(&self, id: NotificationId) -> Result<(), CoreError> {
        self.inner.notifications.mark_read(id)
    }

    pub fn dismiss(&self, id: NotificationId) -> Result<(), CoreError> {
        self.inner.notifications.dismiss(id)
    }

    /// Run the expiry/retry sweep now instead of waiting for the timer.
    pub fn sweep_notifications(&self) -> SweepReport {
        self.inner.notifications.sweep(chrono::Utc::now())
    }

    // ── Metrics ──────────────────────────────────────────────────────

    pub fn get_metrics(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            active_recipients: inner.sessions.len(),
            buffered_events: inner.buffer.buffered_events(),
            delivered_count: inner.metrics.delivered_events(),
            reconnect_count: inner.connection.reconnect_count(),
            engagement_score: inner.metrics.engagement_score(),
        }
    }

    // ── Snapshots ────────────────────────────────────────────────────

    /// Current upstream value for `key`, served from cache when possible.
    pub async fn snapshot(&self, key: &str) -> Result<Option<serde_json::Value>, CoreError> {
        let mut values = self.snapshots(&[key.to_owned()]).await?;
        Ok(values.remove(key))
    }

    /// Values for `keys`. Fresh entries come from cache; stale ones are
    /// served and refreshed in the background; missing ones are fetched
    /// in a single upstream request. Unknown keys are absent from the map.
    pub async fn snapshots(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, serde_json::Value>, CoreError> {
        let client = self.inner.snapshots.as_ref().ok_or_else(|| CoreError::Config {
            message: "no snapshot endpoint configured".into(),
        })?;

        let mut values = HashMap::new();
        let mut missing = Vec::new();
        let mut stale = Vec::new();
        for key in keys {
            match self.inner.snapshot_cache.lookup(key) {
                Lookup::Fresh(v) => {
                    values.insert(key.clone(), v);
                }
                Lookup::Stale(v) => {
                    values.insert(key.clone(), v);
                    if self.inner.refreshing.insert(key.clone()) {
                        stale.push(key.clone());
                    }
                }
                Lookup::Missing => missing.push(key.clone()),
            }
        }

        if !stale.is_empty() {
            let inner = Arc::clone(&self.inner);
            let client = client.clone();
            tokio::spawn(async move {
                if let Err(e) = fetch_into_cache(&inner, &client, &stale).await {
                    warn!(keys = stale.len(), error = %e, "background snapshot refresh failed");
                }
                for key in &stale {
                    inner.refreshing.remove(key);
                }
            });
        }

        if !missing.is_empty() {
            for (key, value) in fetch_into_cache(&self.inner, client, &missing).await? {
                values.insert(key, value);
            }
        }
        Ok(values)
    }
}

async fn fetch_into_cache(
    inner: &EngineInner,
    client: &SnapshotClient,
    keys: &[String],
) -> Result<Vec<(String, serde_json::Value)>, CoreError> {
    let entries = client.fetch(keys).await?;
    debug!(requested = keys.len(), received = entries.len(), "snapshot fetched");
    Ok(entries
        .into_iter()
        .map(|entry| {
            inner.snapshot_cache.set(
                entry.key.clone(),
                entry.value.clone(),
                inner.config.snapshot_ttl,
            );
            (entry.key, entry.value)
        })
        .collect())
}

// ── Link workers ─────────────────────────────────────────────────────

/// Feed events → domain events → router.
async fn bridge_feed(
    mut events: broadcast::Receiver<Arc<fanout_api::FeedEvent>>,
    router: Arc<Router>,
    impact: Option<Arc<dyn ImpactAssessor>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            result = events.recv() => match result {
                Ok(feed_event) => {
                    let event = convert::event_from_feed(&feed_event, impact.as_deref());
                    if let Err(e) = router.route(Arc::new(event)) {
                        warn!(
                            channel = %feed_event.channel,
                            kind = %feed_event.event_type,
                            error = %e,
                            "upstream event rejected"
                        );
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "feed bridge lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!("feed bridge stopped");
}

/// Mirror feed status into the engine state; tell everyone when the link
/// gives up and when it comes back.
async fn watch_link(
    mut status: watch::Receiver<FeedStatus>,
    connection: Arc<ConnectionManager>,
    router: Arc<Router>,
    notifications: Arc<NotificationPipeline>,
    sessions: Arc<SessionTable>,
    cancel: CancellationToken,
) {
    // The feed task may not have run yet; keep the manager's Connecting.
    let mut previous = ConnectionState::from(&*status.borrow_and_update());
    if previous != ConnectionState::Disconnected {
        connection.publish(previous.clone());
    }

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = ConnectionState::from(&*status.borrow_and_update());
                if state == previous {
                    continue;
                }
                connection.publish(state.clone());

                match &state {
                    ConnectionState::Failed { attempts, reason } => {
                        warn!(attempts, reason = %reason, "upstream link failed");
                        broadcast_status(&router, "failed");
                        let recipients = sessions.recipients();
                        let body = format!(
                            "Live updates stopped after {attempts} failed connection attempts: {reason}"
                        );
                        notifications.notify_all(&recipients, |r| {
                            Notification::new(
                                r.clone(),
                                NotificationCategory::ConnectionFailure,
                                "Live updates unavailable",
                                body.clone(),
                            )
                            .with_severity(Severity::Critical)
                        });
                    }
                    ConnectionState::Connected
                        if matches!(previous, ConnectionState::Backoff { .. } | ConnectionState::Failed { .. }) =>
                    {
                        info!("upstream link restored");
                        broadcast_status(&router, "connected");
                    }
                    _ => {}
                }
                previous = state;
            }
        }
    }
    debug!("link watcher stopped");
}

fn broadcast_status(router: &Router, state: &str) {
    let event = Event::new(
        CONNECTION_CHANNEL,
        EventPayload::ConnectionStatus {
            state: state.to_owned(),
        },
    )
    .with_scope(BroadcastScope::All);
    if let Err(e) = router.route(Arc::new(event)) {
        warn!(error = %e, "connection status not routed");
    }
}
