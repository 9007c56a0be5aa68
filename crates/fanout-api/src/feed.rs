//! Upstream event feed with auto-reconnect and heartbeat liveness.
//!
//! Connects to the upstream WebSocket endpoint and streams parsed events
//! through a [`tokio::sync::broadcast`] channel. Reconnection uses capped
//! exponential backoff; after `max_attempts` consecutive failures the feed
//! parks in [`FeedStatus::Failed`] until [`FeedHandle::reset`] is called.
//!
//! # Example
//!
//! ```rust,ignore
//! use fanout_api::feed::{FeedConfig, FeedCredentials, FeedHandle};
//! use tokio_util::sync::CancellationToken;
//! use url::Url;
//!
//! let url = Url::parse("wss://feed.example.com/v1/stream")?;
//! let handle = FeedHandle::connect(url, FeedCredentials::default(), FeedConfig::default(), CancellationToken::new())?;
//! handle.wait_connected().await?;
//!
//! let mut rx = handle.subscribe();
//! while let Ok(event) = rx.recv().await {
//!     println!("{} on {}", event.event_type, event.channel);
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;

// ── Broadcast channel capacity ───────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Frame types that only prove liveness and carry no data.
const HEARTBEAT_TYPES: &[&str] = &["heartbeat_ack", "pong"];

// ── FeedEvent ────────────────────────────────────────────────────────

/// A typed event received from the upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    /// Event type tag, e.g. `"score_update"`, `"injury_report"`.
    #[serde(rename = "type")]
    pub event_type: String,

    /// Routing channel, e.g. `"game:42"`.
    #[serde(default)]
    pub channel: String,

    /// Entity the event concerns, if any.
    #[serde(default, rename = "entityId", alias = "entity_id")]
    pub entity_id: Option<String>,

    /// Event body. Shape depends on `event_type`.
    #[serde(default)]
    pub payload: serde_json::Value,
}

// ── Credentials ──────────────────────────────────────────────────────

/// Authentication material for the upstream handshake.
#[derive(Debug, Clone, Default)]
pub struct FeedCredentials {
    /// Bearer token sent in the `Authorization` header.
    pub token: Option<SecretString>,

    /// Extra query parameters appended to the endpoint URL.
    pub params: Vec<(String, String)>,
}

impl FeedCredentials {
    /// Endpoint URL with the auth query parameters applied.
    pub fn apply(&self, endpoint: &Url) -> Url {
        let mut url = endpoint.clone();
        if !self.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in &self.params {
                pairs.append_pair(key, value);
            }
        }
        url
    }
}

// ── Configuration ────────────────────────────────────────────────────

/// Exponential backoff configuration for feed reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 10s.
    pub max_delay: Duration,

    /// Consecutive failures before the feed enters `Failed`.
    /// `None` means retry forever. Default: 5.
    pub max_attempts: Option<u32>,

    /// Bound on a single handshake. Default: 10s.
    pub connect_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_attempts: Some(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Heartbeat configuration while connected.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats. Default: 30s.
    pub interval: Duration,

    /// Consecutive silent intervals that mark the connection dead. Default: 2.
    pub missed_limit: u32,

    /// Text heartbeat to send. `None` sends a WebSocket ping frame.
    pub message: Option<String>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            missed_limit: 2,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedConfig {
    pub reconnect: ReconnectConfig,
    pub heartbeat: HeartbeatConfig,
}

// ── FeedStatus ───────────────────────────────────────────────────────

/// Observable lifecycle of the feed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Disconnected,
    /// `attempt` counts consecutive tries from 1.
    Connecting { attempt: u32 },
    Connected,
    Backoff { attempt: u32, delay: Duration },
    Failed { attempts: u32, reason: String },
}

impl FeedStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

// ── FeedHandle ───────────────────────────────────────────────────────

/// Handle to a running feed connection.
///
/// Call [`shutdown`](Self::shutdown) to tear down the background task.
pub struct FeedHandle {
    event_tx: broadcast::Sender<Arc<FeedEvent>>,
    status_rx: watch::Receiver<FeedStatus>,
    cancel: CancellationToken,
    reset: Arc<Notify>,
    reconnects: Arc<AtomicU64>,
}

impl FeedHandle {
    /// Spawn the connection loop for `endpoint`.
    ///
    /// Returns immediately; the first handshake happens in the background.
    /// Use [`wait_connected`](Self::wait_connected) to await it.
    pub fn connect(
        endpoint: Url,
        credentials: FeedCredentials,
        config: FeedConfig,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::WebSocketConnect(format!(
                "unsupported scheme '{}' (expected ws or wss)",
                endpoint.scheme()
            )));
        }

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(FeedStatus::Disconnected);
        let reset = Arc::new(Notify::new());
        let reconnects = Arc::new(AtomicU64::new(0));

        let ctx = FeedContext {
            url: credentials.apply(&endpoint),
            token: credentials.token,
            config,
            event_tx: event_tx.clone(),
            status_tx,
            cancel: cancel.clone(),
            reset: Arc::clone(&reset),
            reconnects: Arc::clone(&reconnects),
            connected_once: AtomicBool::new(false),
        };
        tokio::spawn(feed_loop(ctx));

        Ok(Self {
            event_tx,
            status_rx,
            cancel,
            reset,
            reconnects,
        })
    }

    /// Get a new receiver for the event stream.
    ///
    /// A consumer that falls behind receives
    /// [`broadcast::error::RecvError::Lagged`].
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<FeedEvent>> {
        self.event_tx.subscribe()
    }

    /// Watch the connection lifecycle.
    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.status_rx.clone()
    }

    /// Resolve once connected, or fail once the feed gives up.
    pub async fn wait_connected(&self) -> Result<(), Error> {
        let mut rx = self.status_rx.clone();
        let status = rx
            .wait_for(|s| s.is_connected() || s.is_failed())
            .await
            .map_err(|_| Error::WebSocketConnect("feed task stopped".into()))?
            .clone();
        match status {
            FeedStatus::Failed { attempts, .. } => Err(Error::RetriesExhausted { attempts }),
            _ => Ok(()),
        }
    }

    /// Number of successful connections after the first one.
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Leave the `Failed` state and start a fresh round of attempts.
    pub fn reset(&self) {
        self.reset.notify_one();
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background reconnection loop ─────────────────────────────────────

struct FeedContext {
    url: Url,
    token: Option<SecretString>,
    config: FeedConfig,
    event_tx: broadcast::Sender<Arc<FeedEvent>>,
    status_tx: watch::Sender<FeedStatus>,
    cancel: CancellationToken,
    reset: Arc<Notify>,
    reconnects: Arc<AtomicU64>,
    connected_once: AtomicBool,
}

impl FeedContext {
    fn set_status(&self, status: FeedStatus) {
        self.status_tx.send_replace(status);
    }
}

/// How a session that got past the handshake ended.
enum SessionEnd {
    Cancelled,
    Lost(Error),
}

/// Main loop: connect → read → on failure, backoff → reconnect.
async fn feed_loop(ctx: FeedContext) {
    let reconnect = ctx.config.reconnect.clone();
    let mut failures: u32 = 0;

    loop {
        ctx.set_status(FeedStatus::Connecting {
            attempt: failures.saturating_add(1),
        });

        let outcome = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            result = connect_and_read(&ctx) => result,
        };

        let error = match outcome {
            Ok(SessionEnd::Cancelled) => break,
            // The handshake succeeded, so the counter restarted at zero.
            Ok(SessionEnd::Lost(e)) => {
                failures = 1;
                e
            }
            Err(e) => {
                failures = failures.saturating_add(1);
                e
            }
        };
        tracing::warn!(error = %error, attempt = failures, "Feed connection failed");

        if reconnect.max_attempts.is_some_and(|max| failures >= max) {
            tracing::error!(attempts = failures, "Feed reconnection limit reached, giving up");
            ctx.set_status(FeedStatus::Failed {
                attempts: failures,
                reason: error.to_string(),
            });

            tokio::select! {
                biased;
                () = ctx.cancel.cancelled() => break,
                () = ctx.reset.notified() => {
                    tracing::info!("Feed reset requested, reconnecting");
                    failures = 0;
                    continue;
                }
            }
        }

        let delay = backoff_delay(failures - 1, &reconnect);
        tracing::info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = failures,
            "Waiting before reconnect"
        );
        ctx.set_status(FeedStatus::Backoff {
            attempt: failures,
            delay,
        });

        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }

    ctx.set_status(FeedStatus::Disconnected);
    tracing::debug!("Feed loop exiting");
}

// ── Single connection lifecycle ──────────────────────────────────────

/// Perform one handshake and read frames until the connection drops.
///
/// `Err` means the handshake itself failed; a dropped session after a
/// successful handshake comes back as [`SessionEnd::Lost`].
async fn connect_and_read(ctx: &FeedContext) -> Result<SessionEnd, Error> {
    tracing::info!(url = %ctx.url, "Connecting to upstream feed");

    let uri: tungstenite::http::Uri = ctx
        .url
        .as_str()
        .parse()
        .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

    let mut request = ClientRequestBuilder::new(uri);
    if let Some(ref token) = ctx.token {
        request = request.with_header("Authorization", format!("Bearer {}", token.expose_secret()));
    }

    let connect_timeout = ctx.config.reconnect.connect_timeout;
    let (ws_stream, _response) =
        tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| Error::Timeout {
                timeout_secs: connect_timeout.as_secs(),
            })?
            .map_err(map_handshake_error)?;

    if ctx.connected_once.swap(true, Ordering::Relaxed) {
        ctx.reconnects.fetch_add(1, Ordering::Relaxed);
    }
    ctx.set_status(FeedStatus::Connected);
    tracing::info!("Upstream feed connected");

    let (mut write, mut read) = ws_stream.split();

    let heartbeat = &ctx.config.heartbeat;
    let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat.interval, heartbeat.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut liveness = Liveness::new(heartbeat.missed_limit);

    loop {
        tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                let _ = write.send(tungstenite::Message::Close(None)).await;
                return Ok(SessionEnd::Cancelled);
            }
            _ = ticker.tick() => {
                if !liveness.on_tick() {
                    return Ok(SessionEnd::Lost(Error::HeartbeatTimeout {
                        missed: liveness.missed(),
                    }));
                }
                let beat = match heartbeat.message {
                    Some(ref text) => tungstenite::Message::Text(text.clone().into()),
                    None => tungstenite::Message::Ping(Default::default()),
                };
                if let Err(e) = write.send(beat).await {
                    return Ok(SessionEnd::Lost(Error::WebSocketConnect(e.to_string())));
                }
                tracing::trace!("Heartbeat sent");
            }
            frame = read.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        liveness.record_traffic();
                        parse_and_broadcast(text.as_str(), &ctx.event_tx);
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                            .unwrap_or((1005, String::new()));
                        tracing::info!(code, reason = %reason, "Feed close frame received");
                        return Ok(SessionEnd::Lost(Error::WebSocketClosed { code, reason }));
                    }
                    Some(Ok(_)) => {
                        // Ping, Pong, Binary: traffic, but nothing to parse
                        liveness.record_traffic();
                    }
                    Some(Err(e)) => {
                        return Ok(SessionEnd::Lost(Error::WebSocketConnect(e.to_string())));
                    }
                    None => {
                        tracing::info!("Feed stream ended");
                        return Ok(SessionEnd::Lost(Error::WebSocketClosed {
                            code: 1006,
                            reason: "stream ended".into(),
                        }));
                    }
                }
            }
        }
    }
}

fn map_handshake_error(err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(ref response)
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Error::Authentication {
                message: format!("handshake rejected with HTTP {}", response.status()),
            }
        }
        other => Error::WebSocketConnect(other.to_string()),
    }
}

// ── Heartbeat liveness ───────────────────────────────────────────────

/// Counts heartbeat intervals that passed without any inbound traffic.
#[derive(Debug)]
pub(crate) struct Liveness {
    seen_since_tick: bool,
    missed: u32,
    limit: u32,
}

impl Liveness {
    pub(crate) fn new(limit: u32) -> Self {
        Self {
            seen_since_tick: false,
            missed: 0,
            limit: limit.max(1),
        }
    }

    pub(crate) fn record_traffic(&mut self) {
        self.seen_since_tick = true;
        self.missed = 0;
    }

    /// Close out one interval. Returns `false` once the connection is dead.
    pub(crate) fn on_tick(&mut self) -> bool {
        if std::mem::take(&mut self.seen_since_tick) {
            self.missed = 0;
        } else {
            self.missed += 1;
        }
        self.missed < self.limit
    }

    pub(crate) fn missed(&self) -> u32 {
        self.missed
    }
}

// ── Message parsing ──────────────────────────────────────────────────

/// Parse a text frame into events. A frame is one event object or an
/// array of them; heartbeat acknowledgements yield nothing.
pub(crate) fn parse_frame(text: &str) -> Result<Vec<FeedEvent>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let items = match value {
        serde_json::Value::Array(items) => items,
        single => vec![single],
    };

    let mut events = Vec::with_capacity(items.len());
    for item in items {
        let event: FeedEvent = serde_json::from_value(item)?;
        if HEARTBEAT_TYPES.contains(&event.event_type.as_str()) {
            continue;
        }
        events.push(event);
    }
    Ok(events)
}

/// Parse a text frame and broadcast any events found inside.
fn parse_and_broadcast(text: &str, event_tx: &broadcast::Sender<Arc<FeedEvent>>) -> usize {
    let events = match parse_frame(text) {
        Ok(events) => events,
        Err(e) => {
            tracing::debug!(error = %e, "Failed to parse feed frame");
            return 0;
        }
    };

    let count = events.len();
    for event in events {
        // Ignore send errors -- just means no active subscribers right now
        let _ = event_tx.send(Arc::new(event));
    }
    count
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Capped exponential backoff without jitter.
///
/// `delay = min(initial * 2^attempt, max)`, so the sequence over
/// increasing `attempt` is non-decreasing.
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| config.initial_delay.checked_mul(factor))
        .map_or(config.max_delay, |delay| delay.min(config.max_delay))
}

// ── Tests ────────────────────────────────────────────────────────────
