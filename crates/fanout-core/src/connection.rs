// ── Connection manager ──
//
// Owns the single upstream feed link. The feed itself (backoff,
// heartbeat, handshake timeout) lives in `fanout_api::FeedHandle`; this
// layer scopes it to a child cancellation token, mirrors its status into
// the engine's `ConnectionState`, and keeps a reconnect total that
// survives disconnect/connect cycles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use fanout_api::{FeedConfig, FeedCredentials, FeedEvent, FeedHandle, FeedStatus};
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::CoreError;

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// `attempt` counts consecutive tries from 1, as the feed does.
    Connecting { attempt: u32 },
    Connected,
    /// Waiting `delay` before reconnect attempt `attempt`.
    Backoff { attempt: u32, delay: Duration },
    /// Gave up; only `reset` starts a new round of attempts.
    Failed { attempts: u32, reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected => "connected",
            Self::Backoff { .. } => "backoff",
            Self::Failed { .. } => "failed",
        }
    }
}

impl From<&FeedStatus> for ConnectionState {
    fn from(status: &FeedStatus) -> Self {
        match status {
            FeedStatus::Disconnected => Self::Disconnected,
            FeedStatus::Connecting { attempt } => Self::Connecting { attempt: *attempt },
            FeedStatus::Connected => Self::Connected,
            FeedStatus::Backoff { attempt, delay } => Self::Backoff {
                attempt: *attempt,
                delay: *delay,
            },
            FeedStatus::Failed { attempts, reason } => Self::Failed {
                attempts: *attempts,
                reason: reason.clone(),
            },
        }
    }
}

struct Link {
    endpoint: Url,
    feed: FeedHandle,
    cancel: CancellationToken,
}

/// Receivers for one live link, consumed by the engine's worker tasks.
pub struct LinkChannels {
    pub events: broadcast::Receiver<Arc<FeedEvent>>,
    pub status: watch::Receiver<FeedStatus>,
    /// Cancelled when this link is torn down.
    pub cancel: CancellationToken,
}

pub struct ConnectionManager {
    config: FeedConfig,
    link: Mutex<Option<Link>>,
    state: watch::Sender<ConnectionState>,
    /// Reconnects counted by links that have since been torn down.
    retired_reconnects: AtomicU64,
}

impl ConnectionManager {
    pub fn new(config: FeedConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            config,
            link: Mutex::new(None),
            state,
            retired_reconnects: AtomicU64::new(0),
        }
    }

    /// Start a link to `endpoint`, replacing any existing one.
    ///
    /// Returns as soon as the background connection loop is running.
    pub fn connect(
        &self,
        endpoint: Url,
        credentials: FeedCredentials,
        parent: &CancellationToken,
    ) -> Result<LinkChannels, CoreError> {
        self.disconnect();

        let cancel = parent.child_token();
        let feed = FeedHandle::connect(
            endpoint.clone(),
            credentials,
            self.config.clone(),
            cancel.clone(),
        )?;
        let channels = LinkChannels {
            events: feed.subscribe(),
            status: feed.status(),
            cancel: cancel.clone(),
        };

        info!(endpoint = %endpoint, "upstream link starting");
        self.state.send_replace(ConnectionState::Connecting { attempt: 1 });
        *self.link.lock() = Some(Link {
            endpoint,
            feed,
            cancel,
        });
        Ok(channels)
    }

    /// Tear the link down. No-op when not connected.
    pub fn disconnect(&self) {
        let Some(link) = self.link.lock().take() else {
            return;
        };
        self.retired_reconnects
            .fetch_add(link.feed.reconnect_count(), Ordering::Relaxed);
        link.feed.shutdown();
        link.cancel.cancel();
        self.state.send_replace(ConnectionState::Disconnected);
        info!(endpoint = %link.endpoint, "upstream link closed");
    }

    /// Leave `Failed` and start a fresh round of attempts.
    pub fn reset(&self) -> Result<(), CoreError> {
        let guard = self.link.lock();
        let link = guard.as_ref().ok_or(CoreError::Disconnected)?;
        debug!(endpoint = %link.endpoint, "upstream link reset");
        link.feed.reset();
        Ok(())
    }

    /// Resolve once the current link is connected; fail if it gives up.
    pub async fn wait_connected(&self) -> Result<(), CoreError> {
        let mut status = {
            let guard = self.link.lock();
            guard.as_ref().ok_or(CoreError::Disconnected)?.feed.status()
        };
        let reached = status
            .wait_for(|s| s.is_connected() || s.is_failed())
            .await
            .map_err(|_| CoreError::Disconnected)?
            .clone();
        match reached {
            FeedStatus::Failed { attempts, .. } => Err(CoreError::RetriesExhausted { attempts }),
            _ => Ok(()),
        }
    }

    pub(crate) fn publish(&self, state: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn endpoint(&self) -> Option<Url> {
        self.link.lock().as_ref().map(|l| l.endpoint.clone())
    }

    /// Successful reconnections across every link this manager has run.
    pub fn reconnect_count(&self) -> u64 {
        let live = self
            .link
            .lock()
            .as_ref()
            .map_or(0, |l| l.feed.reconnect_count());
        self.retired_reconnects.load(Ordering::Relaxed) + live
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn feed_status_maps_one_to_one() {
        let failed = FeedStatus::Failed {
            attempts: 5,
            reason: "refused".into(),
        };
        assert_eq!(
            ConnectionState::from(&failed),
            ConnectionState::Failed {
                attempts: 5,
                reason: "refused".into()
            }
        );
        let backoff = FeedStatus::Backoff {
            attempt: 2,
            delay: Duration::from_secs(2),
        };
        assert_eq!(ConnectionState::from(&backoff).label(), "backoff");
    }

    #[tokio::test]
    async fn non_websocket_endpoint_is_rejected() {
        let manager = ConnectionManager::new(FeedConfig::default());
        let result = manager.connect(
            Url::parse("http://localhost/feed").unwrap(),
            FeedCredentials::default(),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(CoreError::ConnectionFailed { .. })));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn reset_without_link_is_an_error() {
        let manager = ConnectionManager::new(FeedConfig::default());
        assert!(matches!(manager.reset(), Err(CoreError::Disconnected)));
        assert!(matches!(
            manager.wait_connected().await,
            Err(CoreError::Disconnected)
        ));
        assert_eq!(manager.reconnect_count(), 0);
    }

    #[test]
    fn publish_skips_duplicates() {
        let manager = ConnectionManager::new(FeedConfig::default());
        let mut rx = manager.watch();
        manager.publish(ConnectionState::Disconnected);
        assert!(!rx.has_changed().unwrap());
        manager.publish(ConnectionState::Connected);
        assert!(rx.has_changed().unwrap());
    }
}
