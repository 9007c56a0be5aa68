#![allow(clippy::unwrap_used)]
// Integration tests for `FeedHandle` against a local WebSocket server.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use fanout_api::{Error, FeedConfig, FeedCredentials, FeedHandle, FeedStatus, HeartbeatConfig, ReconnectConfig};

// ── Helpers ─────────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(5);

/// Start a server that runs `handler` for every accepted connection.
/// The handler receives the raw TCP stream and the connection index.
async fn spawn_server<F, Fut>(handler: F) -> Url
where
    F: Fn(TcpStream, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);
    let counter = Arc::new(AtomicUsize::new(0));

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(handler(stream, index));
        }
    });

    Url::parse(&format!("ws://{addr}/stream")).unwrap()
}

async fn accept(stream: TcpStream) -> WebSocketStream<TcpStream> {
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Keep reading so ping frames get answered, until the peer goes away.
async fn drain(mut ws: WebSocketStream<TcpStream>) {
    while let Some(Ok(_)) = ws.next().await {}
}

fn fast_config(max_attempts: Option<u32>) -> FeedConfig {
    FeedConfig {
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts,
            connect_timeout: Duration::from_secs(2),
        },
        heartbeat: HeartbeatConfig {
            interval: Duration::from_secs(30),
            ..HeartbeatConfig::default()
        },
    }
}

async fn wait_status(handle: &FeedHandle, pred: impl FnMut(&FeedStatus) -> bool) -> FeedStatus {
    let mut rx = handle.status();
    tokio::time::timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("status change timed out")
        .unwrap()
        .clone()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_events_are_broadcast() {
    let url = spawn_server(|stream, _| async move {
        let mut ws = accept(stream).await;
        let frame = serde_json::json!({
            "type": "score_update",
            "channel": "game:42",
            "entityId": "42",
            "payload": { "home": 3, "away": 1 }
        });
        ws.send(Message::Text(frame.to_string().into())).await.unwrap();
        drain(ws).await;
    })
    .await;

    let cancel = CancellationToken::new();
    let handle = FeedHandle::connect(url, FeedCredentials::default(), fast_config(Some(5)), cancel.clone()).unwrap();
    let mut rx = handle.subscribe();

    handle.wait_connected().await.unwrap();
    let event = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_type, "score_update");
    assert_eq!(event.channel, "game:42");
    assert_eq!(event.payload["home"], 3);

    handle.shutdown();
}

#[tokio::test]
async fn test_reconnects_after_server_close() {
    let url = spawn_server(|stream, index| async move {
        let mut ws = accept(stream).await;
        if index == 0 {
            ws.close(None).await.unwrap();
            return;
        }
        drain(ws).await;
    })
    .await;

    let handle = FeedHandle::connect(url, FeedCredentials::default(), fast_config(Some(5)), CancellationToken::new()).unwrap();

    let backoff = wait_status(&handle, |s| matches!(s, FeedStatus::Backoff { .. })).await;
    assert_eq!(
        backoff,
        FeedStatus::Backoff {
            attempt: 1,
            delay: Duration::from_millis(20)
        },
        "a dropped session restarts the schedule at the base delay"
    );

    wait_status(&handle, FeedStatus::is_connected).await;
    assert_eq!(handle.reconnect_count(), 1);
    handle.shutdown();
}

#[tokio::test]
async fn test_first_try_is_attempt_one() {
    // Accept TCP but never answer the handshake, so the feed stays connecting.
    let url = spawn_server(|stream, _| async move {
        tokio::time::sleep(WAIT).await;
        drop(stream);
    })
    .await;

    let handle = FeedHandle::connect(url, FeedCredentials::default(), fast_config(Some(3)), CancellationToken::new()).unwrap();

    let status = wait_status(&handle, |s| matches!(s, FeedStatus::Connecting { .. })).await;
    assert_eq!(status, FeedStatus::Connecting { attempt: 1 });
    handle.shutdown();
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    // Reserve a port, then free it so every connect is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = Url::parse(&format!("ws://{addr}/stream")).unwrap();

    let handle = FeedHandle::connect(url, FeedCredentials::default(), fast_config(Some(3)), CancellationToken::new()).unwrap();

    let result = tokio::time::timeout(WAIT, handle.wait_connected()).await.unwrap();
    assert!(
        matches!(result, Err(Error::RetriesExhausted { attempts: 3 })),
        "expected RetriesExhausted, got: {result:?}"
    );
    handle.shutdown();
}

#[tokio::test]
async fn test_reset_leaves_failed_state() {
    let url = spawn_server(|stream, index| async move {
        if index == 0 {
            // Drop the socket before the handshake completes.
            drop(stream);
            return;
        }
        drain(accept(stream).await).await;
    })
    .await;

    let handle = FeedHandle::connect(url, FeedCredentials::default(), fast_config(Some(1)), CancellationToken::new()).unwrap();

    let failed = wait_status(&handle, FeedStatus::is_failed).await;
    assert!(matches!(failed, FeedStatus::Failed { attempts: 1, .. }));

    handle.reset();
    wait_status(&handle, FeedStatus::is_connected).await;
    handle.shutdown();
}

#[tokio::test]
async fn test_silent_connection_is_declared_dead() {
    let url = spawn_server(|stream, index| async move {
        let ws = accept(stream).await;
        if index == 0 {
            // Never read: pings go unanswered and no data is sent.
            tokio::time::sleep(Duration::from_secs(10)).await;
            drop(ws);
            return;
        }
        drain(ws).await;
    })
    .await;

    let mut config = fast_config(Some(5));
    config.heartbeat.interval = Duration::from_millis(50);

    let handle = FeedHandle::connect(url, FeedCredentials::default(), config, CancellationToken::new()).unwrap();
    handle.wait_connected().await.unwrap();

    let status = wait_status(&handle, |s| matches!(s, FeedStatus::Backoff { .. })).await;
    assert!(matches!(status, FeedStatus::Backoff { attempt: 1, .. }));
    handle.shutdown();
}

#[tokio::test]
async fn test_shutdown_reports_disconnected() {
    let url = spawn_server(|stream, _| async move {
        drain(accept(stream).await).await;
    })
    .await;

    let handle = FeedHandle::connect(url, FeedCredentials::default(), fast_config(Some(5)), CancellationToken::new()).unwrap();
    handle.wait_connected().await.unwrap();

    handle.shutdown();
    wait_status(&handle, |s| *s == FeedStatus::Disconnected).await;
}
