#![allow(clippy::unwrap_used)]
// Integration tests for `SnapshotClient` using wiremock.

use std::time::Duration;

use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fanout_api::{Error, SnapshotClient, SnapshotConfig, SnapshotEntry};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup(config: SnapshotConfig) -> (MockServer, SnapshotClient) {
    let server = MockServer::start().await;
    let endpoint = Url::parse(&format!("{}/v1/snapshot", server.uri())).unwrap();
    let client = SnapshotClient::new(endpoint, config).unwrap();
    (server, client)
}

fn keys(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_fetch_returns_entries() {
    let (server, client) = setup(SnapshotConfig::default()).await;

    Mock::given(method("POST"))
        .and(path("/v1/snapshot"))
        .and(body_json(json!({ "keys": ["game:42", "game:43"] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "entries": [
                { "key": "game:42", "value": { "home": 2, "away": 1 } }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let entries = client.fetch(&keys(&["game:42", "game:43"])).await.unwrap();
    assert_eq!(
        entries,
        vec![SnapshotEntry {
            key: "game:42".into(),
            value: json!({ "home": 2, "away": 1 }),
        }]
    );
}

#[tokio::test]
async fn test_empty_key_list_skips_request() {
    let (server, client) = setup(SnapshotConfig::default()).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    assert!(client.fetch(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
    let config = SnapshotConfig {
        token: Some("s3cret".to_string().into()),
        ..SnapshotConfig::default()
    };
    let (server, client) = setup(config).await;

    Mock::given(method("POST"))
        .and(header("authorization", "Bearer s3cret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "entries": [] })))
        .expect(1)
        .mount(&server)
        .await;

    client.fetch(&keys(&["k"])).await.unwrap();
}

#[tokio::test]
async fn test_slow_upstream_times_out() {
    let config = SnapshotConfig {
        timeout: Duration::from_millis(100),
        token: None,
    };
    let (server, client) = setup(config).await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "entries": [] }))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let result = client.fetch(&keys(&["game:1"])).await;
    assert!(
        matches!(result, Err(Error::Timeout { .. })),
        "expected Timeout, got: {result:?}"
    );
}

#[tokio::test]
async fn test_unauthorized_maps_to_authentication() {
    let (server, client) = setup(SnapshotConfig::default()).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let result = client.fetch(&keys(&["game:1"])).await;
    assert!(matches!(result, Err(Error::Authentication { .. })));
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let (server, client) = setup(SnapshotConfig::default()).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let err = client.fetch(&keys(&["game:1"])).await.unwrap_err();
    assert!(matches!(err, Error::Http { status: 503, .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_malformed_body_keeps_raw_text() {
    let (server, client) = setup(SnapshotConfig::default()).await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    match client.fetch(&keys(&["game:1"])).await {
        Err(Error::Deserialization { body, .. }) => assert_eq!(body, "<html>oops</html>"),
        other => panic!("expected Deserialization error, got: {other:?}"),
    }
}
