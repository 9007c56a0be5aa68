// Batch snapshot client for the upstream REST surface.
//
// Fetches last-known values for a set of keys in one request. Every
// request is bounded by the configured timeout and fails rather than
// hanging.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;

/// Transport settings for the snapshot client.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Upper bound on a whole request, connect to last byte. Default: 10s.
    pub timeout: Duration,
    /// Bearer token for the snapshot endpoint.
    pub token: Option<SecretString>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            token: None,
        }
    }
}

/// One key/value pair returned by the snapshot endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SnapshotRequest<'a> {
    keys: &'a [String],
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    #[serde(default)]
    entries: Vec<SnapshotEntry>,
}

/// Client for `POST {endpoint}` batch snapshot requests.
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    http: reqwest::Client,
    endpoint: Url,
    config: SnapshotConfig,
}

impl SnapshotClient {
    pub fn new(endpoint: Url, config: SnapshotConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("fanout/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self::with_client(http, endpoint, config))
    }

    /// Build around an existing `reqwest::Client` (tests, shared pools).
    pub fn with_client(http: reqwest::Client, endpoint: Url, config: SnapshotConfig) -> Self {
        Self {
            http,
            endpoint,
            config,
        }
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Fetch the current values for `keys`.
    ///
    /// Keys the upstream does not know are simply absent from the result.
    pub async fn fetch(&self, keys: &[String]) -> Result<Vec<SnapshotEntry>, Error> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self
            .http
            .post(self.endpoint.clone())
            .timeout(self.config.timeout)
            .json(&SnapshotRequest { keys });
        if let Some(ref token) = self.config.token {
            request = request.bearer_auth(token.expose_secret());
        }

        tracing::debug!(endpoint = %self.endpoint, keys = keys.len(), "fetching snapshot");
        let response = request.send().await.map_err(|e| self.map_send_error(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::Authentication {
                message: format!("snapshot endpoint returned HTTP {status}"),
            });
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await.map_err(|e| self.map_send_error(e))?;
        let parsed: SnapshotResponse =
            serde_json::from_str(&body).map_err(|e| Error::Deserialization {
                message: e.to_string(),
                body,
            })?;
        Ok(parsed.entries)
    }

    fn map_send_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout {
                timeout_secs: self.config.timeout.as_secs(),
            }
        } else {
            Error::Transport(err)
        }
    }
}
