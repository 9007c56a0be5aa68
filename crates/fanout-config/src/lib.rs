//! Configuration for the fanout engine.
//!
//! One TOML file (platform config dir, or an explicit path) layered over
//! built-in defaults and under `FANOUT_`-prefixed environment variables,
//! translated into `fanout_core::EngineConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use fanout_core::{
    DEFAULT_SHIFT_THRESHOLD, EngineConfig, FeedConfig, FeedCredentials, HeartbeatConfig,
    ReconnectConfig,
};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub feed: FeedSection,

    #[serde(default)]
    pub snapshot: SnapshotSection,
}

/// Batching, dedup, consensus and notification tuning.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSection {
    pub batch_interval_ms: u64,
    pub max_batch_size: usize,
    pub max_buffered_events: usize,
    pub max_flush_retries: u32,
    pub session_capacity: usize,
    pub dedup_ttl_secs: u64,
    pub event_log_capacity: usize,
    pub shift_threshold: f64,
    pub sweep_interval_secs: u64,
    pub notification_retention_secs: u64,
    pub shutdown_grace_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            batch_interval_ms: 100,
            max_batch_size: 10,
            max_buffered_events: 1000,
            max_flush_retries: 3,
            session_capacity: 64,
            dedup_ttl_secs: 60,
            event_log_capacity: 100,
            shift_threshold: DEFAULT_SHIFT_THRESHOLD,
            sweep_interval_secs: 60,
            notification_retention_secs: 86_400,
            shutdown_grace_ms: 2000,
        }
    }
}

/// Upstream WebSocket feed.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedSection {
    /// Feed endpoint (e.g., "wss://feed.example.com/v1/stream").
    pub url: Option<String>,

    /// Bearer token in plaintext; prefer `token_env`.
    pub token: Option<String>,

    /// Environment variable name containing the bearer token.
    pub token_env: Option<String>,

    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Consecutive failures before giving up; 0 retries forever.
    pub max_attempts: u32,

    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_missed_limit: u32,

    /// Text heartbeat; a ping frame is sent when unset.
    pub heartbeat_message: Option<String>,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            token_env: None,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            max_attempts: 5,
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            heartbeat_missed_limit: 2,
            heartbeat_message: None,
        }
    }
}

/// Upstream batch snapshot endpoint.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SnapshotSection {
    pub url: Option<String>,
    pub token: Option<String>,
    pub token_env: Option<String>,
    pub timeout_secs: u64,
    pub ttl_secs: u64,
}

impl Default for SnapshotSection {
    fn default() -> Self {
        Self {
            url: None,
            token: None,
            token_env: None,
            timeout_secs: 10,
            ttl_secs: 30,
        }
    }
}

const REDACTED: &str = "********";

impl Config {
    /// Copy with plaintext secrets masked, for display.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mask = |s: &Option<String>| s.as_ref().map(|_| REDACTED.to_owned());
        let mut copy = self.clone();
        copy.feed.token = mask(&self.feed.token);
        copy.snapshot.token = mask(&self.snapshot.token);
        copy
    }

    /// The configured feed endpoint, if any.
    pub fn feed_endpoint(&self) -> Result<Option<Url>, ConfigError> {
        self.feed
            .url
            .as_deref()
            .map(|raw| parse_url("feed.url", raw))
            .transpose()
    }

    /// Credentials for the feed handshake.
    pub fn feed_credentials(&self) -> FeedCredentials {
        FeedCredentials {
            token: resolve_secret(self.feed.token_env.as_deref(), self.feed.token.as_deref()),
            params: Vec::new(),
        }
    }

    /// Translate into the engine's runtime config and validate it.
    pub fn to_engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let e = &self.engine;
        let f = &self.feed;
        let s = &self.snapshot;

        let snapshot_url = s
            .url
            .as_deref()
            .map(|raw| parse_url("snapshot.url", raw))
            .transpose()?;

        let config = EngineConfig {
            batch_interval: Duration::from_millis(e.batch_interval_ms),
            max_batch_size: e.max_batch_size,
            max_buffered_events: e.max_buffered_events,
            max_flush_retries: e.max_flush_retries,
            session_capacity: e.session_capacity,
            dedup_ttl: Duration::from_secs(e.dedup_ttl_secs),
            event_log_capacity: e.event_log_capacity,
            shift_threshold: e.shift_threshold,
            sweep_interval: Duration::from_secs(e.sweep_interval_secs),
            notification_retention: Duration::from_secs(e.notification_retention_secs),
            snapshot_url,
            snapshot_token: resolve_secret(s.token_env.as_deref(), s.token.as_deref()),
            request_timeout: Duration::from_secs(s.timeout_secs),
            snapshot_ttl: Duration::from_secs(s.ttl_secs),
            shutdown_grace: Duration::from_millis(e.shutdown_grace_ms),
            feed: FeedConfig {
                reconnect: ReconnectConfig {
                    initial_delay: Duration::from_millis(f.initial_delay_ms),
                    max_delay: Duration::from_millis(f.max_delay_ms),
                    max_attempts: (f.max_attempts > 0).then_some(f.max_attempts),
                    connect_timeout: Duration::from_secs(f.connect_timeout_secs),
                },
                heartbeat: HeartbeatConfig {
                    interval: Duration::from_secs(f.heartbeat_interval_secs),
                    missed_limit: f.heartbeat_missed_limit,
                    message: f.heartbeat_message.clone(),
                },
            },
        };

        config.validate().map_err(|e| ConfigError::Validation {
            field: "engine".into(),
            reason: e.to_string(),
        })?;
        Ok(config)
    }
}

fn parse_url(field: &str, raw: &str) -> Result<Url, ConfigError> {
    raw.parse().map_err(|_| ConfigError::Validation {
        field: field.into(),
        reason: format!("invalid URL: {raw}"),
    })
}

/// Env var named by `env_name` first, then the plaintext value.
pub fn resolve_secret(env_name: Option<&str>, plaintext: Option<&str>) -> Option<SecretString> {
    env_name
        .and_then(|name| std::env::var(name).ok())
        .filter(|v| !v.is_empty())
        .or_else(|| plaintext.map(str::to_owned))
        .map(SecretString::from)
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("rs", "fanout", "fanout").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("fanout");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

/// Load from the canonical path + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from `path` + environment. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    // `__` separates sections, so `FANOUT_ENGINE__MAX_BATCH_SIZE` maps to
    // `engine.max_batch_size`.
    let figment = Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("FANOUT_").split("__"));

    let config: Config = figment.extract()?;
    Ok(config)
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}
