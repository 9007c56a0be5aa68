// ── Core error types ──
//
// Errors surfaced by the engine. Upstream transport failures arrive as
// `fanout_api::Error` and are translated here so callers never match on
// HTTP statuses or WebSocket close codes.

use thiserror::Error;

use crate::model::RecipientId;

#[derive(Debug, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot connect to upstream at {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Upstream connection gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Not connected to upstream")]
    Disconnected,

    #[error("Upstream request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    // ── Delivery errors ──────────────────────────────────────────────
    #[error("Delivery to {recipient} failed: {reason}")]
    Delivery {
        recipient: RecipientId,
        reason: String,
    },

    #[error("Buffer full for {recipient}: dropped {dropped} oldest events")]
    Capacity { recipient: RecipientId, dropped: u64 },

    // ── Data errors ──────────────────────────────────────────────────
    #[error("Validation failed: {message}")]
    Validation { message: String },

    #[error("{entity_type} not found: {identifier}")]
    NotFound {
        entity_type: String,
        identifier: String,
    },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // ── Upstream errors (wrapped, not exposed raw) ───────────────────
    #[error("Upstream error: {message}")]
    Upstream {
        message: String,
        status: Option<u16>,
    },

    // ── Lifecycle ────────────────────────────────────────────────────
    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(entity_type: &str, identifier: impl ToString) -> Self {
        Self::NotFound {
            entity_type: entity_type.to_owned(),
            identifier: identifier.to_string(),
        }
    }

    /// Whether waiting and retrying could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::Disconnected
                | Self::Timeout { .. }
                | Self::Delivery { .. }
        ) || matches!(self, Self::Upstream { status: Some(s), .. } if *s >= 500)
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<fanout_api::Error> for CoreError {
    fn from(err: fanout_api::Error) -> Self {
        match err {
            fanout_api::Error::Authentication { message } => {
                CoreError::AuthenticationFailed { message }
            }
            fanout_api::Error::Timeout { timeout_secs } => CoreError::Timeout { timeout_secs },
            fanout_api::Error::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout { timeout_secs: 0 }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        url: e
                            .url()
                            .map(ToString::to_string)
                            .unwrap_or_else(|| "<unknown>".into()),
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Upstream {
                        message: e.to_string(),
                        status: e.status().map(|s| s.as_u16()),
                    }
                }
            }
            fanout_api::Error::InvalidUrl(e) => CoreError::Config {
                message: format!("invalid upstream URL: {e}"),
            },
            fanout_api::Error::Http { status, message } => CoreError::Upstream {
                message,
                status: Some(status),
            },
            fanout_api::Error::WebSocketConnect(reason) => CoreError::ConnectionFailed {
                url: "<feed>".into(),
                reason,
            },
            fanout_api::Error::WebSocketClosed { code, reason } => CoreError::ConnectionFailed {
                url: "<feed>".into(),
                reason: format!("closed with code {code}: {reason}"),
            },
            fanout_api::Error::HeartbeatTimeout { missed } => CoreError::ConnectionFailed {
                url: "<feed>".into(),
                reason: format!("no traffic for {missed} heartbeat intervals"),
            },
            fanout_api::Error::RetriesExhausted { attempts } => {
                CoreError::RetriesExhausted { attempts }
            }
            fanout_api::Error::Deserialization { message, .. } => CoreError::Upstream {
                message: format!("malformed upstream response: {message}"),
                status: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_timeout_keeps_duration() {
        let err = CoreError::from(fanout_api::Error::Timeout { timeout_secs: 10 });
        assert!(matches!(err, CoreError::Timeout { timeout_secs: 10 }));
        assert!(err.is_transient());
    }

    #[test]
    fn api_auth_maps_to_authentication_failed() {
        let err = CoreError::from(fanout_api::Error::Authentication {
            message: "bad token".into(),
        });
        assert!(matches!(err, CoreError::AuthenticationFailed { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn server_errors_are_transient() {
        let err = CoreError::from(fanout_api::Error::Http {
            status: 502,
            message: "bad gateway".into(),
        });
        assert!(err.is_transient());
        let err = CoreError::from(fanout_api::Error::Http {
            status: 404,
            message: "nope".into(),
        });
        assert!(!err.is_transient());
    }

    #[test]
    fn display_messages() {
        let err = CoreError::not_found("Subscription", "abc");
        assert_eq!(err.to_string(), "Subscription not found: abc");
        let err = CoreError::Capacity {
            recipient: "r1".into(),
            dropped: 3,
        };
        assert_eq!(err.to_string(), "Buffer full for r1: dropped 3 oldest events");
    }
}
