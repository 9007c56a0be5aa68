// ── Routed event types ──

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::warn;

use super::ids::{RecipientId, TopicId};

/// Channel used for synthetic gap markers.
pub const GAP_CHANNEL: &str = "system:gap";

/// Delivery priority. Declaration order gives `Low < Normal < High < Critical`.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Who an event is fanned out to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum BroadcastScope {
    /// Every registered recipient session, regardless of channel.
    All,
    /// Subscribers of the event's channel that match its entity id.
    #[default]
    TopicSubscribers,
    /// An explicit recipient list.
    SpecificRecipients { recipients: Vec<RecipientId> },
}

/// Result of the external impact model for an injury report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactAssessment {
    /// Model-defined magnitude; the engine does not interpret it.
    pub score: f64,
    #[serde(default)]
    pub affected_topics: Vec<TopicId>,
}

/// Material change of a topic's consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusShift {
    pub topic: TopicId,
    pub previous_majority: Option<String>,
    pub majority: String,
    pub previous_mean_confidence: f64,
    pub mean_confidence: f64,
    pub participants: u64,
}

impl ConsensusShift {
    pub fn majority_changed(&self) -> bool {
        self.previous_majority.as_deref() != Some(self.majority.as_str())
    }
}

/// Closed set of event bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ScoreUpdate {
        home: u32,
        away: u32,
        #[serde(default)]
        period: Option<String>,
    },
    GameState {
        status: String,
    },
    InjuryReport {
        player_id: String,
        status: String,
        #[serde(default)]
        impact: Option<ImpactAssessment>,
    },
    OddsUpdate {
        market: String,
        value: f64,
    },
    ConsensusShift(ConsensusShift),
    /// Synthetic marker: `missed` events were dropped before this batch.
    Gap {
        missed: u64,
    },
    ConnectionStatus {
        state: String,
    },
    /// Upstream event type the engine does not model.
    Raw {
        event_type: String,
        data: serde_json::Value,
    },
}

impl EventPayload {
    /// Type tag as it appears on the wire.
    pub fn type_name(&self) -> &str {
        match self {
            Self::ScoreUpdate { .. } => "score_update",
            Self::GameState { .. } => "game_state",
            Self::InjuryReport { .. } => "injury_report",
            Self::OddsUpdate { .. } => "odds_update",
            Self::ConsensusShift(_) => "consensus_shift",
            Self::Gap { .. } => "gap",
            Self::ConnectionStatus { .. } => "connection_status",
            Self::Raw { event_type, .. } => event_type,
        }
    }

    /// Priority an event of this kind gets when the source doesn't say.
    pub fn default_priority(&self) -> Priority {
        match self {
            Self::ConnectionStatus { .. } => Priority::Critical,
            Self::InjuryReport { .. }
            | Self::GameState { .. }
            | Self::ConsensusShift(_)
            | Self::Gap { .. } => Priority::High,
            Self::ScoreUpdate { .. } | Self::OddsUpdate { .. } | Self::Raw { .. } => {
                Priority::Normal
            }
        }
    }
}

/// Bytes compared for duplicate suppression. Falls back to the `Debug`
/// form if JSON encoding fails, so distinct payloads never share bytes.
fn encode_payload<T: Serialize + fmt::Debug>(payload: &T) -> Bytes {
    match serde_json::to_vec(payload) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            warn!(error = %e, "payload encoding failed, deduplicating on debug form");
            Bytes::from(format!("{payload:?}"))
        }
    }
}

/// An immutable routed event.
///
/// Built once, then shared as `Arc<Event>` through the router, buffers
/// and batches. The serialized payload is computed at construction and
/// used for byte-level duplicate suppression.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    channel: String,
    entity_id: Option<String>,
    payload: EventPayload,
    priority: Priority,
    scope: BroadcastScope,
    created_at: DateTime<Utc>,
    #[serde(skip)]
    encoded: Bytes,
}

impl Event {
    /// New event on `channel` with the payload's default priority,
    /// scoped to the channel's subscribers.
    pub fn new(channel: impl Into<String>, payload: EventPayload) -> Self {
        let encoded = encode_payload(&payload);
        Self {
            channel: channel.into(),
            entity_id: None,
            priority: payload.default_priority(),
            payload,
            scope: BroadcastScope::default(),
            created_at: Utc::now(),
            encoded,
        }
    }

    /// Synthetic marker telling a recipient it missed `missed` events.
    pub fn gap(recipient: &RecipientId, missed: u64) -> Self {
        Self::new(GAP_CHANNEL, EventPayload::Gap { missed }).with_scope(
            BroadcastScope::SpecificRecipients {
                recipients: vec![recipient.clone()],
            },
        )
    }

    #[must_use]
    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: BroadcastScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.entity_id.as_deref()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn scope(&self) -> &BroadcastScope {
        &self.scope
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Serialized payload bytes.
    pub fn encoded_payload(&self) -> &Bytes {
        &self.encoded
    }

    pub fn is_gap(&self) -> bool {
        matches!(self.payload, EventPayload::Gap { .. })
    }
}
