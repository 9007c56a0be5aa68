//! Real-time update distribution engine.
//!
//! Takes a stream of upstream events and fans it out to many recipients:
//!
//! - **[`Engine`]**: Lifecycle facade. [`start()`](Engine::start) spawns
//!   the flush scheduler and notification sweep;
//!   [`connect()`](Engine::connect) opens the reconnecting upstream feed
//!   and bridges its events into the router.
//!
//! - **[`SubscriptionRegistry`]**: Channel → subscriber index with entity
//!   and content filters, per-subscription throttles and priorities.
//!
//! - **[`Router`]** / **[`BatchBuffer`]**: Resolve recipients, suppress
//!   duplicate payloads, and buffer per recipient until the flush timer,
//!   a full batch, or a critical event releases them.
//!
//! - **[`ConsensusAggregator`]**: Per-topic running majority and mean
//!   confidence; significant moves are routed as consensus-shift events.
//!
//! - **[`NotificationPipeline`]**: Multi-channel notification delivery
//!   with expiry, retry, and a pending → delivered → read lifecycle.

pub mod batch;
pub mod cache;
pub mod config;
pub mod connection;
pub mod consensus;
pub mod convert;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod model;
pub mod notify;
pub mod registry;
pub mod router;
pub mod session;
pub mod stream;

// ── Primary re-exports ──────────────────────────────────────────────
pub use batch::{Batch, BatchBuffer, DeliveryFailure, FlushOutcome, FlushReason};
pub use cache::{DataCache, Lookup};
pub use config::EngineConfig;
pub use connection::{ConnectionManager, ConnectionState};
pub use consensus::{ConsensusAggregator, ConsensusSnapshot, DEFAULT_SHIFT_THRESHOLD, SubmitOutcome};
pub use convert::ImpactAssessor;
pub use engine::{CONNECTION_CHANNEL, Engine, EngineBuilder};
pub use error::CoreError;
pub use metrics::MetricsSnapshot;
pub use notify::{InAppChannel, LivePushChannel, NotificationChannel, NotificationPipeline, SweepReport};
pub use registry::{ContentFilter, SubscribeOptions, SubscriptionRegistry};
pub use router::{RouteOutcome, Router};
pub use stream::{BatchStream, NotificationStream, RecipientStream};

pub use model::{
    BroadcastScope, ConsensusShift, DeliveryChannel, Event, EventPayload, ImpactAssessment,
    Notification, NotificationCategory, NotificationId, NotificationStatus, Priority, RecipientId,
    Severity, SubscriptionId, TopicId,
};

// The upstream transport types callers need to connect.
pub use fanout_api::{FeedConfig, FeedCredentials, HeartbeatConfig, ReconnectConfig};
