// ── Domain model ──

pub mod event;
pub mod ids;
pub mod notification;

pub use event::{
    BroadcastScope, ConsensusShift, Event, EventPayload, GAP_CHANNEL, ImpactAssessment, Priority,
};
pub use ids::{NotificationId, RecipientId, SubscriptionId, TopicId};
pub use notification::{
    ChannelDelivery, DeliveryChannel, Notification, NotificationCategory, NotificationStatus,
    Severity, StatusChange,
};
