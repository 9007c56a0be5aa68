// fanout-api: upstream transport for the fanout engine (feed + snapshots)

pub mod error;
pub mod feed;
pub mod snapshot;

pub use error::Error;
pub use feed::{
    FeedConfig, FeedCredentials, FeedEvent, FeedHandle, FeedStatus, HeartbeatConfig,
    ReconnectConfig, backoff_delay,
};
pub use snapshot::{SnapshotClient, SnapshotConfig, SnapshotEntry};
