//! Market Data Feed Manager and its broker bridge.

mod bridge;
mod manager;

pub use bridge::{spawn_feed_bridge, FeedOp, FeedRequest, FeedResponse};
pub use manager::{FeedManager, SweepReport};
