//! Market data upstream port.

use async_trait::async_trait;

use crate::domain::{FeedEvent, FeedKey};
use crate::error::Error;

/// Opens live data streams for feed keys.
#[async_trait]
pub trait FeedUpstream: Send + Sync {
    /// Open one upstream connection for `key`.
    async fn open(&self, key: &FeedKey) -> Result<Box<dyn FeedStream>, Error>;

    /// Upstream name for logging.
    fn name(&self) -> &'static str;
}

/// An open upstream connection.
#[async_trait]
pub trait FeedStream: Send {
    /// Next event. `None` means the stream ended.
    async fn next_event(&mut self) -> Option<FeedEvent>;

    /// Release the upstream connection. Called once per opened stream.
    async fn close(&mut self);
}
