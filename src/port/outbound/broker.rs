//! Broker transport port.

use async_trait::async_trait;

use crate::domain::BrokerMessage;
use crate::error::Error;

/// A single connection to a topic-based message broker.
///
/// Implementations only move bytes. Request/response pairing, routing and
/// reconnection live in the broker client that owns the transport.
#[async_trait]
pub trait BrokerTransport: Send {
    /// Establish (or re-establish) the connection.
    async fn connect(&mut self) -> Result<(), Error>;

    /// Subscribe to topic filters. `+` and `#` wildcards are allowed.
    async fn subscribe(&mut self, filters: &[String]) -> Result<(), Error>;

    /// Publish one message. Delivery is fire-and-forget.
    async fn publish(&mut self, message: BrokerMessage) -> Result<(), Error>;

    /// Receive the next inbound message.
    ///
    /// Must be cancel-safe: dropping the future before it completes must not
    /// lose a message. Returns `None` when the connection is closed.
    async fn next_message(&mut self) -> Option<BrokerMessage>;

    /// Transport name for logging.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl BrokerTransport for Box<dyn BrokerTransport> {
    async fn connect(&mut self) -> Result<(), Error> {
        (**self).connect().await
    }

    async fn subscribe(&mut self, filters: &[String]) -> Result<(), Error> {
        (**self).subscribe(filters).await
    }

    async fn publish(&mut self, message: BrokerMessage) -> Result<(), Error> {
        (**self).publish(message).await
    }

    async fn next_message(&mut self) -> Option<BrokerMessage> {
        (**self).next_message().await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
