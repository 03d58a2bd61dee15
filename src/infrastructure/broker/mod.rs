//! Broker Client: one logical broker connection shared by the control plane.
//!
//! A single connection task owns the [`BrokerTransport`](crate::port::BrokerTransport).
//! Cloneable [`BrokerHandle`]s publish, issue correlated requests and open
//! topic routes. The task reconnects with backoff and replays every routed
//! subscription after each reconnect.

mod backoff;
mod client;
mod pending;
mod routing;

pub use backoff::ReconnectPolicy;
pub use client::{BrokerClient, BrokerHandle};
pub use pending::PendingTable;
pub use routing::RouteTable;
