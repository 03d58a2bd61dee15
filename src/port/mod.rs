//! Trait definitions (hexagonal ports). Depend only on domain.
//!
//! # Available Ports
//!
//! - [`BrokerTransport`] - Message broker connection
//! - [`SandboxRuntime`] - Isolated bot process hosting
//! - [`FeedUpstream`], [`FeedStream`] - Live market data sources
//! - [`ArchiveStore`] - Cold storage for bot data

pub mod outbound;

pub use outbound::archive::{ArchiveDestination, ArchiveJob, ArchiveReceipt, ArchiveStore};
pub use outbound::broker::BrokerTransport;
pub use outbound::feed::{FeedStream, FeedUpstream};
pub use outbound::runtime::{SandboxRuntime, SandboxSpec, SandboxState, SandboxStatus};
