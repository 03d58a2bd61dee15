//! Control-plane domain: bots, feeds and the broker wire format.

pub mod bot;
pub mod deployment;
pub mod envelope;
pub mod feed;
pub mod id;

pub use bot::{BotEvent, BotInstance, BotSnapshot, BotState, DesiredState, LogEntry};
pub use deployment::{BotDeployment, BotProgram, Capabilities, ResourceLimits};
pub use envelope::{
    topic_matches, BotChannel, BrokerMessage, CommandAction, CommandEnvelope, EnvelopeError,
    ReportedState, StatusEnvelope, Topics,
};
pub use feed::{DataKind, FeedEvent, FeedInfo, FeedKey, FeedPayload, FeedSnapshot, PriceLevel};
pub use id::{BotName, CallerHandle, CorrelationId, SandboxId};
