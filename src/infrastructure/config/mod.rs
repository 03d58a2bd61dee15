//! Infrastructure configuration modules.

pub mod archive;
pub mod broker;
pub mod feeds;
pub mod logging;
pub mod orchestrator;
pub mod runtime;
pub mod settings;

pub use settings::{BotEntry, Config};
