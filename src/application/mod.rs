//! Application services.
//!
//! These services hold the control-plane logic and talk to the outside
//! world only through the ports and the broker client.

pub mod archival;
pub mod control;
pub mod feed;
pub mod orchestrator;

pub use archival::{ArchivalWorker, ArchiveProgress};
pub use control::{spawn_control_bridge, ControlOp, ControlRequest, ControlResponse};
pub use feed::{spawn_feed_bridge, FeedManager, SweepReport};
pub use orchestrator::{Orchestrator, OrchestratorDeps, StopOptions};
