//! Messages into the orchestrator's dispatch loop.

use tokio::sync::oneshot;

use crate::application::archival::ArchiveProgress;
use crate::domain::{BotDeployment, BotName, BotSnapshot, BrokerMessage, SandboxId};
use crate::error::{ControlError, RuntimeError};
use crate::port::{ArchiveDestination, SandboxStatus};

pub(crate) type Reply<T> = oneshot::Sender<Result<T, ControlError>>;

/// How a stop should finish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// Leave the bot in `Stopped` instead of archiving it.
    pub skip_archive: bool,
    pub destination: ArchiveDestination,
}

impl StopOptions {
    #[must_use]
    pub fn skip_archive() -> Self {
        Self {
            skip_archive: true,
            destination: ArchiveDestination::Local,
        }
    }

    #[must_use]
    pub fn archive_to(destination: ArchiveDestination) -> Self {
        Self {
            skip_archive: false,
            destination,
        }
    }
}

/// Operator requests.
pub(crate) enum Request {
    Deploy {
        name: BotName,
        deployment: BotDeployment,
        reply: Reply<BotSnapshot>,
    },
    Stop {
        name: BotName,
        options: StopOptions,
        reply: Reply<BotSnapshot>,
    },
    Archive {
        name: BotName,
        destination: ArchiveDestination,
        reply: Reply<BotSnapshot>,
    },
    Retry {
        name: BotName,
        reply: Reply<BotSnapshot>,
    },
    Remove {
        name: BotName,
        reply: Reply<()>,
    },
    Shutdown,
}

/// Why provisioning failed, and whether a sandbox was left behind.
#[derive(Debug)]
pub(crate) struct ProvisionFailure {
    pub sandbox: Option<SandboxId>,
    pub reason: String,
}

/// Results of I/O the loop delegated to spawned tasks.
///
/// `generation` identifies the operation that produced the result; the loop
/// drops results whose generation no longer matches the instance.
#[derive(Debug)]
pub(crate) enum Completion {
    Provisioned {
        name: BotName,
        generation: u64,
        result: Result<SandboxId, ProvisionFailure>,
    },
    StartReply {
        name: BotName,
        generation: u64,
        result: Result<BrokerMessage, ControlError>,
    },
    StopReply {
        name: BotName,
        generation: u64,
        result: Result<BrokerMessage, ControlError>,
    },
    Deadline {
        name: BotName,
        generation: u64,
    },
    SandboxHalted {
        name: BotName,
        generation: u64,
        result: Result<(), RuntimeError>,
    },
    Archive {
        name: BotName,
        generation: u64,
        progress: ArchiveProgress,
    },
    SandboxRemoved {
        name: BotName,
        generation: u64,
        result: Result<(), RuntimeError>,
    },
    Inspected {
        name: BotName,
        generation: u64,
        result: Result<SandboxStatus, RuntimeError>,
        /// Last output lines of a sandbox found exited.
        output: Vec<String>,
    },
    Removed {
        name: BotName,
        generation: u64,
        result: Result<(), RuntimeError>,
    },
}

impl Completion {
    pub(crate) fn target(&self) -> (&BotName, u64) {
        match self {
            Self::Provisioned {
                name, generation, ..
            }
            | Self::StartReply {
                name, generation, ..
            }
            | Self::StopReply {
                name, generation, ..
            }
            | Self::Deadline { name, generation }
            | Self::SandboxHalted {
                name, generation, ..
            }
            | Self::Archive {
                name, generation, ..
            }
            | Self::SandboxRemoved {
                name, generation, ..
            }
            | Self::Inspected {
                name, generation, ..
            }
            | Self::Removed {
                name, generation, ..
            } => (name, *generation),
        }
    }
}
