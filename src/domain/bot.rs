//! Bot lifecycle: state machine, observed record and read model.

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::deployment::{BotDeployment, Capabilities};
use super::id::{BotName, SandboxId};
use crate::error::ControlError;

/// Maximum entries retained in each per-bot log buffer.
pub const LOG_BUFFER_CAPACITY: usize = 100;

/// Observed lifecycle state of a bot instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    Pending,
    Provisioning,
    Starting,
    Running,
    Stopping,
    Stopped,
    Archiving,
    Archived,
    Error,
}

impl BotState {
    /// `Archived` and `Error` end the automatic lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Archived | Self::Error)
    }

    /// Whether `self -> next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use BotState::*;
        match (self, next) {
            (Pending, Provisioning)
            | (Provisioning, Starting)
            | (Starting, Running)
            | (Running, Stopping)
            | (Stopping, Stopped)
            | (Stopped, Archiving)
            | (Archiving, Archived)
            | (Archiving, Stopped)
            | (Error, Provisioning) => true,
            (from, Error) => !from.is_terminal(),
            _ => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Archiving => "archiving",
            Self::Archived => "archived",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State the operator last asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredState {
    Running,
    Stopped,
    Archived,
    Removed,
}

/// One line received on a bot's log topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.level.eq_ignore_ascii_case("error")
    }
}

/// The observed record of one bot, owned by the orchestrator.
#[derive(Debug, Clone)]
pub struct BotInstance {
    name: BotName,
    state: BotState,
    desired: DesiredState,
    sandbox_id: Option<SandboxId>,
    deployment: BotDeployment,
    capabilities: Capabilities,
    last_heartbeat: Option<DateTime<Utc>>,
    last_detail: Option<serde_json::Value>,
    deploy_attempts: u32,
    archive_attempts: u32,
    error: Option<String>,
    archive_error: Option<String>,
    cleanup_pending: bool,
    unresponsive: bool,
    recent_logs: VecDeque<LogEntry>,
    error_logs: VecDeque<LogEntry>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BotInstance {
    /// A fresh record in `Pending`, with capabilities resolved from the program.
    #[must_use]
    pub fn new(name: BotName, deployment: BotDeployment, now: DateTime<Utc>) -> Self {
        let capabilities = deployment.program.capabilities();
        Self {
            name,
            state: BotState::Pending,
            desired: DesiredState::Running,
            sandbox_id: None,
            deployment,
            capabilities,
            last_heartbeat: None,
            last_detail: None,
            deploy_attempts: 0,
            archive_attempts: 0,
            error: None,
            archive_error: None,
            cleanup_pending: false,
            unresponsive: false,
            recent_logs: VecDeque::new(),
            error_logs: VecDeque::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidState`] if the transition is illegal.
    pub fn transition(&mut self, next: BotState, now: DateTime<Utc>) -> Result<BotState, ControlError> {
        if !self.state.can_transition_to(next) {
            return Err(ControlError::invalid_state(
                self.name.as_str(),
                format!("cannot move from {} to {}", self.state, next),
            ));
        }
        let from = self.state;
        self.state = next;
        self.updated_at = now;
        match next {
            BotState::Provisioning => {
                self.deploy_attempts += 1;
                self.error = None;
                self.unresponsive = false;
            }
            BotState::Running => self.unresponsive = false,
            _ => {}
        }
        Ok(from)
    }

    /// Force `Error` with a reason. Returns the previous state, or `None` if
    /// the record is already terminal.
    pub fn fail(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Option<BotState> {
        let from = self.transition(BotState::Error, now).ok()?;
        self.error = Some(reason.into());
        Some(from)
    }

    /// Record a heartbeat timestamp. Returns `false` when `at` is older than
    /// the one already recorded, in which case nothing changes.
    pub fn observe_heartbeat(&mut self, at: DateTime<Utc>, detail: Option<serde_json::Value>) -> bool {
        if self.last_heartbeat.is_some_and(|last| at < last) {
            return false;
        }
        self.last_heartbeat = Some(at);
        if detail.is_some() {
            self.last_detail = detail;
        }
        self.unresponsive = false;
        true
    }

    /// Append a log line, keeping both buffers bounded.
    pub fn push_log(&mut self, entry: LogEntry) {
        if entry.is_error() {
            if self.error_logs.len() == LOG_BUFFER_CAPACITY {
                self.error_logs.pop_front();
            }
            self.error_logs.push_back(entry.clone());
        }
        if self.recent_logs.len() == LOG_BUFFER_CAPACITY {
            self.recent_logs.pop_front();
        }
        self.recent_logs.push_back(entry);
    }

    pub fn set_sandbox(&mut self, id: Option<SandboxId>) {
        self.sandbox_id = id;
    }

    pub fn set_desired(&mut self, desired: DesiredState) {
        self.desired = desired;
    }

    pub fn set_cleanup_pending(&mut self, pending: bool) {
        self.cleanup_pending = pending;
    }

    pub fn set_unresponsive(&mut self, unresponsive: bool) {
        self.unresponsive = unresponsive;
    }

    /// Count one archival attempt.
    pub fn record_archive_attempt(&mut self) -> u32 {
        self.archive_attempts += 1;
        self.archive_attempts
    }

    /// Start a fresh archival budget.
    pub fn reset_archive(&mut self) {
        self.archive_attempts = 0;
        self.archive_error = None;
    }

    pub fn set_archive_error(&mut self, error: Option<String>) {
        self.archive_error = error;
    }

    #[must_use]
    pub fn name(&self) -> &BotName {
        &self.name
    }

    #[must_use]
    pub const fn state(&self) -> BotState {
        self.state
    }

    #[must_use]
    pub const fn desired(&self) -> DesiredState {
        self.desired
    }

    #[must_use]
    pub fn sandbox_id(&self) -> Option<&SandboxId> {
        self.sandbox_id.as_ref()
    }

    #[must_use]
    pub fn deployment(&self) -> &BotDeployment {
        &self.deployment
    }

    #[must_use]
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    #[must_use]
    pub const fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    #[must_use]
    pub const fn deploy_attempts(&self) -> u32 {
        self.deploy_attempts
    }

    #[must_use]
    pub const fn cleanup_pending(&self) -> bool {
        self.cleanup_pending
    }

    /// Copy-on-read view of the record.
    #[must_use]
    pub fn snapshot(&self) -> BotSnapshot {
        BotSnapshot {
            name: self.name.clone(),
            state: self.state,
            desired: self.desired,
            sandbox_id: self.sandbox_id.clone(),
            deployment: self.deployment.clone(),
            capabilities: self.capabilities.clone(),
            last_heartbeat: self.last_heartbeat,
            last_detail: self.last_detail.clone(),
            deploy_attempts: self.deploy_attempts,
            archive_attempts: self.archive_attempts,
            error: self.error.clone(),
            archive_error: self.archive_error.clone(),
            cleanup_pending: self.cleanup_pending,
            unresponsive: self.unresponsive,
            recent_logs: self.recent_logs.iter().cloned().collect(),
            error_logs: self.error_logs.iter().cloned().collect(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Read model of a [`BotInstance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotSnapshot {
    pub name: BotName,
    pub state: BotState,
    pub desired: DesiredState,
    pub sandbox_id: Option<SandboxId>,
    pub deployment: BotDeployment,
    pub capabilities: Capabilities,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_detail: Option<serde_json::Value>,
    pub deploy_attempts: u32,
    pub archive_attempts: u32,
    pub error: Option<String>,
    /// Set once archival retries are exhausted; cleared by a new archive.
    pub archive_error: Option<String>,
    pub cleanup_pending: bool,
    pub unresponsive: bool,
    pub recent_logs: Vec<LogEntry>,
    pub error_logs: Vec<LogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle notifications pushed to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum BotEvent {
    Transition {
        name: BotName,
        from: BotState,
        to: BotState,
        at: DateTime<Utc>,
    },
    Heartbeat {
        name: BotName,
        at: DateTime<Utc>,
    },
    ArchiveFailed {
        name: BotName,
        attempt: u32,
        error: String,
    },
    Removed {
        name: BotName,
    },
}

impl BotEvent {
    #[must_use]
    pub fn name(&self) -> &BotName {
        match self {
            Self::Transition { name, .. }
            | Self::Heartbeat { name, .. }
            | Self::ArchiveFailed { name, .. }
            | Self::Removed { name } => name,
        }
    }
}
