//! Sandbox runtime port.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{BotDeployment, BotName, SandboxId};
use crate::error::RuntimeError;

/// Everything a runtime needs to materialize a sandbox.
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub name: BotName,
    pub deployment: BotDeployment,
    /// Environment for the bot process, merged over the deployment's own.
    pub env: BTreeMap<String, String>,
}

/// Coarse lifecycle of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Running,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub state: SandboxState,
    pub exit_code: Option<i32>,
}

impl SandboxStatus {
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.state, SandboxState::Running)
    }
}

/// Creates, starts, stops and removes isolated bot sandboxes.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Materialize a sandbox. Fails with `ResourceConflict` if one with the
    /// same name exists.
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId, RuntimeError>;

    async fn start(&self, id: &SandboxId) -> Result<(), RuntimeError>;

    /// Stop the sandbox, forcing it down once `timeout` elapses. Stopping an
    /// already stopped sandbox succeeds.
    async fn stop(&self, id: &SandboxId, timeout: Duration) -> Result<(), RuntimeError>;

    /// Delete the sandbox. Fails with `InvalidState` while it is running.
    async fn remove(&self, id: &SandboxId) -> Result<(), RuntimeError>;

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxStatus, RuntimeError>;

    /// Directory holding the bot's working data.
    fn data_dir(&self, id: &SandboxId) -> PathBuf;

    /// Last `tail` lines of the sandbox's output.
    async fn logs(&self, id: &SandboxId, tail: usize) -> Result<Vec<String>, RuntimeError>;
}
