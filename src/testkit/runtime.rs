//! In-memory [`SandboxRuntime`] with scripted failures.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{BotName, SandboxId};
use crate::error::RuntimeError;
use crate::port::{SandboxRuntime, SandboxSpec, SandboxState, SandboxStatus};

struct FakeSandbox {
    name: BotName,
    spec: SandboxSpec,
    status: SandboxStatus,
    output: Vec<String>,
}

#[derive(Default)]
struct State {
    next_id: u32,
    sandboxes: HashMap<SandboxId, FakeSandbox>,
    calls: HashMap<String, u32>,
    failures: HashMap<String, (RuntimeError, u32)>,
}

impl State {
    /// Count the call and pop a scripted failure for it, if any.
    fn enter(&mut self, op: &str) -> Result<(), RuntimeError> {
        *self.calls.entry(op.to_string()).or_default() += 1;
        if let Some((error, remaining)) = self.failures.get_mut(op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(error.clone());
            }
        }
        Ok(())
    }

    fn sandbox(&mut self, id: &SandboxId) -> Result<&mut FakeSandbox, RuntimeError> {
        self.sandboxes
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound { id: id.to_string() })
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls of `op` (`create`, `start`, `stop`,
    /// `remove`, `inspect` or `logs`) with `error`.
    pub fn fail_next(&self, op: &str, error: RuntimeError, times: u32) {
        self.state
            .lock()
            .failures
            .insert(op.to_string(), (error, times));
    }

    #[must_use]
    pub fn call_count(&self, op: &str) -> u32 {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn exists(&self, id: &SandboxId) -> bool {
        self.state.lock().sandboxes.contains_key(id)
    }

    /// Status of `id`, if it exists.
    #[must_use]
    pub fn status(&self, id: &SandboxId) -> Option<SandboxStatus> {
        self.state.lock().sandboxes.get(id).map(|s| s.status)
    }

    /// The spec a sandbox was created from.
    #[must_use]
    pub fn spec(&self, id: &SandboxId) -> Option<SandboxSpec> {
        self.state.lock().sandboxes.get(id).map(|s| s.spec.clone())
    }

    /// Number of sandboxes that exist.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().sandboxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make a sandbox exit behind the orchestrator's back.
    pub fn crash(&self, id: &SandboxId, exit_code: i32) {
        if let Some(sandbox) = self.state.lock().sandboxes.get_mut(id) {
            sandbox.status = SandboxStatus {
                state: SandboxState::Exited,
                exit_code: Some(exit_code),
            };
        }
    }

    /// Append a line to the process output of `id`.
    pub fn write_output(&self, id: &SandboxId, line: impl Into<String>) {
        if let Some(sandbox) = self.state.lock().sandboxes.get_mut(id) {
            sandbox.output.push(line.into());
        }
    }

    /// Delete a sandbox behind the orchestrator's back.
    pub fn vanish(&self, id: &SandboxId) {
        self.state.lock().sandboxes.remove(id);
    }
}

#[async_trait]
impl SandboxRuntime for FakeRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId, RuntimeError> {
        let mut state = self.state.lock();
        state.enter("create")?;
        if state.sandboxes.values().any(|s| s.name == spec.name) {
            return Err(RuntimeError::ResourceConflict {
                name: spec.name.to_string(),
            });
        }
        state.next_id += 1;
        let id = SandboxId::new(format!("fake-{}", state.next_id));
        state.sandboxes.insert(
            id.clone(),
            FakeSandbox {
                name: spec.name.clone(),
                spec: spec.clone(),
                status: SandboxStatus {
                    state: SandboxState::Created,
                    exit_code: None,
                },
                output: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.enter("start")?;
        state.sandbox(id)?.status = SandboxStatus {
            state: SandboxState::Running,
            exit_code: None,
        };
        Ok(())
    }

    async fn stop(&self, id: &SandboxId, _timeout: Duration) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.enter("stop")?;
        let sandbox = state.sandbox(id)?;
        if sandbox.status.is_running() {
            sandbox.status = SandboxStatus {
                state: SandboxState::Exited,
                exit_code: Some(0),
            };
        }
        Ok(())
    }

    async fn remove(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        let mut state = self.state.lock();
        state.enter("remove")?;
        if state.sandbox(id)?.status.is_running() {
            return Err(RuntimeError::InvalidState {
                id: id.to_string(),
                reason: "sandbox is running".into(),
            });
        }
        state.sandboxes.remove(id);
        Ok(())
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxStatus, RuntimeError> {
        let mut state = self.state.lock();
        state.enter("inspect")?;
        Ok(state.sandbox(id)?.status)
    }

    fn data_dir(&self, id: &SandboxId) -> PathBuf {
        PathBuf::from("/fake").join(id.as_str()).join("data")
    }

    async fn logs(&self, id: &SandboxId, tail: usize) -> Result<Vec<String>, RuntimeError> {
        let mut state = self.state.lock();
        state.enter("logs")?;
        let output = &state.sandbox(id)?.output;
        Ok(output[output.len().saturating_sub(tail)..].to_vec())
    }
}
