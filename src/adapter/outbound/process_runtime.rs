//! Local-process sandbox runtime.
//!
//! Each bot gets a directory `{instances_dir}/{name}/` with `conf/`, `data/`
//! and `logs/`, and runs as one child process of the control plane. The
//! sandbox id is the bot name.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::archive::copy_tree;
use crate::domain::{BotName, SandboxId};
use crate::error::RuntimeError;
use crate::infrastructure::config::runtime::RuntimeConfig;
use crate::port::{SandboxRuntime, SandboxSpec, SandboxState, SandboxStatus};

struct Sandbox {
    name: BotName,
    root: PathBuf,
    env: Vec<(String, String)>,
    child: Option<Child>,
    exit_code: Option<i32>,
    started: bool,
}

pub struct ProcessRuntime {
    instances_dir: PathBuf,
    credentials_dir: PathBuf,
    program: String,
    args: Vec<String>,
    sandboxes: Mutex<HashMap<SandboxId, Arc<tokio::sync::Mutex<Sandbox>>>>,
}

fn transport(e: &std::io::Error) -> RuntimeError {
    RuntimeError::Transport(e.to_string())
}

fn not_found(id: &SandboxId) -> RuntimeError {
    RuntimeError::NotFound { id: id.to_string() }
}

/// Lay out the sandbox directory and return its root.
fn provision(root: &Path, credentials: &Path, spec: &SandboxSpec) -> std::io::Result<()> {
    for dir in ["conf", "data", "logs"] {
        fs::create_dir_all(root.join(dir))?;
    }
    if credentials.is_dir() {
        let (files, _) = copy_tree(credentials, &root.join("conf"))?;
        debug!(bot = %spec.name, files, "Copied credentials profile");
    } else {
        warn!(
            bot = %spec.name,
            profile = %spec.deployment.credentials_profile,
            "Credentials profile not found, starting without it"
        );
    }
    let deployment = serde_json::to_vec_pretty(&spec.deployment)?;
    fs::write(root.join("conf").join("deployment.json"), deployment)?;
    Ok(())
}

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let pid = pid as libc::pid_t;
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {}

/// SIGTERM, then SIGKILL once `timeout` passes. Leaves `child` in place.
async fn halt(id: &SandboxId, child: &mut Child, timeout: Duration) -> Result<ExitStatus, RuntimeError> {
    terminate(child);
    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status.map_err(|e| transport(&e)),
        Err(_) => {
            warn!(sandbox = %id, timeout_secs = timeout.as_secs(), "Bot did not exit, killing");
            child.kill().await.map_err(|e| transport(&e))?;
            child.wait().await.map_err(|e| transport(&e))
        }
    }
}

/// Drop the process handle only once the process is known to be gone, so a
/// failed stop still reads as running and blocks `remove`.
fn record_halt(sandbox: &mut Sandbox, outcome: Result<ExitStatus, RuntimeError>) -> Result<(), RuntimeError> {
    let status = match outcome {
        Ok(status) => status,
        Err(e) => {
            warn!(bot = %sandbox.name, error = %e, "Stop failed, keeping process handle");
            return Err(e);
        }
    };
    debug!(bot = %sandbox.name, status = %status, "Bot process exited");
    sandbox.child = None;
    sandbox.exit_code = status.code();
    Ok(())
}

impl ProcessRuntime {
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            instances_dir: config.instances_dir.clone(),
            credentials_dir: config.credentials_dir.clone(),
            program: config.program.clone(),
            args: config.args.clone(),
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn sandbox(&self, id: &SandboxId) -> Result<Arc<tokio::sync::Mutex<Sandbox>>, RuntimeError> {
        self.sandboxes
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(id))
    }

    fn spawn_child(&self, sandbox: &Sandbox) -> Result<Child, RuntimeError> {
        let logs = sandbox.root.join("logs");
        let stdout = File::create(logs.join("stdout.log")).map_err(|e| transport(&e))?;
        let stderr = File::create(logs.join("stderr.log")).map_err(|e| transport(&e))?;

        Command::new(&self.program)
            .args(&self.args)
            .current_dir(&sandbox.root)
            .envs(sandbox.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("BOT_CONF_DIR", sandbox.root.join("conf"))
            .env("BOT_DATA_DIR", sandbox.root.join("data"))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    RuntimeError::InvalidState {
                        id: sandbox.name.to_string(),
                        reason: format!("cannot launch {}: {e}", self.program),
                    }
                }
                _ => transport(&e),
            })
    }
}

#[async_trait]
impl SandboxRuntime for ProcessRuntime {
    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId, RuntimeError> {
        let id = SandboxId::new(spec.name.as_str());
        if self.sandboxes.lock().contains_key(&id) {
            return Err(RuntimeError::ResourceConflict {
                name: spec.name.to_string(),
            });
        }

        let root = self.instances_dir.join(spec.name.as_str());
        let credentials = self
            .credentials_dir
            .join(&spec.deployment.credentials_profile);
        let job_root = root.clone();
        let job_spec = spec.clone();
        tokio::task::spawn_blocking(move || provision(&job_root, &credentials, &job_spec))
            .await
            .map_err(|e| RuntimeError::Transport(e.to_string()))?
            .map_err(|e| transport(&e))?;

        let env = spec
            .deployment
            .env
            .iter()
            .chain(spec.env.iter())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let sandbox = Sandbox {
            name: spec.name.clone(),
            root,
            env,
            child: None,
            exit_code: None,
            started: false,
        };

        let mut sandboxes = self.sandboxes.lock();
        if sandboxes.contains_key(&id) {
            return Err(RuntimeError::ResourceConflict {
                name: spec.name.to_string(),
            });
        }
        sandboxes.insert(id.clone(), Arc::new(tokio::sync::Mutex::new(sandbox)));
        info!(bot = %spec.name, sandbox = %id, "Sandbox provisioned");
        Ok(id)
    }

    async fn start(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        let sandbox = self.sandbox(id)?;
        let mut sandbox = sandbox.lock().await;
        if let Some(child) = sandbox.child.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }
        let child = self.spawn_child(&sandbox)?;
        info!(sandbox = %id, pid = child.id(), program = %self.program, "Bot process started");
        sandbox.child = Some(child);
        sandbox.exit_code = None;
        sandbox.started = true;
        Ok(())
    }

    async fn stop(&self, id: &SandboxId, timeout: Duration) -> Result<(), RuntimeError> {
        let sandbox = self.sandbox(id)?;
        let mut sandbox = sandbox.lock().await;
        let Some(child) = sandbox.child.as_mut() else {
            return Ok(());
        };
        let outcome = halt(id, child, timeout).await;
        record_halt(&mut sandbox, outcome)
    }

    async fn remove(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        let sandbox = self.sandbox(id)?;
        let root = {
            let mut sandbox = sandbox.lock().await;
            if let Some(child) = sandbox.child.as_mut() {
                if matches!(child.try_wait(), Ok(None)) {
                    return Err(RuntimeError::InvalidState {
                        id: id.to_string(),
                        reason: "sandbox is running".into(),
                    });
                }
            }
            sandbox.root.clone()
        };

        tokio::task::spawn_blocking(move || match fs::remove_dir_all(&root) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        })
        .await
        .map_err(|e| RuntimeError::Transport(e.to_string()))?
        .map_err(|e| transport(&e))?;

        self.sandboxes.lock().remove(id);
        info!(sandbox = %id, "Sandbox removed");
        Ok(())
    }

    async fn inspect(&self, id: &SandboxId) -> Result<SandboxStatus, RuntimeError> {
        let sandbox = self.sandbox(id)?;
        let mut sandbox = sandbox.lock().await;
        let exited = match sandbox.child.as_mut() {
            Some(child) => match child.try_wait().map_err(|e| transport(&e))? {
                None => {
                    return Ok(SandboxStatus {
                        state: SandboxState::Running,
                        exit_code: None,
                    })
                }
                Some(status) => Some(status.code()),
            },
            None => None,
        };
        if let Some(code) = exited {
            sandbox.child = None;
            sandbox.exit_code = code;
        }

        let state = if sandbox.started {
            SandboxState::Exited
        } else {
            SandboxState::Created
        };
        Ok(SandboxStatus {
            state,
            exit_code: sandbox.exit_code,
        })
    }

    fn data_dir(&self, id: &SandboxId) -> PathBuf {
        self.instances_dir.join(id.as_str()).join("data")
    }

    async fn logs(&self, id: &SandboxId, tail: usize) -> Result<Vec<String>, RuntimeError> {
        let root = self.sandbox(id)?.lock().await.root.clone();
        let content = match tokio::fs::read_to_string(root.join("logs").join("stdout.log")).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(transport(&e)),
        };
        let lines: Vec<&str> = content.lines().collect();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines[skip..].iter().map(ToString::to_string).collect())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::BotDeployment;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn runtime(dir: &Path, program: &str, args: &[&str]) -> ProcessRuntime {
        ProcessRuntime::new(&RuntimeConfig {
            instances_dir: dir.join("instances"),
            credentials_dir: dir.join("credentials"),
            program: program.into(),
            args: args.iter().map(ToString::to_string).collect(),
            ..RuntimeConfig::default()
        })
    }

    fn spec() -> SandboxSpec {
        SandboxSpec {
            name: BotName::new("bot1").unwrap(),
            deployment: BotDeployment::script("master", None),
            env: BTreeMap::from([("BOT_NAME".to_string(), "bot1".to_string())]),
        }
    }

    #[tokio::test]
    async fn create_lays_out_directories_and_copies_credentials() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("credentials/master")).unwrap();
        fs::write(dir.path().join("credentials/master/keys.yml"), "k: v").unwrap();
        let runtime = runtime(dir.path(), "sleep", &["30"]);

        let id = runtime.create(&spec()).await.unwrap();
        let root = dir.path().join("instances/bot1");
        assert!(root.join("data").is_dir());
        assert!(root.join("logs").is_dir());
        assert!(root.join("conf/keys.yml").is_file());
        assert!(root.join("conf/deployment.json").is_file());
        assert_eq!(runtime.data_dir(&id), root.join("data"));

        assert!(matches!(
            runtime.create(&spec()).await,
            Err(RuntimeError::ResourceConflict { .. })
        ));
    }

    #[tokio::test]
    async fn start_stop_remove_lifecycle() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path(), "sleep", &["30"]);
        let id = runtime.create(&spec()).await.unwrap();
        assert_eq!(runtime.inspect(&id).await.unwrap().state, SandboxState::Created);

        runtime.start(&id).await.unwrap();
        assert!(runtime.inspect(&id).await.unwrap().is_running());
        assert!(matches!(
            runtime.remove(&id).await,
            Err(RuntimeError::InvalidState { .. })
        ));

        runtime.stop(&id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(runtime.inspect(&id).await.unwrap().state, SandboxState::Exited);
        // Stopping twice is fine.
        runtime.stop(&id, Duration::from_secs(5)).await.unwrap();

        runtime.remove(&id).await.unwrap();
        assert!(!dir.path().join("instances/bot1").exists());
        assert!(matches!(
            runtime.inspect(&id).await,
            Err(RuntimeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn exited_process_is_reported_with_code() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path(), "sh", &["-c", "echo hello; exit 3"]);
        let id = runtime.create(&spec()).await.unwrap();
        runtime.start(&id).await.unwrap();

        let status = loop {
            let status = runtime.inspect(&id).await.unwrap();
            if !status.is_running() {
                break status;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        };
        assert_eq!(status.exit_code, Some(3));
        assert_eq!(runtime.logs(&id, 10).await.unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn failed_stop_keeps_sandbox_running_and_protected() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path(), "sleep", &["30"]);
        let id = runtime.create(&spec()).await.unwrap();
        runtime.start(&id).await.unwrap();

        {
            let sandbox = runtime.sandbox(&id).unwrap();
            let mut sandbox = sandbox.lock().await;
            let err = record_halt(&mut sandbox, Err(RuntimeError::Transport("kill failed".into())));
            assert!(err.is_err());
        }

        assert!(runtime.inspect(&id).await.unwrap().is_running());
        assert!(matches!(
            runtime.remove(&id).await,
            Err(RuntimeError::InvalidState { .. })
        ));
        assert!(dir.path().join("instances/bot1").exists());

        runtime.stop(&id, Duration::from_secs(5)).await.unwrap();
        runtime.remove(&id).await.unwrap();
    }

    #[tokio::test]
    async fn missing_program_is_not_transient() {
        let dir = tempdir().unwrap();
        let runtime = runtime(dir.path(), "definitely-not-a-real-program-xyz", &[]);
        let id = runtime.create(&spec()).await.unwrap();
        let err = runtime.start(&id).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
