//! Runtime Controller: the orchestrator's view of a sandbox runtime.
//!
//! Wraps any [`SandboxRuntime`] and repeats idempotent calls when the runtime
//! reports a transient transport failure. `create` is never repeated here;
//! whether a failed create deserves another attempt is the orchestrator's
//! decision.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::SandboxId;
use crate::error::RuntimeError;
use crate::infrastructure::config::runtime::RuntimeConfig;
use crate::port::{SandboxRuntime, SandboxSpec, SandboxStatus};

#[derive(Clone)]
pub struct RuntimeController {
    runtime: Arc<dyn SandboxRuntime>,
    max_retries: u32,
    retry_delay: Duration,
}

impl RuntimeController {
    pub fn new(runtime: Arc<dyn SandboxRuntime>, config: &RuntimeConfig) -> Self {
        Self {
            runtime,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }

    /// Run `call`, repeating it while it fails transiently.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, id: &SandboxId, call: F) -> Result<T, RuntimeError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        op,
                        sandbox = %id,
                        attempt,
                        error = %e,
                        "Transient runtime failure, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                result => return result,
            }
        }
    }

    /// Create a sandbox. Not retried.
    pub async fn create(&self, spec: &SandboxSpec) -> Result<SandboxId, RuntimeError> {
        let id = self.runtime.create(spec).await?;
        debug!(bot = %spec.name, sandbox = %id, "Sandbox created");
        Ok(id)
    }

    pub async fn start(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.with_retry("start", id, || self.runtime.start(id)).await
    }

    pub async fn stop(&self, id: &SandboxId, timeout: Duration) -> Result<(), RuntimeError> {
        self.with_retry("stop", id, || self.runtime.stop(id, timeout))
            .await
    }

    pub async fn remove(&self, id: &SandboxId) -> Result<(), RuntimeError> {
        self.with_retry("remove", id, || self.runtime.remove(id)).await
    }

    pub async fn inspect(&self, id: &SandboxId) -> Result<SandboxStatus, RuntimeError> {
        self.with_retry("inspect", id, || self.runtime.inspect(id)).await
    }

    /// Stop then remove, treating an already missing sandbox as done.
    pub async fn halt_and_remove(&self, id: &SandboxId, timeout: Duration) -> Result<(), RuntimeError> {
        match self.stop(id, timeout).await {
            Ok(()) | Err(RuntimeError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
        match self.remove(id).await {
            Ok(()) | Err(RuntimeError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[must_use]
    pub fn data_dir(&self, id: &SandboxId) -> PathBuf {
        self.runtime.data_dir(id)
    }

    pub async fn logs(&self, id: &SandboxId, tail: usize) -> Result<Vec<String>, RuntimeError> {
        self.with_retry("logs", id, || self.runtime.logs(id, tail))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BotDeployment, BotName};
    use crate::testkit::runtime::FakeRuntime;
    use std::collections::BTreeMap;

    fn config(max_retries: u32) -> RuntimeConfig {
        RuntimeConfig {
            max_retries,
            retry_delay_ms: 10,
            ..RuntimeConfig::default()
        }
    }

    fn spec(name: &str) -> SandboxSpec {
        SandboxSpec {
            name: BotName::new(name).unwrap(),
            deployment: BotDeployment::script("master", None),
            env: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn transient_start_failures_are_retried() {
        let fake = Arc::new(FakeRuntime::new());
        let controller = RuntimeController::new(fake.clone(), &config(3));
        let id = controller.create(&spec("bot1")).await.unwrap();

        fake.fail_next("start", RuntimeError::Transport("reset".into()), 2);
        controller.start(&id).await.unwrap();
        assert_eq!(fake.call_count("start"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let fake = Arc::new(FakeRuntime::new());
        let controller = RuntimeController::new(fake.clone(), &config(2));
        let id = controller.create(&spec("bot1")).await.unwrap();

        fake.fail_next("inspect", RuntimeError::Transport("reset".into()), 10);
        let err = controller.inspect(&id).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(fake.call_count("inspect"), 3);
    }

    #[tokio::test]
    async fn create_is_never_retried() {
        let fake = Arc::new(FakeRuntime::new());
        let controller = RuntimeController::new(fake.clone(), &config(3));

        fake.fail_next("create", RuntimeError::Transport("reset".into()), 1);
        assert!(controller.create(&spec("bot1")).await.is_err());
        assert_eq!(fake.call_count("create"), 1);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let fake = Arc::new(FakeRuntime::new());
        let controller = RuntimeController::new(fake.clone(), &config(3));
        let id = controller.create(&spec("bot1")).await.unwrap();
        controller.start(&id).await.unwrap();

        let err = controller.remove(&id).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidState { .. }));
        assert_eq!(fake.call_count("remove"), 1);
    }

    #[tokio::test]
    async fn halt_and_remove_tolerates_missing_sandbox() {
        let fake = Arc::new(FakeRuntime::new());
        let controller = RuntimeController::new(fake.clone(), &config(0));
        let id = controller.create(&spec("bot1")).await.unwrap();
        controller.start(&id).await.unwrap();

        controller
            .halt_and_remove(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!fake.exists(&id));
        controller
            .halt_and_remove(&id, Duration::from_secs(1))
            .await
            .unwrap();
    }
}
