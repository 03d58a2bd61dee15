//! The orchestrator's dispatch loop.
//!
//! One task owns every [`BotInstance`]. Requests, broker traffic, health
//! ticks and I/O completions are applied one at a time, so transitions for
//! an instance never interleave. Slow work (runtime calls, command round
//! trips, archival) runs in spawned tasks that report back through the
//! completion channel tagged with the generation that started them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::message::{Completion, ProvisionFailure, Request};
use super::StopOptions;
use crate::application::archival::{ArchivalWorker, ArchiveProgress};
use crate::domain::envelope::decode_log;
use crate::domain::{
    BotChannel, BotDeployment, BotEvent, BotInstance, BotName, BotSnapshot, BotState,
    BrokerMessage, CommandAction, CommandEnvelope, DesiredState, LogEntry, ReportedState,
    SandboxId, StatusEnvelope, Topics,
};
use crate::error::{ControlError, RuntimeError};
use crate::infrastructure::broker::BrokerHandle;
use crate::infrastructure::config::orchestrator::OrchestratorConfig;
use crate::infrastructure::runtime::RuntimeController;
use crate::port::{ArchiveDestination, SandboxSpec};

/// Output lines kept from a sandbox that exited on its own.
const CRASH_OUTPUT_LINES: usize = 20;

/// I/O an instance is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Provision,
    Start,
    Stop,
    Halt,
    Archive,
    RemoveSandbox,
    Inspect,
    Remove,
}

impl Operation {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Provision => "provision",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Halt => "halt",
            Self::Archive => "archive",
            Self::RemoveSandbox => "remove-sandbox",
            Self::Inspect => "inspect",
            Self::Remove => "remove",
        }
    }
}

struct Slot {
    instance: BotInstance,
    generation: u64,
    busy: Option<Operation>,
    /// Receipt time of the last heartbeat, on the runtime clock.
    last_seen: Instant,
    deadline: Option<Instant>,
    archive_to: Option<ArchiveDestination>,
}

impl Slot {
    fn new(instance: BotInstance) -> Self {
        Self {
            instance,
            generation: 0,
            busy: None,
            last_seen: Instant::now(),
            deadline: None,
            archive_to: None,
        }
    }

    fn begin(&mut self, operation: Operation) -> u64 {
        self.generation += 1;
        self.busy = Some(operation);
        self.generation
    }

    fn finish(&mut self) {
        self.generation += 1;
        self.busy = None;
        self.deadline = None;
    }

    fn ensure_idle(&self) -> Result<(), ControlError> {
        match self.busy {
            Some(operation) => Err(ControlError::invalid_state(
                self.instance.name().as_str(),
                format!("{} in progress", operation.as_str()),
            )),
            None => Ok(()),
        }
    }
}

pub(crate) struct Actor {
    bots: HashMap<BotName, Slot>,
    broker: BrokerHandle,
    runtime: RuntimeController,
    archival: ArchivalWorker,
    topics: Topics,
    config: OrchestratorConfig,
    sandbox_env: BTreeMap<String, String>,
    registry: Arc<DashMap<BotName, BotSnapshot>>,
    events: broadcast::Sender<BotEvent>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
}

pub(crate) struct Routes {
    pub status: mpsc::Receiver<BrokerMessage>,
    pub logs: mpsc::Receiver<BrokerMessage>,
}

fn not_found(name: &BotName) -> ControlError {
    ControlError::NotFound(format!("bot {name}"))
}

fn reported(state: ReportedState) -> &'static str {
    match state {
        ReportedState::Starting => "starting",
        ReportedState::Running => "running",
        ReportedState::Stopped => "stopped",
        ReportedState::Error => "error",
        ReportedState::Crashed => "crashed",
        ReportedState::Rejected => "rejected",
    }
}

/// Human readable reason for a failed or rejected report.
fn failure_reason(context: &str, status: &StatusEnvelope) -> String {
    match status.error_detail() {
        Some(detail) => format!("{context}: bot reported {}: {detail}", reported(status.state)),
        None => format!("{context}: bot reported {}", reported(status.state)),
    }
}

impl Actor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        broker: BrokerHandle,
        runtime: RuntimeController,
        archival: ArchivalWorker,
        topics: Topics,
        config: OrchestratorConfig,
        sandbox_env: BTreeMap<String, String>,
        registry: Arc<DashMap<BotName, BotSnapshot>>,
        events: broadcast::Sender<BotEvent>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            bots: HashMap::new(),
            broker,
            runtime,
            archival,
            topics,
            config,
            sandbox_env,
            registry,
            events,
            completions_tx,
            completions_rx,
        }
    }

    pub(crate) async fn run(mut self, mut requests: mpsc::Receiver<Request>, mut routes: Routes) {
        let mut health = tokio::time::interval(self.config.health_check_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(namespace = self.topics.namespace(), "Orchestrator started");

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Shutdown) | None => break,
                    Some(request) => self.handle_request(request),
                },
                Some(completion) = self.completions_rx.recv() => self.handle_completion(completion),
                Some(message) = routes.status.recv() => self.handle_status(&message),
                Some(message) = routes.logs.recv() => self.handle_log(&message),
                _ = health.tick() => self.check_health(),
            }
        }

        info!(bots = self.bots.len(), "Orchestrator stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Deploy {
                name,
                deployment,
                reply,
            } => {
                let _ = reply.send(self.deploy(name, deployment));
            }
            Request::Stop {
                name,
                options,
                reply,
            } => {
                let _ = reply.send(self.stop(&name, options));
            }
            Request::Archive {
                name,
                destination,
                reply,
            } => {
                let _ = reply.send(self.archive(&name, destination));
            }
            Request::Retry { name, reply } => {
                let _ = reply.send(self.retry(&name));
            }
            Request::Remove { name, reply } => {
                let _ = reply.send(self.remove(&name));
            }
            Request::Shutdown => {}
        }
    }

    // ---- requests ----

    fn deploy(&mut self, name: BotName, deployment: BotDeployment) -> Result<BotSnapshot, ControlError> {
        deployment.validate()?;
        let leftover = match self.bots.get(&name) {
            Some(slot) if !slot.instance.state().is_terminal() => {
                return Err(ControlError::Conflict(format!(
                    "bot {name} already exists in state {}",
                    slot.instance.state()
                )));
            }
            Some(slot) if slot.busy.is_some() => {
                return Err(ControlError::Conflict(format!(
                    "bot {name} is still being cleaned up"
                )));
            }
            Some(slot) => slot.instance.sandbox_id().cloned(),
            None => None,
        };

        info!(bot = %name, replaces_sandbox = leftover.is_some(), "Deploying bot");
        let instance = BotInstance::new(name.clone(), deployment, Utc::now());
        self.bots.insert(name.clone(), Slot::new(instance));
        self.publish(&name);
        self.provision(&name, leftover)
    }

    fn stop(&mut self, name: &BotName, options: StopOptions) -> Result<BotSnapshot, ControlError> {
        let state = self.slot(name)?.instance.state();
        if state != BotState::Running {
            return Err(ControlError::invalid_state(
                name.as_str(),
                format!("cannot stop a bot in state {state}"),
            ));
        }
        if !options.skip_archive {
            self.archival.check_destination(&options.destination)?;
        }

        let slot = self.slot_mut(name)?;
        if options.skip_archive {
            slot.archive_to = None;
            slot.instance.set_desired(DesiredState::Stopped);
        } else {
            slot.archive_to = Some(options.destination);
            slot.instance.set_desired(DesiredState::Archived);
        }
        self.transition(name, BotState::Stopping)?;
        self.send_command(name, CommandAction::Stop);
        self.snapshot(name)
    }

    fn archive(&mut self, name: &BotName, destination: ArchiveDestination) -> Result<BotSnapshot, ControlError> {
        let slot = self.slot(name)?;
        slot.ensure_idle()?;
        let state = slot.instance.state();
        if state != BotState::Stopped {
            return Err(ControlError::invalid_state(
                name.as_str(),
                format!("cannot archive a bot in state {state}"),
            ));
        }
        self.archival.check_destination(&destination)?;

        self.slot_mut(name)?.instance.set_desired(DesiredState::Archived);
        self.start_archive(name, destination)?;
        self.snapshot(name)
    }

    fn retry(&mut self, name: &BotName) -> Result<BotSnapshot, ControlError> {
        let max_attempts = self.config.max_deploy_attempts;
        let slot = self.slot_mut(name)?;
        slot.ensure_idle()?;
        let state = slot.instance.state();
        if state != BotState::Error {
            return Err(ControlError::invalid_state(
                name.as_str(),
                format!("only failed bots can be retried, bot is {state}"),
            ));
        }
        let attempts = slot.instance.deploy_attempts();
        if attempts >= max_attempts {
            return Err(ControlError::PersistentFailure {
                attempts,
                reason: format!("bot {name} exhausted its deploy attempts"),
            });
        }

        let leftover = slot.instance.sandbox_id().cloned();
        slot.instance.set_sandbox(None);
        slot.instance.set_desired(DesiredState::Running);
        info!(bot = %name, attempt = attempts + 1, "Retrying deploy");
        self.provision(name, leftover)
    }

    fn remove(&mut self, name: &BotName) -> Result<(), ControlError> {
        let slot = self.slot_mut(name)?;
        slot.ensure_idle()?;
        let state = slot.instance.state();
        if !matches!(
            state,
            BotState::Stopped | BotState::Error | BotState::Archived
        ) {
            return Err(ControlError::invalid_state(
                name.as_str(),
                format!("cannot remove a bot in state {state}, stop it first"),
            ));
        }
        slot.instance.set_desired(DesiredState::Removed);

        let Some(sandbox) = slot.instance.sandbox_id().cloned() else {
            self.forget(name);
            return Ok(());
        };
        let generation = slot.begin(Operation::Remove);
        self.publish(name);

        let runtime = self.runtime.clone();
        let tx = self.completions_tx.clone();
        let timeout = self.config.sandbox_stop_timeout();
        let name = name.clone();
        tokio::spawn(async move {
            let result = runtime.halt_and_remove(&sandbox, timeout).await;
            let _ = tx.send(Completion::Removed {
                name,
                generation,
                result,
            });
        });
        Ok(())
    }

    // ---- lifecycle steps ----

    fn provision(&mut self, name: &BotName, leftover: Option<SandboxId>) -> Result<BotSnapshot, ControlError> {
        self.transition(name, BotState::Provisioning)?;
        let env = self.sandbox_env(name);
        let slot = self.slot_mut(name)?;
        let generation = slot.begin(Operation::Provision);
        let spec = SandboxSpec {
            name: name.clone(),
            deployment: slot.instance.deployment().clone(),
            env,
        };

        let runtime = self.runtime.clone();
        let tx = self.completions_tx.clone();
        let timeout = self.config.sandbox_stop_timeout();
        let name = name.clone();
        let snapshot = self.snapshot(&name);
        tokio::spawn(async move {
            let result = provision_sandbox(&runtime, &spec, leftover, timeout).await;
            let _ = tx.send(Completion::Provisioned {
                name,
                generation,
                result,
            });
        });
        snapshot
    }

    /// Publish a start or stop command and wait for its acknowledgement.
    fn send_command(&mut self, name: &BotName, action: CommandAction) {
        let timeout = match action {
            CommandAction::Start => self.config.start_timeout(),
            CommandAction::Stop => self.config.stop_timeout(),
        };
        let topic = self.topics.command(name);
        let Some(slot) = self.bots.get_mut(name) else {
            return;
        };
        let params = match action {
            CommandAction::Start => slot.instance.capabilities().start_params.clone(),
            CommandAction::Stop => Value::Object(serde_json::Map::new()),
        };
        let generation = slot.begin(match action {
            CommandAction::Start => Operation::Start,
            CommandAction::Stop => Operation::Stop,
        });
        slot.deadline = Some(Instant::now() + timeout);
        let command = CommandEnvelope::new(action, params);
        debug!(bot = %name, action = %action, correlation_id = %command.correlation_id, "Sending command");

        let broker = self.broker.clone();
        let tx = self.completions_tx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let result = broker.request(topic, &command, timeout).await;
            let completion = match action {
                CommandAction::Start => Completion::StartReply {
                    name,
                    generation,
                    result,
                },
                CommandAction::Stop => Completion::StopReply {
                    name,
                    generation,
                    result,
                },
            };
            let _ = tx.send(completion);
        });
    }

    /// Keep waiting for a heartbeat until the current command's deadline.
    fn await_deadline(&mut self, name: &BotName) {
        let Some(slot) = self.bots.get(name) else {
            return;
        };
        let Some(deadline) = slot.deadline else {
            return;
        };
        let generation = slot.generation;
        let tx = self.completions_tx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(Completion::Deadline { name, generation });
        });
    }

    /// The bot confirmed it stopped: halt its sandbox, then archive if asked.
    fn stopped(&mut self, name: &BotName) {
        if self.transition(name, BotState::Stopped).is_err() {
            return;
        }
        let sandbox_stop_timeout = self.config.sandbox_stop_timeout();
        let Some(slot) = self.bots.get_mut(name) else {
            return;
        };
        slot.finish();
        let Some(sandbox) = slot.instance.sandbox_id().cloned() else {
            self.after_halt(name);
            return;
        };
        let generation = slot.begin(Operation::Halt);

        let runtime = self.runtime.clone();
        let tx = self.completions_tx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let result = runtime.stop(&sandbox, sandbox_stop_timeout).await;
            let _ = tx.send(Completion::SandboxHalted {
                name,
                generation,
                result,
            });
        });
    }

    fn after_halt(&mut self, name: &BotName) {
        let Some(slot) = self.bots.get_mut(name) else {
            return;
        };
        slot.finish();
        match slot.archive_to.take() {
            Some(destination) => {
                if let Err(e) = self.start_archive(name, destination) {
                    self.fail(name, format!("cannot archive: {e}"));
                }
            }
            None => self.publish(name),
        }
    }

    fn start_archive(&mut self, name: &BotName, destination: ArchiveDestination) -> Result<(), ControlError> {
        let slot = self.slot_mut(name)?;
        let Some(sandbox) = slot.instance.sandbox_id().cloned() else {
            return Err(ControlError::invalid_state(
                name.as_str(),
                "no sandbox data to archive",
            ));
        };
        slot.instance.reset_archive();
        let generation = slot.begin(Operation::Archive);
        let source = self.runtime.data_dir(&sandbox);
        self.publish(name);

        let worker = self.archival.clone();
        let tx = self.completions_tx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let progress_tx = tx.clone();
            let bot = name.clone();
            let result = worker
                .run(name.clone(), source, destination, move |progress| {
                    let _ = progress_tx.send(Completion::Archive {
                        name: bot.clone(),
                        generation,
                        progress,
                    });
                })
                .await;
            // Rejected before the first attempt, so no progress was reported.
            if let Err(ControlError::InvalidRequest(reason)) = result {
                let _ = tx.send(Completion::Archive {
                    name,
                    generation,
                    progress: ArchiveProgress::Exhausted {
                        attempts: 0,
                        error: reason,
                    },
                });
            }
        });
        Ok(())
    }

    fn inspect(&mut self, name: &BotName) {
        let Some(slot) = self.bots.get_mut(name) else {
            return;
        };
        let Some(sandbox) = slot.instance.sandbox_id().cloned() else {
            self.fail(name, "running without a sandbox");
            return;
        };
        let generation = slot.begin(Operation::Inspect);
        debug!(bot = %name, sandbox = %sandbox, "Heartbeat overdue, inspecting sandbox");

        let runtime = self.runtime.clone();
        let tx = self.completions_tx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let result = runtime.inspect(&sandbox).await;
            let output = match &result {
                Ok(status) if !status.is_running() => runtime
                    .logs(&sandbox, CRASH_OUTPUT_LINES)
                    .await
                    .unwrap_or_else(|e| {
                        debug!(bot = %name, error = %e, "No output from exited sandbox");
                        Vec::new()
                    }),
                _ => Vec::new(),
            };
            let _ = tx.send(Completion::Inspected {
                name,
                generation,
                result,
                output,
            });
        });
    }

    // ---- completions ----

    fn handle_completion(&mut self, completion: Completion) {
        let (name, generation) = {
            let (name, generation) = completion.target();
            (name.clone(), generation)
        };
        let live = self
            .bots
            .get(&name)
            .is_some_and(|slot| slot.generation == generation);
        if !live {
            trace!(bot = %name, generation, "Dropping stale completion");
            return;
        }

        match completion {
            Completion::Provisioned { result, .. } => self.on_provisioned(&name, result),
            Completion::StartReply { result, .. } => self.on_start_reply(&name, result),
            Completion::StopReply { result, .. } => self.on_stop_reply(&name, result),
            Completion::Deadline { .. } => self.on_deadline(&name),
            Completion::SandboxHalted { result, .. } => match result {
                Ok(()) | Err(RuntimeError::NotFound { .. }) => self.after_halt(&name),
                Err(e) => self.fail(&name, format!("sandbox failed to halt: {e}")),
            },
            Completion::Archive { progress, .. } => self.on_archive_progress(&name, progress),
            Completion::SandboxRemoved { result, .. } => self.on_sandbox_removed(&name, result),
            Completion::Inspected { result, output, .. } => self.on_inspected(&name, result, output),
            Completion::Removed { result, .. } => match result {
                Ok(()) => self.forget(&name),
                Err(e) => {
                    warn!(bot = %name, error = %e, "Sandbox removal failed, keeping record");
                    if let Some(slot) = self.bots.get_mut(&name) {
                        slot.finish();
                        slot.instance.set_cleanup_pending(true);
                    }
                    self.publish(&name);
                }
            },
        }
    }

    fn on_provisioned(&mut self, name: &BotName, result: Result<SandboxId, ProvisionFailure>) {
        match result {
            Ok(sandbox) => {
                if let Some(slot) = self.bots.get_mut(name) {
                    info!(bot = %name, sandbox = %sandbox, "Sandbox running");
                    slot.instance.set_sandbox(Some(sandbox));
                    slot.instance.set_cleanup_pending(false);
                    slot.finish();
                }
                if self.transition(name, BotState::Starting).is_ok() {
                    self.send_command(name, CommandAction::Start);
                }
            }
            Err(failure) => {
                if let Some(slot) = self.bots.get_mut(name) {
                    if failure.sandbox.is_some() {
                        slot.instance.set_sandbox(failure.sandbox);
                    }
                }
                self.fail(name, format!("provisioning failed: {}", failure.reason));
            }
        }
    }

    fn on_start_reply(&mut self, name: &BotName, result: Result<BrokerMessage, ControlError>) {
        let status = match result.map(|m| StatusEnvelope::decode(&m.payload)) {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return self.fail(name, format!("malformed start acknowledgement: {e}")),
            Err(e) => return self.fail(name, format!("start not confirmed: {e}")),
        };
        self.record_ack(name, &status);
        match status.state {
            ReportedState::Running => self.confirm_running(name),
            ReportedState::Starting => self.await_deadline(name),
            ReportedState::Stopped => self.fail(name, "bot reported stopped while starting"),
            ReportedState::Rejected | ReportedState::Error | ReportedState::Crashed => {
                self.fail(name, failure_reason("start failed", &status));
            }
        }
    }

    fn on_stop_reply(&mut self, name: &BotName, result: Result<BrokerMessage, ControlError>) {
        let status = match result.map(|m| StatusEnvelope::decode(&m.payload)) {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return self.fail(name, format!("malformed stop acknowledgement: {e}")),
            Err(e) => return self.fail(name, format!("stop not confirmed: {e}")),
        };
        self.record_ack(name, &status);
        match status.state {
            ReportedState::Stopped => self.stopped(name),
            ReportedState::Running | ReportedState::Starting => self.await_deadline(name),
            ReportedState::Rejected | ReportedState::Error | ReportedState::Crashed => {
                self.fail(name, failure_reason("stop failed", &status));
            }
        }
    }

    fn on_deadline(&mut self, name: &BotName) {
        let Some(state) = self.bots.get(name).map(|slot| slot.instance.state()) else {
            return;
        };
        let reason = match state {
            BotState::Starting => format!(
                "start not confirmed within {}s",
                self.config.start_timeout_secs
            ),
            BotState::Stopping => format!(
                "stop not confirmed within {}s",
                self.config.stop_timeout_secs
            ),
            _ => return,
        };
        self.fail(name, reason);
    }

    fn on_archive_progress(&mut self, name: &BotName, progress: ArchiveProgress) {
        match progress {
            ArchiveProgress::AttemptStarted { attempt } => {
                if let Some(slot) = self.bots.get_mut(name) {
                    slot.instance.record_archive_attempt();
                    debug!(bot = %name, attempt, "Archive attempt started");
                    if slot.instance.state() == BotState::Stopped {
                        let _ = self.transition(name, BotState::Archiving);
                    } else {
                        self.publish(name);
                    }
                }
            }
            ArchiveProgress::AttemptFailed {
                attempt,
                error,
                will_retry,
            } => {
                warn!(bot = %name, attempt, will_retry, error = %error, "Archive attempt failed");
                if self.state(name) == Some(BotState::Archiving) {
                    let _ = self.transition(name, BotState::Stopped);
                }
                self.emit(BotEvent::ArchiveFailed {
                    name: name.clone(),
                    attempt,
                    error,
                });
            }
            ArchiveProgress::Succeeded(receipt) => {
                info!(bot = %name, location = %receipt.location, bytes = receipt.bytes, "Bot archived, removing sandbox");
                self.remove_archived_sandbox(name);
            }
            ArchiveProgress::Exhausted { attempts, error } => {
                error!(bot = %name, attempts, error = %error, "Archival gave up, bot stays stopped");
                if self.state(name) == Some(BotState::Archiving) {
                    let _ = self.transition(name, BotState::Stopped);
                }
                if let Some(slot) = self.bots.get_mut(name) {
                    slot.finish();
                    let failure = ControlError::PersistentFailure {
                        attempts,
                        reason: error,
                    };
                    slot.instance.set_archive_error(Some(failure.to_string()));
                }
                self.publish(name);
            }
        }
    }

    fn remove_archived_sandbox(&mut self, name: &BotName) {
        let timeout = self.config.sandbox_stop_timeout();
        let Some(slot) = self.bots.get_mut(name) else {
            return;
        };
        let Some(sandbox) = slot.instance.sandbox_id().cloned() else {
            self.on_sandbox_removed(name, Ok(()));
            return;
        };
        let generation = slot.begin(Operation::RemoveSandbox);

        let runtime = self.runtime.clone();
        let tx = self.completions_tx.clone();
        let name = name.clone();
        tokio::spawn(async move {
            let result = runtime.halt_and_remove(&sandbox, timeout).await;
            let _ = tx.send(Completion::SandboxRemoved {
                name,
                generation,
                result,
            });
        });
    }

    fn on_sandbox_removed(&mut self, name: &BotName, result: Result<(), RuntimeError>) {
        match result {
            Ok(()) => {
                if let Some(slot) = self.bots.get_mut(name) {
                    slot.finish();
                    slot.instance.set_sandbox(None);
                    slot.instance.set_cleanup_pending(false);
                }
                let _ = self.transition(name, BotState::Archived);
            }
            Err(e) => self.fail(name, format!("archived but sandbox removal failed: {e}")),
        }
    }

    fn on_inspected(
        &mut self,
        name: &BotName,
        result: Result<crate::port::SandboxStatus, RuntimeError>,
        output: Vec<String>,
    ) {
        if let Some(slot) = self.bots.get_mut(name) {
            slot.finish();
            let now = Utc::now();
            for line in output {
                slot.instance.push_log(LogEntry {
                    level: "error".into(),
                    message: line,
                    timestamp: now,
                });
            }
        }
        match result {
            Ok(status) if status.is_running() => self.mark_unresponsive(name),
            Ok(status) => {
                let code = status
                    .exit_code
                    .map_or_else(|| "unknown".to_string(), |c| c.to_string());
                self.fail(name, format!("sandbox exited with code {code}"));
            }
            Err(RuntimeError::NotFound { .. }) => self.fail(name, "sandbox disappeared"),
            Err(e) => {
                warn!(bot = %name, error = %e, "Sandbox inspection failed");
                self.mark_unresponsive(name);
            }
        }
    }

    // ---- broker traffic ----

    fn handle_status(&mut self, message: &BrokerMessage) {
        let Some((name, BotChannel::Status)) = self.topics.parse_bot_topic(&message.topic) else {
            trace!(topic = %message.topic, "Ignoring message on unexpected topic");
            return;
        };
        let status = match StatusEnvelope::decode(&message.payload) {
            Ok(status) => status,
            Err(e) => {
                warn!(bot = %name, error = %e, "Malformed status message");
                return;
            }
        };
        let Some(slot) = self.bots.get_mut(&name) else {
            debug!(bot = %name, "Status for unknown bot");
            return;
        };
        let detail = (!status.detail.is_null()).then(|| status.detail.clone());
        if !slot.instance.observe_heartbeat(status.timestamp, detail) {
            debug!(bot = %name, at = %status.timestamp, "Ignoring out-of-order status");
            return;
        }
        slot.last_seen = Instant::now();
        let state = slot.instance.state();
        self.emit(BotEvent::Heartbeat {
            name: name.clone(),
            at: status.timestamp,
        });

        if status.state.is_failure() {
            self.fail(&name, failure_reason("heartbeat", &status));
            return;
        }
        match (state, status.state) {
            (BotState::Starting, ReportedState::Running) => self.confirm_running(&name),
            (BotState::Stopping, ReportedState::Stopped) => self.stopped(&name),
            (BotState::Running, ReportedState::Stopped) => {
                self.fail(&name, "bot stopped without a stop request");
            }
            _ => self.publish(&name),
        }
    }

    fn handle_log(&mut self, message: &BrokerMessage) {
        let Some((name, BotChannel::Log)) = self.topics.parse_bot_topic(&message.topic) else {
            return;
        };
        let Some(slot) = self.bots.get_mut(&name) else {
            return;
        };
        match decode_log(&message.payload) {
            Ok(entry) => {
                slot.instance.push_log(entry);
                self.publish(&name);
            }
            Err(e) => debug!(bot = %name, error = %e, "Malformed log message"),
        }
    }

    fn check_health(&mut self) {
        let timeout = self.config.heartbeat_timeout();
        let now = Instant::now();
        let overdue: Vec<BotName> = self
            .bots
            .iter()
            .filter(|(_, slot)| {
                slot.instance.state() == BotState::Running
                    && slot.busy.is_none()
                    && now.duration_since(slot.last_seen) >= timeout
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in overdue {
            self.inspect(&name);
        }
    }

    // ---- helpers ----

    fn slot(&self, name: &BotName) -> Result<&Slot, ControlError> {
        self.bots.get(name).ok_or_else(|| not_found(name))
    }

    fn slot_mut(&mut self, name: &BotName) -> Result<&mut Slot, ControlError> {
        self.bots.get_mut(name).ok_or_else(|| not_found(name))
    }

    fn state(&self, name: &BotName) -> Option<BotState> {
        self.bots.get(name).map(|slot| slot.instance.state())
    }

    fn snapshot(&self, name: &BotName) -> Result<BotSnapshot, ControlError> {
        Ok(self.slot(name)?.instance.snapshot())
    }

    fn sandbox_env(&self, name: &BotName) -> BTreeMap<String, String> {
        let mut env = self.sandbox_env.clone();
        env.insert("BOT_NAME".into(), name.to_string());
        env
    }

    fn record_ack(&mut self, name: &BotName, status: &StatusEnvelope) {
        if let Some(slot) = self.bots.get_mut(name) {
            let detail = (!status.detail.is_null()).then(|| status.detail.clone());
            if slot.instance.observe_heartbeat(status.timestamp, detail) {
                slot.last_seen = Instant::now();
            }
        }
    }

    fn confirm_running(&mut self, name: &BotName) {
        if self.transition(name, BotState::Running).is_ok() {
            if let Some(slot) = self.bots.get_mut(name) {
                slot.finish();
                slot.last_seen = Instant::now();
            }
        }
    }

    fn mark_unresponsive(&mut self, name: &BotName) {
        if let Some(slot) = self.bots.get_mut(name) {
            if slot.instance.state() == BotState::Running {
                warn!(bot = %name, "Bot is unresponsive but its sandbox is running");
                slot.instance.set_unresponsive(true);
            }
        }
        self.publish(name);
    }

    fn transition(&mut self, name: &BotName, next: BotState) -> Result<BotState, ControlError> {
        let slot = self.slot_mut(name)?;
        let from = slot.instance.transition(next, Utc::now()).inspect_err(|e| {
            warn!(bot = %name, to = %next, error = %e, "Rejected state change");
        })?;
        info!(bot = %name, from = %from, to = %next, "Bot state changed");
        self.emit(BotEvent::Transition {
            name: name.clone(),
            from,
            to: next,
            at: Utc::now(),
        });
        self.publish(name);
        Ok(from)
    }

    /// Force `Error`, abandon in-flight work and halt the sandbox in the
    /// background. Already terminal records are left alone.
    fn fail(&mut self, name: &BotName, reason: impl Into<String>) {
        let reason = reason.into();
        let Some(slot) = self.bots.get_mut(name) else {
            return;
        };
        let Some(from) = slot.instance.fail(reason.clone(), Utc::now()) else {
            debug!(bot = %name, reason = %reason, "Ignoring failure of terminal bot");
            return;
        };
        slot.finish();
        slot.archive_to = None;
        error!(bot = %name, from = %from, reason = %reason, "Bot failed");

        if let Some(sandbox) = slot.instance.sandbox_id().cloned() {
            slot.instance.set_cleanup_pending(true);
            let runtime = self.runtime.clone();
            let timeout = self.config.sandbox_stop_timeout();
            let bot = name.clone();
            tokio::spawn(async move {
                match runtime.stop(&sandbox, timeout).await {
                    Ok(()) | Err(RuntimeError::NotFound { .. }) => {
                        debug!(bot = %bot, sandbox = %sandbox, "Failed bot's sandbox halted");
                    }
                    Err(e) => warn!(bot = %bot, sandbox = %sandbox, error = %e, "Could not halt failed bot's sandbox"),
                }
            });
        }

        self.emit(BotEvent::Transition {
            name: name.clone(),
            from,
            to: BotState::Error,
            at: Utc::now(),
        });
        self.publish(name);
    }

    fn forget(&mut self, name: &BotName) {
        if self.bots.remove(name).is_some() {
            self.registry.remove(name);
            info!(bot = %name, "Bot removed");
            self.emit(BotEvent::Removed { name: name.clone() });
        }
    }

    fn publish(&self, name: &BotName) {
        if let Some(slot) = self.bots.get(name) {
            self.registry.insert(name.clone(), slot.instance.snapshot());
        }
    }

    fn emit(&self, event: BotEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Clear out a leftover sandbox, then create and start a fresh one.
async fn provision_sandbox(
    runtime: &RuntimeController,
    spec: &SandboxSpec,
    leftover: Option<SandboxId>,
    stop_timeout: std::time::Duration,
) -> Result<SandboxId, ProvisionFailure> {
    if let Some(old) = leftover {
        if let Err(e) = runtime.halt_and_remove(&old, stop_timeout).await {
            return Err(ProvisionFailure {
                reason: format!("could not clean up previous sandbox {old}: {e}"),
                sandbox: Some(old),
            });
        }
    }

    let sandbox = runtime.create(spec).await.map_err(|e| ProvisionFailure {
        sandbox: None,
        reason: e.to_string(),
    })?;
    match runtime.start(&sandbox).await {
        Ok(()) => Ok(sandbox),
        Err(e) => Err(ProvisionFailure {
            sandbox: Some(sandbox),
            reason: e.to_string(),
        }),
    }
}
