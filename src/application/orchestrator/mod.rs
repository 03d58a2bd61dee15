//! Bot Orchestrator.
//!
//! Owns the lifecycle of every bot: deploy, start, health, stop, archive and
//! removal. Requests are serialized through a single dispatch loop; reads
//! come from a registry of snapshots that the loop refreshes after every
//! change, so `get` and `list` never wait on in-flight work.

mod actor;
mod message;

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument};

use crate::application::archival::ArchivalWorker;
use crate::domain::{BotDeployment, BotEvent, BotName, BotSnapshot, Topics};
use crate::error::ControlError;
use crate::infrastructure::broker::BrokerHandle;
use crate::infrastructure::config::orchestrator::OrchestratorConfig;
use crate::infrastructure::runtime::RuntimeController;
use crate::port::ArchiveDestination;

use actor::{Actor, Routes};
use message::{Reply, Request};

pub use message::StopOptions;

/// Everything the orchestrator needs to run.
pub struct OrchestratorDeps {
    pub broker: BrokerHandle,
    pub runtime: RuntimeController,
    pub archival: ArchivalWorker,
    pub topics: Topics,
    pub config: OrchestratorConfig,
    /// Base environment for every sandbox, e.g. broker coordinates.
    pub sandbox_env: BTreeMap<String, String>,
}

/// Handle to the running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    requests: mpsc::Sender<Request>,
    registry: Arc<DashMap<BotName, BotSnapshot>>,
    events: broadcast::Sender<BotEvent>,
}

fn stopped() -> ControlError {
    ControlError::UpstreamUnavailable("orchestrator has stopped".into())
}

impl Orchestrator {
    /// Subscribe to bot traffic and start the dispatch loop.
    pub fn spawn(deps: OrchestratorDeps) -> (Self, JoinHandle<()>) {
        let (requests_tx, requests_rx) = mpsc::channel(deps.config.request_capacity);
        let (events, _) = broadcast::channel(deps.config.event_capacity);
        let registry = Arc::new(DashMap::new());

        let routes = Routes {
            status: deps.broker.route(deps.topics.all_status()),
            logs: deps.broker.route(deps.topics.all_logs()),
        };
        let actor = Actor::new(
            deps.broker,
            deps.runtime,
            deps.archival,
            deps.topics,
            deps.config,
            deps.sandbox_env,
            Arc::clone(&registry),
            events.clone(),
        );
        let task = tokio::spawn(
            actor
                .run(requests_rx, routes)
                .instrument(info_span!("orchestrator")),
        );

        (
            Self {
                requests: requests_tx,
                registry,
                events,
            },
            task,
        )
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, ControlError> {
        let (tx, rx) = oneshot::channel();
        self.requests.send(build(tx)).await.map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    /// Create a bot and bring it up. Returns once provisioning has begun.
    ///
    /// # Errors
    ///
    /// [`ControlError::Conflict`] if a live bot already has this name,
    /// [`ControlError::InvalidRequest`] for an invalid deployment.
    pub async fn deploy(&self, name: BotName, deployment: BotDeployment) -> Result<BotSnapshot, ControlError> {
        self.call(|reply| Request::Deploy {
            name,
            deployment,
            reply,
        })
        .await
    }

    /// Ask a running bot to stop, archiving afterwards unless skipped.
    ///
    /// # Errors
    ///
    /// [`ControlError::NotFound`], or [`ControlError::InvalidState`] unless
    /// the bot is running.
    pub async fn stop(&self, name: &BotName, options: StopOptions) -> Result<BotSnapshot, ControlError> {
        let name = name.clone();
        self.call(|reply| Request::Stop {
            name,
            options,
            reply,
        })
        .await
    }

    /// Archive a stopped bot with a fresh attempt budget.
    pub async fn archive(
        &self,
        name: &BotName,
        destination: ArchiveDestination,
    ) -> Result<BotSnapshot, ControlError> {
        let name = name.clone();
        self.call(|reply| Request::Archive {
            name,
            destination,
            reply,
        })
        .await
    }

    /// Redeploy a failed bot.
    ///
    /// # Errors
    ///
    /// [`ControlError::PersistentFailure`] once the deploy attempt budget is
    /// spent.
    pub async fn retry(&self, name: &BotName) -> Result<BotSnapshot, ControlError> {
        let name = name.clone();
        self.call(|reply| Request::Retry { name, reply }).await
    }

    /// Tear down the sandbox and forget the bot.
    pub async fn remove(&self, name: &BotName) -> Result<(), ControlError> {
        let name = name.clone();
        self.call(|reply| Request::Remove { name, reply }).await
    }

    /// # Errors
    ///
    /// [`ControlError::NotFound`] for an unknown bot.
    pub fn get(&self, name: &BotName) -> Result<BotSnapshot, ControlError> {
        self.registry
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ControlError::NotFound(format!("bot {name}")))
    }

    /// Every bot, ordered by name.
    #[must_use]
    pub fn list(&self) -> Vec<BotSnapshot> {
        let mut bots: Vec<BotSnapshot> = self
            .registry
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        bots.sort_by(|a, b| a.name.cmp(&b.name));
        bots
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.events.subscribe()
    }

    /// Stop the dispatch loop. Bots are left as they are.
    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }
}
