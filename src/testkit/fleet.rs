//! A complete control plane on in-memory adapters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use super::archive::FlakyArchive;
use super::broker::{MemoryBroker, SimulatedBot};
use super::config;
use super::runtime::FakeRuntime;
use crate::application::{ArchivalWorker, Orchestrator, OrchestratorDeps};
use crate::domain::{BotDeployment, BotEvent, BotName, BotSnapshot, BotState, Topics};
use crate::infrastructure::broker::{BrokerClient, BrokerHandle};
use crate::infrastructure::config::archive::ArchiveConfig;
use crate::infrastructure::config::orchestrator::OrchestratorConfig;
use crate::infrastructure::runtime::RuntimeController;

/// Longest any helper waits, in virtual time.
const WAIT_LIMIT: Duration = Duration::from_secs(3600);

pub struct Fleet {
    pub broker: MemoryBroker,
    pub handle: BrokerHandle,
    pub runtime: Arc<FakeRuntime>,
    pub archive: FlakyArchive,
    pub orchestrator: Orchestrator,
    pub topics: Topics,
}

impl Fleet {
    /// Orchestrator with the default test config and an archive that works.
    #[must_use]
    pub fn start() -> Self {
        Self::with(config::orchestrator(), FlakyArchive::failing(0), config::archive(3))
    }

    #[must_use]
    pub fn with(config: OrchestratorConfig, archive: FlakyArchive, archive_config: ArchiveConfig) -> Self {
        let broker = MemoryBroker::new();
        let broker_config = config::broker();
        let topics = Topics::new(broker_config.namespace.clone());
        let (handle, _task) = BrokerClient::spawn(broker.transport(), &broker_config);
        let runtime = Arc::new(FakeRuntime::new());

        let (orchestrator, _task) = Orchestrator::spawn(OrchestratorDeps {
            broker: handle.clone(),
            runtime: RuntimeController::new(runtime.clone(), &config::runtime()),
            archival: ArchivalWorker::new(Arc::new(archive.clone()), None, archive_config),
            topics: topics.clone(),
            config,
            sandbox_env: BTreeMap::from([(
                "BROKER_URL".to_string(),
                broker_config.url.clone(),
            )]),
        });

        Self {
            broker,
            handle,
            runtime,
            archive,
            orchestrator,
            topics,
        }
    }

    /// A bot answering on `name`'s command topic.
    #[must_use]
    pub fn bot(&self, name: &BotName) -> SimulatedBot {
        SimulatedBot::spawn(&self.broker, &self.topics, name)
    }

    /// Deploy a script bot and wait until it runs.
    pub async fn deploy_running(&self, name: &BotName) -> BotSnapshot {
        let mut events = self.orchestrator.subscribe();
        self.orchestrator
            .deploy(name.clone(), BotDeployment::script("master", None))
            .await
            .expect("deploy accepted");
        self.wait_for(&mut events, name, BotState::Running).await
    }

    /// Wait until `name` reaches `state`, using `events` subscribed before
    /// the action that should cause it.
    pub async fn wait_for(
        &self,
        events: &mut broadcast::Receiver<BotEvent>,
        name: &BotName,
        state: BotState,
    ) -> BotSnapshot {
        wait_for_state(&self.orchestrator, events, name, state).await
    }
}

/// Wait until `name` reaches `state`. Panics after an hour of virtual time.
pub async fn wait_for_state(
    orchestrator: &Orchestrator,
    events: &mut broadcast::Receiver<BotEvent>,
    name: &BotName,
    state: BotState,
) -> BotSnapshot {
    let reached = async {
        loop {
            if let Ok(snapshot) = orchestrator.get(name) {
                if snapshot.state == state {
                    return snapshot;
                }
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("orchestrator stopped"),
            }
        }
    };
    tokio::time::timeout(WAIT_LIMIT, reached)
        .await
        .unwrap_or_else(|_| panic!("{name} never reached {state}"))
}

/// Wait until `name` has been removed.
pub async fn wait_for_removal(
    orchestrator: &Orchestrator,
    events: &mut broadcast::Receiver<BotEvent>,
    name: &BotName,
) {
    let removed = async {
        while orchestrator.get(name).is_ok() {
            if let Err(broadcast::error::RecvError::Closed) = events.recv().await {
                panic!("orchestrator stopped");
            }
        }
    };
    tokio::time::timeout(WAIT_LIMIT, removed)
        .await
        .unwrap_or_else(|_| panic!("{name} was never removed"));
}
