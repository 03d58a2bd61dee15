//! Composition root: wires adapters into the control plane and runs it.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::adapter::outbound::{
    BinanceFeedUpstream, HttpObjectStore, LocalArchive, ProcessRuntime, WebSocketBroker,
};
use crate::application::{
    spawn_control_bridge, spawn_feed_bridge, ArchivalWorker, FeedManager, Orchestrator,
    OrchestratorDeps,
};
use crate::domain::Topics;
use crate::error::Result;
use crate::infrastructure::broker::{BrokerClient, BrokerHandle};
use crate::infrastructure::config::broker::BrokerConfig;
use crate::infrastructure::config::{BotEntry, Config};
use crate::infrastructure::runtime::RuntimeController;
use crate::infrastructure::status_file::StatusWriter;
use crate::port::ArchiveStore;

/// Environment every sandbox inherits so the bot can reach the broker.
pub(crate) fn sandbox_env(broker: &BrokerConfig) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("BROKER_URL".to_string(), broker.url.clone()),
        ("BROKER_NAMESPACE".to_string(), broker.namespace.clone()),
    ]);
    if let Some(username) = &broker.username {
        env.insert("BROKER_USERNAME".to_string(), username.clone());
    }
    if let Some(password) = &broker.password {
        env.insert("BROKER_PASSWORD".to_string(), password.clone());
    }
    env
}

pub(crate) fn build_archival(config: &Config) -> ArchivalWorker {
    let local: Arc<dyn ArchiveStore> = Arc::new(LocalArchive::new(config.archive.local_dir.clone()));
    let remote = config.archive.remote.as_ref().map(|remote| {
        info!(endpoint = %remote.endpoint, bucket = %remote.bucket, "Remote archive enabled");
        Arc::new(HttpObjectStore::new(
            remote.endpoint.clone(),
            remote.access_token.clone(),
        )) as Arc<dyn ArchiveStore>
    });
    ArchivalWorker::new(local, remote, config.archive.clone())
}

/// Running control plane. Dropping it leaves the background tasks running;
/// call [`ControlPlane::shutdown`] to stop them.
pub struct ControlPlane {
    pub orchestrator: Orchestrator,
    pub feeds: FeedManager,
    pub broker: BrokerHandle,
    tasks: Vec<JoinHandle<()>>,
}

impl ControlPlane {
    /// Connect to the broker and start every component.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker URL cannot be used.
    pub fn start(config: &Config) -> Result<Self> {
        let topics = Topics::new(config.broker.namespace.clone());

        let transport = WebSocketBroker::new(&config.broker)?;
        let (broker, broker_task) = BrokerClient::spawn(transport, &config.broker);
        info!(url = %config.broker.url, namespace = %config.broker.namespace, "Broker client started");

        let feeds = FeedManager::new(
            Arc::new(BinanceFeedUpstream::new(config.feeds.upstream_url.clone())),
            &config.feeds,
        );
        let sweeper = feeds.spawn_sweeper(config.feeds.sweep_interval());
        let bridge = spawn_feed_bridge(feeds.clone(), broker.clone(), topics.clone());

        let runtime = RuntimeController::new(Arc::new(ProcessRuntime::new(&config.runtime)), &config.runtime);

        let (orchestrator, orchestrator_task) = Orchestrator::spawn(OrchestratorDeps {
            broker: broker.clone(),
            runtime,
            archival: build_archival(config),
            topics: topics.clone(),
            config: config.orchestrator.clone(),
            sandbox_env: sandbox_env(&config.broker),
        });

        let control = spawn_control_bridge(orchestrator.clone(), broker.clone(), topics);
        let status = spawn_status_writer(config, orchestrator.clone(), feeds.clone(), broker.clone());

        Ok(Self {
            orchestrator,
            feeds,
            broker,
            tasks: vec![broker_task, sweeper, bridge, orchestrator_task, control, status],
        })
    }

    /// Deploy the bots listed in the configuration. Failures are logged and
    /// do not stop the remaining deployments.
    pub async fn deploy_all(&self, bots: &[BotEntry]) -> usize {
        let mut deployed = 0;
        for entry in bots {
            match self
                .orchestrator
                .deploy(entry.name.clone(), entry.deployment.clone())
                .await
            {
                Ok(_) => deployed += 1,
                Err(e) => error!(bot = %entry.name, error = %e, "Failed to deploy configured bot"),
            }
        }
        deployed
    }

    /// Stop the control plane. Bot processes keep running.
    pub async fn shutdown(self) {
        self.orchestrator.shutdown().await;
        self.feeds.shutdown().await;
        self.broker.shutdown().await;
        for task in self.tasks {
            task.abort();
        }
    }
}

fn spawn_status_writer(
    config: &Config,
    orchestrator: Orchestrator,
    feeds: FeedManager,
    broker: BrokerHandle,
) -> JoinHandle<()> {
    let writer = StatusWriter::new(
        config.status_file.clone(),
        &config.broker.url,
        &config.broker.namespace,
    );
    let period = config.status_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            writer.update(&orchestrator.list(), feeds.active_feeds(), broker.is_connected());
            if let Err(e) = writer.write() {
                warn!(path = %writer.path().display(), error = %e, "Failed to write status file");
            }
        }
    })
}

/// Run until `shutdown` flips to `true`.
///
/// # Errors
///
/// Returns an error if startup fails.
pub async fn run_with_shutdown(config: Config, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    info!(bots = config.bots.len(), "Starting botfleet");

    let plane = ControlPlane::start(&config)?;
    let deployed = plane.deploy_all(&config.bots).await;
    if !config.bots.is_empty() {
        info!(deployed, configured = config.bots.len(), "Configured bots deployed");
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        if shutdown.changed().await.is_err() {
            break;
        }
    }

    info!("Shutting down control plane");
    plane.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::archive::RemoteArchiveConfig;
    use crate::port::ArchiveDestination;

    #[test]
    fn sandbox_env_carries_broker_coordinates() {
        let broker = BrokerConfig {
            url: "ws://broker:9001".into(),
            namespace: "prod".into(),
            ..BrokerConfig::default()
        };
        let env = sandbox_env(&broker);
        assert_eq!(env["BROKER_URL"], "ws://broker:9001");
        assert_eq!(env["BROKER_NAMESPACE"], "prod");
        assert!(!env.contains_key("BROKER_USERNAME"));
    }

    #[test]
    fn sandbox_env_includes_credentials_when_set() {
        let broker = BrokerConfig {
            username: Some("ops".into()),
            password: Some("pw".into()),
            ..BrokerConfig::default()
        };
        let env = sandbox_env(&broker);
        assert_eq!(env["BROKER_USERNAME"], "ops");
        assert_eq!(env["BROKER_PASSWORD"], "pw");
    }

    #[test]
    fn remote_destination_needs_remote_config() {
        let mut config = Config::default();
        let worker = build_archival(&config);
        let remote = ArchiveDestination::Remote {
            bucket: "cold".into(),
        };
        assert!(worker.check_destination(&remote).is_err());

        config.archive.remote = Some(RemoteArchiveConfig {
            endpoint: "https://objects.example.com".into(),
            bucket: "cold".into(),
            access_token: None,
        });
        let worker = build_archival(&config);
        assert!(worker.check_destination(&remote).is_ok());
        assert!(worker.check_destination(&ArchiveDestination::Local).is_ok());
    }
}
