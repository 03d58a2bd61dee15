//! JSON snapshot of the fleet on disk, read back by `botfleet status`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::domain::{BotSnapshot, BotState, DesiredState, FeedInfo};
use crate::error::Result;

const STATUS_VERSION: &str = "1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusFile {
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    pub broker: StatusBroker,
    pub bots: Vec<StatusBot>,
    pub feeds: Vec<FeedInfo>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusBroker {
    pub url: String,
    pub namespace: String,
    pub connected: bool,
}

/// One row per bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusBot {
    pub name: String,
    pub state: BotState,
    pub desired: DesiredState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub deploy_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_error: Option<String>,
    pub cleanup_pending: bool,
    pub unresponsive: bool,
}

impl From<&BotSnapshot> for StatusBot {
    fn from(snapshot: &BotSnapshot) -> Self {
        Self {
            name: snapshot.name.to_string(),
            state: snapshot.state,
            desired: snapshot.desired,
            sandbox_id: snapshot.sandbox_id.as_ref().map(ToString::to_string),
            last_heartbeat: snapshot.last_heartbeat,
            deploy_attempts: snapshot.deploy_attempts,
            error: snapshot.error.clone(),
            archive_error: snapshot.archive_error.clone(),
            cleanup_pending: snapshot.cleanup_pending,
            unresponsive: snapshot.unresponsive,
        }
    }
}

/// Holds the latest fleet view and flushes it to disk on demand.
pub struct StatusWriter {
    path: PathBuf,
    status: Mutex<StatusFile>,
}

impl StatusWriter {
    #[must_use]
    pub fn new(path: PathBuf, broker_url: &str, namespace: &str) -> Self {
        let started_at = Utc::now();
        Self {
            path,
            status: Mutex::new(StatusFile {
                version: STATUS_VERSION.to_string(),
                started_at,
                pid: std::process::id(),
                broker: StatusBroker {
                    url: broker_url.to_string(),
                    namespace: namespace.to_string(),
                    connected: false,
                },
                bots: Vec::new(),
                feeds: Vec::new(),
                updated_at: started_at,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the fleet snapshot.
    pub fn update(&self, bots: &[BotSnapshot], feeds: Vec<FeedInfo>, broker_connected: bool) {
        let mut status = self.status.lock();
        status.bots = bots.iter().map(StatusBot::from).collect();
        status.feeds = feeds;
        status.broker.connected = broker_connected;
    }

    /// Stamp and flush the current view. Readers never see a partial file.
    pub fn write(&self) -> Result<()> {
        let body = {
            let mut status = self.status.lock();
            status.updated_at = Utc::now();
            serde_json::to_vec_pretty(&*status)?
        };
        replace_file(&self.path, &body)
    }
}

/// Write `body` beside `path` and rename it into place.
fn replace_file(path: &Path, body: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let staging = path.with_extension("tmp");
    let written = fs::File::create(&staging).and_then(|mut file| {
        file.write_all(body)?;
        file.sync_all()?;
        fs::rename(&staging, path)
    });
    if written.is_err() {
        let _ = fs::remove_file(&staging);
    }
    Ok(written?)
}

/// Read a status file written by [`StatusWriter`].
pub fn read_status_file(path: &Path) -> Result<StatusFile> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BotDeployment, BotInstance, BotName, DataKind, FeedKey};
    use tempfile::tempdir;

    fn snapshot() -> BotSnapshot {
        let mut bot = BotInstance::new(
            BotName::new("bot1").unwrap(),
            BotDeployment::script("master", None),
            Utc::now(),
        );
        bot.transition(BotState::Provisioning, Utc::now()).unwrap();
        bot.snapshot()
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("status.json");
        let writer = StatusWriter::new(path.clone(), "ws://localhost:9001", "fleet");

        let feed = FeedInfo {
            key: FeedKey::new("binance", "BTCUSDT", DataKind::Trades, None),
            references: 2,
            seconds_since_access: 3,
            expires_in_secs: None,
            healthy: true,
            degraded: false,
            has_data: true,
        };
        writer.update(&[snapshot()], vec![feed], true);
        writer.write().unwrap();

        let status = read_status_file(&path).unwrap();
        assert_eq!(status.version, STATUS_VERSION);
        assert!(status.broker.connected);
        assert_eq!(status.bots.len(), 1);
        assert_eq!(status.bots[0].name, "bot1");
        assert_eq!(status.bots[0].state, BotState::Provisioning);
        assert_eq!(status.feeds[0].references, 2);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn rewrite_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.json");
        let writer = StatusWriter::new(path.clone(), "ws://localhost:9001", "fleet");

        writer.update(&[snapshot()], Vec::new(), false);
        writer.write().unwrap();
        writer.update(&[], Vec::new(), false);
        writer.write().unwrap();

        assert!(read_status_file(&path).unwrap().bots.is_empty());
    }
}
