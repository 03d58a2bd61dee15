//! Archive storage port.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::BotName;
use crate::error::Error;

/// Where a stopped bot's data goes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArchiveDestination {
    #[default]
    Local,
    Remote { bucket: String },
}

/// One archival request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveJob {
    pub bot: BotName,
    /// Directory to copy.
    pub source: PathBuf,
    /// Target bucket for object stores; ignored by local archives.
    pub bucket: Option<String>,
}

/// Proof of a completed archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveReceipt {
    pub location: String,
    pub files: usize,
    pub bytes: u64,
}

/// Copies bot data to cold storage.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn archive(&self, job: &ArchiveJob) -> Result<ArchiveReceipt, Error>;

    fn name(&self) -> &'static str;
}
