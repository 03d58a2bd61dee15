//! Sandbox runtime settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    /// Parent directory of every bot's sandbox directory.
    #[serde(default = "default_instances_dir")]
    pub instances_dir: PathBuf,
    /// Credential profiles copied into new sandboxes.
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,
    /// Bot executable launched inside each sandbox.
    #[serde(default = "default_program")]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Retries for transient runtime failures. Never applied to create.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_instances_dir() -> PathBuf {
    PathBuf::from("bots/instances")
}

fn default_credentials_dir() -> PathBuf {
    PathBuf::from("bots/credentials")
}

fn default_program() -> String {
    "hummingbot".to_string()
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_delay_ms() -> u64 {
    200
}

impl RuntimeConfig {
    #[must_use]
    pub const fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instances_dir: default_instances_dir(),
            credentials_dir: default_credentials_dir(),
            program: default_program(),
            args: Vec::new(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}
