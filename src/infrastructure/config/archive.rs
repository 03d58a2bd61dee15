//! Archival settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Remote object store target.
///
/// The access token is read from `ARCHIVE_ACCESS_TOKEN`.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteArchiveConfig {
    pub endpoint: String,
    /// Bucket used when a stop request names none.
    pub bucket: String,
    #[serde(skip)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    #[serde(default = "default_local_dir")]
    pub local_dir: PathBuf,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default)]
    pub remote: Option<RemoteArchiveConfig>,
}

fn default_local_dir() -> PathBuf {
    PathBuf::from("bots/archived")
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    1000
}

const fn default_max_backoff_ms() -> u64 {
    30000
}

impl ArchiveConfig {
    /// Delay after failed attempt `attempt` (1-based), doubling up to the cap.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            local_dir: default_local_dir(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            remote: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = ArchiveConfig {
            initial_backoff_ms: 1000,
            max_backoff_ms: 5000,
            ..ArchiveConfig::default()
        };
        assert_eq!(config.backoff(1), Duration::from_millis(1000));
        assert_eq!(config.backoff(2), Duration::from_millis(2000));
        assert_eq!(config.backoff(3), Duration::from_millis(4000));
        assert_eq!(config.backoff(4), Duration::from_millis(5000));
        assert_eq!(config.backoff(60), Duration::from_millis(5000));
    }
}
