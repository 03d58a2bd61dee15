//! Application configuration loading and validation.
//!
//! Provides the main [`Config`] struct that aggregates all application settings.
//! Configuration is loaded from a TOML file with environment variable overrides
//! for secrets (`BROKER_USERNAME`, `BROKER_PASSWORD`, `ARCHIVE_ACCESS_TOKEN`).
//!
//! # Example
//!
//! ```no_run
//! use botfleet::infrastructure::config::Config;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load("botfleet.toml")?;
//!     config.init_logging();
//!     Ok(())
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::archive::ArchiveConfig;
use super::broker::BrokerConfig;
use super::feeds::FeedConfig;
use super::logging::LoggingConfig;
use super::orchestrator::OrchestratorConfig;
use super::runtime::RuntimeConfig;
use crate::domain::{BotDeployment, BotName};
use crate::error::{ConfigError, Result};

/// A bot deployed when the control plane starts.
#[derive(Debug, Clone, Deserialize)]
pub struct BotEntry {
    pub name: BotName,
    #[serde(flatten)]
    pub deployment: BotDeployment,
}

/// Main application configuration.
///
/// Load from a TOML file using [`Config::load`] or parse directly with
/// [`Config::parse_toml`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Logging and tracing configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Broker connection, topic namespace and reconnection policy.
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub feeds: FeedConfig,

    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Path of the JSON status snapshot.
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,

    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,

    /// Bots deployed at startup.
    #[serde(default)]
    pub bots: Vec<BotEntry>,
}

fn default_status_file() -> PathBuf {
    PathBuf::from("botfleet.status.json")
}

const fn default_status_interval_secs() -> u64 {
    5
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn positive(field: &'static str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must be greater than 0".to_string(),
        }
        .into());
    }
    Ok(())
}

impl Config {
    /// Parse configuration from TOML content.
    ///
    /// Secrets are loaded from the environment, never from the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML content is malformed or validation fails.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content).map_err(ConfigError::Parse)?;

        config.broker.username = non_empty_env("BROKER_USERNAME");
        config.broker.password = non_empty_env("BROKER_PASSWORD");
        if let Some(remote) = config.archive.remote.as_mut() {
            remote.access_token = non_empty_env("ARCHIVE_ACCESS_TOKEN");
        }

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the TOML content is
    /// malformed, or validation fails.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::parse_toml(&content)
    }

    /// Initialize logging from the `[logging]` section.
    pub fn init_logging(&self) {
        self.logging.init();
    }

    #[must_use]
    pub const fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs)
    }

    /// Validate configuration values.
    fn validate(&self) -> Result<()> {
        if self.broker.url.is_empty() {
            return Err(ConfigError::MissingField { field: "broker.url" }.into());
        }
        let url = url::Url::parse(&self.broker.url).map_err(|e| ConfigError::InvalidValue {
            field: "broker.url",
            reason: e.to_string(),
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidValue {
                field: "broker.url",
                reason: format!("scheme must be ws or wss, got {}", url.scheme()),
            }
            .into());
        }
        if self.broker.namespace.is_empty() || self.broker.namespace.contains(['+', '#']) {
            return Err(ConfigError::InvalidValue {
                field: "broker.namespace",
                reason: "must be non-empty and free of wildcards".to_string(),
            }
            .into());
        }
        if self.broker.outbound_capacity == 0 || self.broker.route_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "broker capacities",
                reason: "must be greater than 0".to_string(),
            }
            .into());
        }

        let reconnection = &self.broker.reconnection;
        positive("initial_delay_ms", reconnection.initial_delay_ms)?;
        if reconnection.max_delay_ms < reconnection.initial_delay_ms {
            return Err(ConfigError::InvalidValue {
                field: "max_delay_ms",
                reason: "must be >= initial_delay_ms".to_string(),
            }
            .into());
        }
        if reconnection.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "backoff_multiplier",
                reason: "must be >= 1.0".to_string(),
            }
            .into());
        }
        positive(
            "max_consecutive_failures",
            u64::from(reconnection.max_consecutive_failures),
        )?;
        positive(
            "circuit_breaker_cooldown_ms",
            reconnection.circuit_breaker_cooldown_ms,
        )?;

        let orchestrator = &self.orchestrator;
        positive("start_timeout_secs", orchestrator.start_timeout_secs)?;
        positive("stop_timeout_secs", orchestrator.stop_timeout_secs)?;
        positive("heartbeat_timeout_secs", orchestrator.heartbeat_timeout_secs)?;
        positive(
            "health_check_interval_secs",
            orchestrator.health_check_interval_secs,
        )?;
        positive(
            "max_deploy_attempts",
            u64::from(orchestrator.max_deploy_attempts),
        )?;
        positive("event_capacity", orchestrator.event_capacity as u64)?;
        positive("request_capacity", orchestrator.request_capacity as u64)?;

        positive("sweep_interval_secs", self.feeds.sweep_interval_secs)?;
        positive("idle_timeout_secs", self.feeds.idle_timeout_secs)?;
        positive("unhealthy_timeout_secs", self.feeds.unhealthy_timeout_secs)?;

        if self.runtime.program.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "runtime.program",
            }
            .into());
        }

        positive("archive.max_attempts", u64::from(self.archive.max_attempts))?;
        positive("initial_backoff_ms", self.archive.initial_backoff_ms)?;
        if self.archive.max_backoff_ms < self.archive.initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "max_backoff_ms",
                reason: "must be >= initial_backoff_ms".to_string(),
            }
            .into());
        }
        if let Some(remote) = &self.archive.remote {
            url::Url::parse(&remote.endpoint).map_err(|e| ConfigError::InvalidValue {
                field: "archive.remote.endpoint",
                reason: e.to_string(),
            })?;
            if remote.bucket.is_empty() {
                return Err(ConfigError::MissingField {
                    field: "archive.remote.bucket",
                }
                .into());
            }
        }

        positive("status_interval_secs", self.status_interval_secs)?;

        let mut seen = HashSet::new();
        for entry in &self.bots {
            if !seen.insert(entry.name.clone()) {
                return Err(ConfigError::InvalidValue {
                    field: "bots",
                    reason: format!("duplicate bot name {}", entry.name),
                }
                .into());
            }
            entry
                .deployment
                .validate()
                .map_err(|e| ConfigError::InvalidValue {
                    field: "bots",
                    reason: format!("{}: {e}", entry.name),
                })?;
        }

        Ok(())
    }
}
