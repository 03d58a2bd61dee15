//! Bot orchestrator timing and capacity settings.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Time allowed between sending start and observing it confirmed.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Time allowed between sending stop and observing it confirmed.
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// A running bot silent for longer than this gets inspected.
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    /// Upper bound on deploy attempts, counting operator retries.
    #[serde(default = "default_max_deploy_attempts")]
    pub max_deploy_attempts: u32,
    /// Grace given to a sandbox before it is killed.
    #[serde(default = "default_sandbox_stop_timeout_secs")]
    pub sandbox_stop_timeout_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_request_capacity")]
    pub request_capacity: usize,
}

const fn default_start_timeout_secs() -> u64 {
    30
}

const fn default_stop_timeout_secs() -> u64 {
    30
}

const fn default_heartbeat_timeout_secs() -> u64 {
    60
}

const fn default_health_check_interval_secs() -> u64 {
    5
}

const fn default_max_deploy_attempts() -> u32 {
    3
}

const fn default_sandbox_stop_timeout_secs() -> u64 {
    10
}

const fn default_event_capacity() -> usize {
    256
}

const fn default_request_capacity() -> usize {
    64
}

impl OrchestratorConfig {
    #[must_use]
    pub const fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    #[must_use]
    pub const fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    #[must_use]
    pub const fn sandbox_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox_stop_timeout_secs)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            start_timeout_secs: default_start_timeout_secs(),
            stop_timeout_secs: default_stop_timeout_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            max_deploy_attempts: default_max_deploy_attempts(),
            sandbox_stop_timeout_secs: default_sandbox_stop_timeout_secs(),
            event_capacity: default_event_capacity(),
            request_capacity: default_request_capacity(),
        }
    }
}
