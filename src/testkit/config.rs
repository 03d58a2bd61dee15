//! Canonical test configurations.
//!
//! Single source of truth for config structs used across tests.

use crate::infrastructure::config::archive::ArchiveConfig;
use crate::infrastructure::config::broker::{BrokerConfig, ReconnectionConfig};
use crate::infrastructure::config::orchestrator::OrchestratorConfig;
use crate::infrastructure::config::runtime::RuntimeConfig;

/// Fast reconnection config with short delays.
pub fn reconnection() -> ReconnectionConfig {
    ReconnectionConfig {
        initial_delay_ms: 10,
        max_delay_ms: 100,
        backoff_multiplier: 2.0,
        max_consecutive_failures: 100,
        circuit_breaker_cooldown_ms: 1000,
    }
}

pub fn broker() -> BrokerConfig {
    BrokerConfig {
        url: "ws://broker.test:9001".into(),
        namespace: "test".into(),
        reconnection: reconnection(),
        ..BrokerConfig::default()
    }
}

/// Orchestrator timings: 10s start/stop, 60s heartbeat, 5s health ticks.
pub fn orchestrator() -> OrchestratorConfig {
    OrchestratorConfig {
        start_timeout_secs: 10,
        stop_timeout_secs: 10,
        heartbeat_timeout_secs: 60,
        health_check_interval_secs: 5,
        max_deploy_attempts: 3,
        sandbox_stop_timeout_secs: 1,
        ..OrchestratorConfig::default()
    }
}

/// No runtime retries, so scripted failures surface immediately.
pub fn runtime() -> RuntimeConfig {
    RuntimeConfig {
        max_retries: 0,
        retry_delay_ms: 1,
        ..RuntimeConfig::default()
    }
}

pub fn archive(max_attempts: u32) -> ArchiveConfig {
    ArchiveConfig {
        max_attempts,
        initial_backoff_ms: 1000,
        max_backoff_ms: 4000,
        ..ArchiveConfig::default()
    }
}
