//! Broker connection and reconnection configuration.

use std::time::Duration;

use serde::Deserialize;

/// Backoff between broker connection attempts.
///
/// Missing keys fall back to [`ReconnectionConfig::default`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    pub initial_delay_ms: u64,
    /// Ceiling for the grown delay.
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Failed attempts in a row that pause reconnection for the cooldown.
    pub max_consecutive_failures: u32,
    pub circuit_breaker_cooldown_ms: u64,
}

impl ReconnectionConfig {
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.circuit_breaker_cooldown_ms)
    }
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            max_consecutive_failures: 10,
            circuit_breaker_cooldown_ms: 300_000,
        }
    }
}

/// Message broker settings.
///
/// Credentials are never read from the file; they come from
/// `BROKER_USERNAME` and `BROKER_PASSWORD`.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// WebSocket endpoint of the broker bridge.
    #[serde(default)]
    pub url: String,
    /// Topic prefix shared by every topic this control plane uses.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Queue size between handles and the connection task.
    #[serde(default = "default_capacity")]
    pub outbound_capacity: usize,
    /// Per-route inbound queue size.
    #[serde(default = "default_capacity")]
    pub route_capacity: usize,
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
    #[serde(skip)]
    pub username: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_namespace() -> String {
    "botfleet".to_string()
}

fn default_client_id() -> String {
    "botfleet-control".to_string()
}

const fn default_capacity() -> usize {
    1024
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            namespace: default_namespace(),
            client_id: default_client_id(),
            outbound_capacity: default_capacity(),
            route_capacity: default_capacity(),
            reconnection: ReconnectionConfig::default(),
            username: None,
            password: None,
        }
    }
}
