//! Market data feed manager settings.

use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Base WebSocket URL of the market data upstream.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// Interval between eviction sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Grace period an unreferenced feed survives.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How long a feed may stay unhealthy before it is reopened.
    #[serde(default = "default_unhealthy_timeout_secs")]
    pub unhealthy_timeout_secs: u64,
}

fn default_upstream_url() -> String {
    "wss://stream.binance.com:9443/ws".to_string()
}

const fn default_sweep_interval_secs() -> u64 {
    300
}

const fn default_idle_timeout_secs() -> u64 {
    600
}

const fn default_unhealthy_timeout_secs() -> u64 {
    60
}

impl FeedConfig {
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    #[must_use]
    pub const fn unhealthy_timeout(&self) -> Duration {
        Duration::from_secs(self.unhealthy_timeout_secs)
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            upstream_url: default_upstream_url(),
            sweep_interval_secs: default_sweep_interval_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            unhealthy_timeout_secs: default_unhealthy_timeout_secs(),
        }
    }
}
