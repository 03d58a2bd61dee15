//! Broker reconnection backoff.

use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{error, info};

use crate::infrastructure::config::broker::ReconnectionConfig;

/// Decides how long to wait before the next connection attempt.
///
/// Delays grow geometrically up to `max_delay_ms`. After
/// `max_consecutive_failures` misses in a row the breaker opens and the next
/// wait is the rest of the cooldown.
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectionConfig,
    failures: u32,
    delay: Duration,
    open_until: Option<Instant>,
}

impl ReconnectPolicy {
    #[must_use]
    pub fn new(config: ReconnectionConfig) -> Self {
        let delay = config.initial_delay();
        Self {
            config,
            failures: 0,
            delay,
            open_until: None,
        }
    }

    /// Reset after a successful connection.
    pub fn reset(&mut self) {
        self.failures = 0;
        self.delay = self.config.initial_delay();
        self.open_until = None;
    }

    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.failures < self.config.max_consecutive_failures {
            return;
        }
        let cooldown = self.config.cooldown();
        self.open_until = Some(Instant::now() + cooldown);
        error!(
            failures = self.failures,
            cooldown_secs = cooldown.as_secs(),
            "Broker unreachable, pausing reconnection"
        );
    }

    /// Time to wait before the next attempt.
    pub fn next_wait(&mut self) -> Duration {
        match self.open_until.take() {
            Some(until) => {
                let remaining = until.saturating_duration_since(Instant::now());
                info!(remaining_secs = remaining.as_secs(), "Reconnection paused");
                self.reset();
                remaining
            }
            None => self.next_delay(),
        }
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.delay;
        let grown_ms = (base.as_millis() as f64 * self.config.backoff_multiplier) as u64;
        self.delay = Duration::from_millis(grown_ms.min(self.config.max_delay_ms));
        base + jitter(base)
    }
}

/// Uniform jitter of up to a fifth of `base`.
fn jitter(base: Duration) -> Duration {
    let spread = u64::try_from(base.as_millis() / 5).unwrap_or(u64::MAX);
    if spread == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
