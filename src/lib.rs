//! Botfleet - control plane for a fleet of sandboxed trading bots.
//!
//! Deploys bots into isolated sandboxes, drives their lifecycle over a
//! message broker, shares live market data feeds between them and archives
//! their data when they stop.
//!
//! # Architecture
//!
//! - **`domain`** - Bot records and lifecycle, feed keys and payloads, broker
//!   envelopes and topics
//! - **`port`** - Traits for the broker, sandbox runtime, market data
//!   upstream and archive storage
//! - **`application`** - Bot Orchestrator, Market Data Feed Manager, Archival
//!   Worker
//! - **`infrastructure`** - Broker Client, Runtime Controller, configuration,
//!   status file and bootstrap
//! - **`adapter`** - WebSocket broker, local process runtime, Binance feed,
//!   archive stores and the CLI
//!
//! # Example
//!
//! ```no_run
//! use botfleet::infrastructure::bootstrap::ControlPlane;
//! use botfleet::infrastructure::config::Config;
//!
//! # async fn demo() -> botfleet::error::Result<()> {
//! let config = Config::load("botfleet.toml")?;
//! config.init_logging();
//! let plane = ControlPlane::start(&config)?;
//! plane.deploy_all(&config.bots).await;
//! for bot in plane.orchestrator.list() {
//!     println!("{} {}", bot.name, bot.state);
//! }
//! plane.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod port;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
