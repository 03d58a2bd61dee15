//! Infrastructure layer.
//!
//! Technical concerns that support the application without containing
//! lifecycle rules.
//!
//! # Submodules
//!
//! - [`bootstrap`] - Composition root for runtime wiring
//! - [`broker`] - Broker Client: connection task, reconnection, routing
//! - [`config`] - Configuration loading and validation
//! - [`runtime`] - Runtime Controller with transient-failure retry
//! - [`status_file`] - JSON status snapshot for external monitoring

pub mod bootstrap;
pub mod broker;
pub mod config;
pub mod runtime;
pub mod status_file;
