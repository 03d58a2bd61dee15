//! Shared test utilities available to both unit and integration tests.
//!
//! Enabled via `#[cfg(test)]` (unit tests) or the `testkit` feature
//! (integration tests).
//!
//! # Modules
//!
//! - [`broker`]: `MemoryBroker`, its transport, and `SimulatedBot`.
//! - [`runtime`]: `FakeRuntime`, an in-memory sandbox runtime.
//! - [`feed`]: `CountingUpstream` for the feed manager.
//! - [`archive`]: `FlakyArchive` with scripted failures.
//! - [`fleet`]: A full orchestrator wired onto the fakes.
//! - [`config`]: Canonical test configurations.

pub mod archive;
pub mod broker;
pub mod config;
pub mod feed;
pub mod fleet;
pub mod runtime;
