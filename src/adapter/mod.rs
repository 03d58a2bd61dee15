//! Adapters (hexagonal edges).
//!
//! - [`inbound`] - Command-line interface driving the control plane
//! - [`outbound`] - Implementations of the outbound ports

pub mod inbound;
pub mod outbound;
