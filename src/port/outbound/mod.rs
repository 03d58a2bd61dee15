//! Outbound ports (driven side): interfaces implemented by outbound adapters.
//!
//! These contracts describe the external collaborators the control plane
//! drives: the message broker, the sandbox runtime, market data upstreams and
//! archive storage.

pub mod archive;
pub mod broker;
pub mod feed;
pub mod runtime;
