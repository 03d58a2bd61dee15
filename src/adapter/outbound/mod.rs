//! Outbound adapters (driven side).

pub mod archive;
pub mod binance;
pub mod process_runtime;
pub mod websocket_broker;

pub use archive::{HttpObjectStore, LocalArchive};
pub use binance::BinanceFeedUpstream;
pub use process_runtime::ProcessRuntime;
pub use websocket_broker::WebSocketBroker;
