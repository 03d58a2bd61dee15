//! Market data feed identity and payloads.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ControlError;

/// Kind of data carried by a feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataKind {
    #[serde(alias = "trade")]
    Trades,
    Ticker,
    OrderBook,
    #[serde(alias = "candle")]
    Candles,
}

impl DataKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Trades => "trades",
            Self::Ticker => "ticker",
            Self::OrderBook => "order_book",
            Self::Candles => "candles",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" | "trades" => Ok(Self::Trades),
            "ticker" => Ok(Self::Ticker),
            "order_book" | "orderbook" => Ok(Self::OrderBook),
            "candle" | "candles" => Ok(Self::Candles),
            other => Err(ControlError::InvalidRequest(format!(
                "unknown data kind {other:?}"
            ))),
        }
    }
}

/// Composite identity of a feed subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeedKey {
    pub exchange: String,
    pub trading_pair: String,
    pub kind: DataKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
}

impl FeedKey {
    pub fn new(
        exchange: impl Into<String>,
        trading_pair: impl Into<String>,
        kind: DataKind,
        resolution: Option<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            trading_pair: trading_pair.into(),
            kind,
            resolution,
        }
    }

    /// Check the key is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidRequest`] for empty fields or a candle
    /// feed without a resolution.
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.exchange.is_empty() || self.trading_pair.is_empty() {
            return Err(ControlError::InvalidRequest(
                "feed key needs an exchange and a trading pair".into(),
            ));
        }
        if self.kind == DataKind::Candles && self.resolution.is_none() {
            return Err(ControlError::InvalidRequest(
                "candle feeds need a resolution".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for FeedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.exchange, self.trading_pair, self.kind)?;
        if let Some(resolution) = &self.resolution {
            write!(f, ":{resolution}")?;
        }
        Ok(())
    }
}

/// A price level in an order book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// A single push from an upstream feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedPayload {
    Trade {
        price: Decimal,
        quantity: Decimal,
        buyer_is_maker: bool,
        timestamp: DateTime<Utc>,
    },
    Ticker {
        bid: Decimal,
        bid_quantity: Decimal,
        ask: Decimal,
        ask_quantity: Decimal,
    },
    OrderBook {
        bids: Vec<PriceLevel>,
        asks: Vec<PriceLevel>,
    },
    Candle {
        open_time: DateTime<Utc>,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
        volume: Decimal,
        closed: bool,
    },
}

/// What an upstream stream yields.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Data(FeedPayload),
    /// The upstream is alive but not delivering.
    Unhealthy { reason: String },
    Healthy,
}

/// Cached view of a feed returned by acquire and read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub key: FeedKey,
    /// Latest payload, `None` until the first push arrives.
    pub payload: Option<FeedPayload>,
    pub received_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    /// A reopen after a prolonged unhealthy period failed.
    pub degraded: bool,
}

impl FeedSnapshot {
    #[must_use]
    pub fn empty(key: FeedKey) -> Self {
        Self {
            key,
            payload: None,
            received_at: None,
            healthy: true,
            degraded: false,
        }
    }
}

/// Bookkeeping row for an active feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedInfo {
    pub key: FeedKey,
    pub references: usize,
    pub seconds_since_access: u64,
    /// Seconds until eviction when unreferenced; `None` while referenced.
    pub expires_in_secs: Option<u64>,
    pub healthy: bool,
    pub degraded: bool,
    pub has_data: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_display_includes_resolution() {
        let key = FeedKey::new("binance", "BTCUSDT", DataKind::Candles, Some("1m".into()));
        assert_eq!(key.to_string(), "binance:BTCUSDT:candles:1m");

        let key = FeedKey::new("binance", "BTCUSDT", DataKind::Trades, None);
        assert_eq!(key.to_string(), "binance:BTCUSDT:trades");
    }

    #[test]
    fn data_kind_accepts_singular_aliases() {
        assert_eq!("trade".parse::<DataKind>().unwrap(), DataKind::Trades);
        let kind: DataKind = serde_json::from_str("\"trade\"").unwrap();
        assert_eq!(kind, DataKind::Trades);
        assert!("depth".parse::<DataKind>().is_err());
    }

    #[test]
    fn candle_key_requires_resolution() {
        let key = FeedKey::new("binance", "BTCUSDT", DataKind::Candles, None);
        assert!(key.validate().is_err());
        let key = FeedKey::new("", "BTCUSDT", DataKind::Ticker, None);
        assert!(key.validate().is_err());
    }
}
