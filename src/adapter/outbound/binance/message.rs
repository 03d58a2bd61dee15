//! Binance market stream frames.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::domain::{DataKind, FeedPayload, PriceLevel};

fn millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[derive(Debug, Deserialize)]
pub(super) struct TradeMessage {
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
pub(super) struct BookTickerMessage {
    #[serde(rename = "b")]
    bid: Decimal,
    #[serde(rename = "B")]
    bid_quantity: Decimal,
    #[serde(rename = "a")]
    ask: Decimal,
    #[serde(rename = "A")]
    ask_quantity: Decimal,
}

#[derive(Debug, Deserialize)]
pub(super) struct DepthMessage {
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
}

#[derive(Debug, Deserialize)]
pub(super) struct KlineMessage {
    #[serde(rename = "k")]
    kline: Kline,
}

#[derive(Debug, Deserialize)]
pub(super) struct Kline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "x")]
    closed: bool,
}

fn levels(raw: Vec<(Decimal, Decimal)>) -> Vec<PriceLevel> {
    raw.into_iter()
        .map(|(price, quantity)| PriceLevel { price, quantity })
        .collect()
}

/// Parse one text frame for a stream of `kind`.
pub(super) fn parse(kind: DataKind, text: &str) -> serde_json::Result<FeedPayload> {
    Ok(match kind {
        DataKind::Trades => {
            let m: TradeMessage = serde_json::from_str(text)?;
            FeedPayload::Trade {
                price: m.price,
                quantity: m.quantity,
                buyer_is_maker: m.buyer_is_maker,
                timestamp: millis(m.trade_time),
            }
        }
        DataKind::Ticker => {
            let m: BookTickerMessage = serde_json::from_str(text)?;
            FeedPayload::Ticker {
                bid: m.bid,
                bid_quantity: m.bid_quantity,
                ask: m.ask,
                ask_quantity: m.ask_quantity,
            }
        }
        DataKind::OrderBook => {
            let m: DepthMessage = serde_json::from_str(text)?;
            FeedPayload::OrderBook {
                bids: levels(m.bids),
                asks: levels(m.asks),
            }
        }
        DataKind::Candles => {
            let k = serde_json::from_str::<KlineMessage>(text)?.kline;
            FeedPayload::Candle {
                open_time: millis(k.open_time),
                open: k.open,
                high: k.high,
                low: k.low,
                close: k.close,
                volume: k.volume,
                closed: k.closed,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn parses_trade() {
        let text = r#"{"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","T":1672515782136,"m":true,"M":true}"#;
        let payload = parse(DataKind::Trades, text).unwrap();
        assert_eq!(
            payload,
            FeedPayload::Trade {
                price: dec!(0.001),
                quantity: dec!(100),
                buyer_is_maker: true,
                timestamp: millis(1_672_515_782_136),
            }
        );
    }

    #[test]
    fn parses_book_ticker() {
        let text = r#"{"u":400900217,"s":"BNBUSDT","b":"25.35190000","B":"31.21000000","a":"25.36520000","A":"40.66000000"}"#;
        let FeedPayload::Ticker { bid, ask, .. } = parse(DataKind::Ticker, text).unwrap() else {
            panic!("expected ticker");
        };
        assert_eq!(bid, dec!(25.3519));
        assert_eq!(ask, dec!(25.3652));
    }

    #[test]
    fn parses_depth() {
        let text = r#"{"lastUpdateId":160,"bids":[["0.0024","10"]],"asks":[["0.0026","100"],["0.0027","5"]]}"#;
        let FeedPayload::OrderBook { bids, asks } = parse(DataKind::OrderBook, text).unwrap() else {
            panic!("expected order book");
        };
        assert_eq!(bids[0].price, dec!(0.0024));
        assert_eq!(asks.len(), 2);
    }

    #[test]
    fn parses_kline() {
        let text = r#"{"e":"kline","E":1672515782136,"s":"BNBBTC","k":{"t":1672515780000,"T":1672515839999,"s":"BNBBTC","i":"1m","o":"0.0010","c":"0.0020","h":"0.0025","l":"0.0015","v":"1000","n":100,"x":false}}"#;
        let FeedPayload::Candle { high, closed, .. } = parse(DataKind::Candles, text).unwrap() else {
            panic!("expected candle");
        };
        assert_eq!(high, dec!(0.0025));
        assert!(!closed);
    }

    #[test]
    fn rejects_frame_of_wrong_kind() {
        assert!(parse(DataKind::Trades, r#"{"result":null,"id":1}"#).is_err());
    }
}
