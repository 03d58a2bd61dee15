//! Binance-style WebSocket market data upstream.
//!
//! One WebSocket per feed key: `{upstream_url}/{symbol}@{stream}` with
//! `trade`, `bookTicker`, `depth20@100ms` or `kline_{resolution}`.

mod message;

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::domain::{DataKind, FeedEvent, FeedKey, FeedPayload};
use crate::error::{Error, Result};
use crate::port::{FeedStream, FeedUpstream};

/// Silence after which a stream reports itself unhealthy.
const SILENCE_THRESHOLD: Duration = Duration::from_secs(30);

pub struct BinanceFeedUpstream {
    base_url: String,
}

impl BinanceFeedUpstream {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Stream URL for `key`.
    ///
    /// # Errors
    ///
    /// Candle keys need a resolution.
    pub fn stream_url(&self, key: &FeedKey) -> Result<String> {
        let symbol = key.trading_pair.replace(['-', '/'], "").to_lowercase();
        let stream = match key.kind {
            DataKind::Trades => "trade".to_string(),
            DataKind::Ticker => "bookTicker".to_string(),
            DataKind::OrderBook => "depth20@100ms".to_string(),
            DataKind::Candles => {
                let resolution = key
                    .resolution
                    .as_deref()
                    .ok_or_else(|| Error::Parse(format!("{key} has no resolution")))?;
                format!("kline_{resolution}")
            }
        };
        Ok(format!("{}/{symbol}@{stream}", self.base_url))
    }
}

#[async_trait]
impl FeedUpstream for BinanceFeedUpstream {
    async fn open(&self, key: &FeedKey) -> Result<Box<dyn FeedStream>> {
        let url = self.stream_url(key)?;
        info!(key = %key, url = %url, "Connecting to market stream");
        let (ws, response) = connect_async(url.as_str()).await?;
        debug!(key = %key, status = %response.status(), "Market stream connected");
        Ok(Box::new(BinanceStream {
            key: key.clone(),
            ws: Some(ws),
            silent: false,
            held: None,
        }))
    }

    fn name(&self) -> &'static str {
        "binance"
    }
}

struct BinanceStream {
    key: FeedKey,
    ws: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    silent: bool,
    /// Payload that arrived with a recovery; delivered after `Healthy`.
    held: Option<FeedPayload>,
}

#[async_trait]
impl FeedStream for BinanceStream {
    async fn next_event(&mut self) -> Option<FeedEvent> {
        if let Some(payload) = self.held.take() {
            return Some(FeedEvent::Data(payload));
        }
        let ws = self.ws.as_mut()?;
        loop {
            let frame = match tokio::time::timeout(SILENCE_THRESHOLD, ws.next()).await {
                Ok(frame) => frame,
                Err(_) if self.silent => continue,
                Err(_) => {
                    self.silent = true;
                    return Some(FeedEvent::Unhealthy {
                        reason: format!("no data for {}s", SILENCE_THRESHOLD.as_secs()),
                    });
                }
            };
            match frame {
                Some(Ok(Message::Text(text))) => match message::parse(self.key.kind, &text) {
                    Ok(payload) if self.silent => {
                        self.silent = false;
                        self.held = Some(payload);
                        return Some(FeedEvent::Healthy);
                    }
                    Ok(payload) => return Some(FeedEvent::Data(payload)),
                    Err(e) => {
                        trace!(key = %self.key, error = %e, "Skipping unrecognized frame");
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    info!(key = %self.key, frame = ?frame, "Market stream closed by server");
                    self.ws = None;
                    return None;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(key = %self.key, error = %e, "Market stream error");
                    self.ws = None;
                    return None;
                }
                None => {
                    self.ws = None;
                    return None;
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut ws) = self.ws.take() {
            let _ = ws.close(None).await;
            debug!(key = %self.key, "Market stream closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(kind: DataKind, resolution: Option<&str>) -> FeedKey {
        FeedKey::new("binance", "BTC-USDT", kind, resolution.map(String::from))
    }

    #[test]
    fn stream_urls() {
        let upstream = BinanceFeedUpstream::new("wss://stream.binance.com:9443/ws/");
        assert_eq!(
            upstream.stream_url(&key(DataKind::Trades, None)).unwrap(),
            "wss://stream.binance.com:9443/ws/btcusdt@trade"
        );
        assert_eq!(
            upstream.stream_url(&key(DataKind::Ticker, None)).unwrap(),
            "wss://stream.binance.com:9443/ws/btcusdt@bookTicker"
        );
        assert_eq!(
            upstream.stream_url(&key(DataKind::OrderBook, None)).unwrap(),
            "wss://stream.binance.com:9443/ws/btcusdt@depth20@100ms"
        );
        assert_eq!(
            upstream.stream_url(&key(DataKind::Candles, Some("1m"))).unwrap(),
            "wss://stream.binance.com:9443/ws/btcusdt@kline_1m"
        );
    }

    #[test]
    fn candles_without_resolution_fail() {
        let upstream = BinanceFeedUpstream::new("wss://example");
        assert!(upstream.stream_url(&key(DataKind::Candles, None)).is_err());
    }
}
