//! WebSocket bridge to the message broker.
//!
//! Speaks a small JSON framing over one WebSocket connection:
//!
//! - client → broker: `{"op":"subscribe","topics":[..]}` and
//!   `{"op":"publish","topic":..,"payload":..}`
//! - broker → client: `{"op":"message","topic":..,"payload":..}`
//!
//! Credentials, when configured, travel as `username`/`password` query
//! parameters on the connect URL.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::domain::BrokerMessage;
use crate::error::{Error, Result};
use crate::infrastructure::config::broker::BrokerConfig;
use crate::port::BrokerTransport;

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Subscribe { topics: &'a [String] },
    Publish { topic: &'a str, payload: &'a str },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServerFrame {
    Message { topic: String, payload: String },
    #[serde(other)]
    Other,
}

pub struct WebSocketBroker {
    url: Url,
    ws: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl WebSocketBroker {
    /// Build the transport from broker settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL does not parse.
    pub fn new(config: &BrokerConfig) -> Result<Self> {
        let mut url = Url::parse(&config.url)?;
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            url.query_pairs_mut()
                .append_pair("client_id", &config.client_id)
                .append_pair("username", username)
                .append_pair("password", password);
        } else {
            url.query_pairs_mut()
                .append_pair("client_id", &config.client_id);
        }
        Ok(Self { url, ws: None })
    }

    fn ws(&mut self) -> Result<&mut WebSocketStream<MaybeTlsStream<TcpStream>>> {
        self.ws
            .as_mut()
            .ok_or_else(|| Error::Connection("Not connected".into()))
    }

    async fn send(&mut self, frame: &ClientFrame<'_>) -> Result<()> {
        let json = serde_json::to_string(frame)?;
        let ws = self.ws()?;
        if let Err(e) = ws.send(Message::Text(json)).await {
            self.ws = None;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerTransport for WebSocketBroker {
    async fn connect(&mut self) -> Result<()> {
        if let Some(mut old) = self.ws.take() {
            let _ = old.close(None).await;
        }
        info!(host = self.url.host_str().unwrap_or_default(), "Connecting to broker");
        let (ws, response) = connect_async(self.url.as_str()).await?;
        info!(status = %response.status(), "Broker WebSocket connected");
        self.ws = Some(ws);
        Ok(())
    }

    async fn subscribe(&mut self, filters: &[String]) -> Result<()> {
        debug!(filters = ?filters, "Subscribing to broker topics");
        self.send(&ClientFrame::Subscribe { topics: filters }).await
    }

    async fn publish(&mut self, message: BrokerMessage) -> Result<()> {
        trace!(topic = %message.topic, bytes = message.payload.len(), "Publishing");
        self.send(&ClientFrame::Publish {
            topic: &message.topic,
            payload: &message.payload,
        })
        .await
    }

    async fn next_message(&mut self) -> Option<BrokerMessage> {
        let ws = self.ws.as_mut()?;
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Message { topic, payload }) => {
                        return Some(BrokerMessage::new(topic, payload));
                    }
                    Ok(ServerFrame::Other) => {}
                    Err(e) => warn!(error = %e, bytes = text.len(), "Failed to parse broker frame"),
                },
                // Pongs are queued by tungstenite and flushed on the next write.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    info!(frame = ?frame, "Broker closed the connection");
                    self.ws = None;
                    return None;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Broker WebSocket error");
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

    fn name(&self) -> &'static str {
        "websocket"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_frame_shape() {
        let frame = ClientFrame::Publish {
            topic: "fleet/bots/a/command",
            payload: "{}",
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["op"], "publish");
        assert_eq!(json["topic"], "fleet/bots/a/command");
        assert_eq!(json["payload"], "{}");
    }

    #[test]
    fn subscribe_frame_lists_topics() {
        let topics = vec!["fleet/bots/+/status".to_string()];
        let json = serde_json::to_string(&ClientFrame::Subscribe { topics: &topics }).unwrap();
        assert_eq!(json, r#"{"op":"subscribe","topics":["fleet/bots/+/status"]}"#);
    }

    #[test]
    fn server_frames_parse() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"op":"message","topic":"t","payload":"p"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Message { topic, payload } if topic == "t" && payload == "p"));

        let frame: ServerFrame = serde_json::from_str(r#"{"op":"suback"}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Other));
    }

    #[test]
    fn credentials_go_into_query() {
        let config = BrokerConfig {
            url: "wss://broker.example/ws".into(),
            username: Some("ops".into()),
            password: Some("s3cret".into()),
            ..BrokerConfig::default()
        };
        let broker = WebSocketBroker::new(&config).unwrap();
        let pairs: Vec<(String, String)> = broker
            .url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(pairs.contains(&("username".into(), "ops".into())));
        assert!(pairs.contains(&("password".into(), "s3cret".into())));
        assert!(broker.ws.is_none());
    }

    #[test]
    fn invalid_url_is_rejected() {
        let config = BrokerConfig {
            url: "not a url".into(),
            ..BrokerConfig::default()
        };
        assert!(WebSocketBroker::new(&config).is_err());
    }
}
