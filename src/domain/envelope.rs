//! Broker wire envelopes and the topic scheme.
//!
//! Every message is a JSON document published on a `/`-separated topic.
//! Commands flow to `{namespace}/bots/{name}/command`, bots answer on
//! `{namespace}/bots/{name}/status` and stream log lines on
//! `{namespace}/bots/{name}/log`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::bot::LogEntry;
use super::id::{BotName, CallerHandle, CorrelationId};

/// A raw message as carried by the broker transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: String,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Serialize `body` as the payload.
    ///
    /// # Errors
    ///
    /// Returns the serializer error if `body` cannot be encoded.
    pub fn json<T: Serialize>(topic: impl Into<String>, body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, serde_json::to_string(body)?))
    }

    /// Correlation id carried by the payload, if any.
    ///
    /// Only replies carry a `correlation_id` field; anything else, including
    /// non-JSON payloads, yields `None`.
    #[must_use]
    pub fn correlation_id(&self) -> Option<CorrelationId> {
        #[derive(Deserialize)]
        struct Peek {
            correlation_id: Option<CorrelationId>,
        }
        serde_json::from_str::<Peek>(&self.payload)
            .ok()
            .and_then(|peek| peek.correlation_id)
    }
}

/// Envelope decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unsupported action {action:?}")]
    UnsupportedAction {
        action: String,
        correlation_id: Option<CorrelationId>,
    },

    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Actions a bot understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAction {
    Start,
    Stop,
}

impl CommandAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }
}

impl fmt::Display for CommandAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command sent to a bot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandEnvelope {
    pub action: CommandAction,
    pub correlation_id: CorrelationId,
    pub params: Value,
    pub timestamp: DateTime<Utc>,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(action: CommandAction, params: Value) -> Self {
        Self {
            action,
            correlation_id: CorrelationId::generate(),
            params,
            timestamp: Utc::now(),
        }
    }

    /// Decode a command, distinguishing unknown actions from garbage.
    ///
    /// # Errors
    ///
    /// [`EnvelopeError::UnsupportedAction`] when the document is well formed
    /// but names an action outside [`CommandAction`].
    pub fn decode(payload: &str) -> Result<Self, EnvelopeError> {
        #[derive(Deserialize)]
        struct Raw {
            action: String,
            correlation_id: Option<CorrelationId>,
            #[serde(default)]
            params: Value,
            timestamp: Option<DateTime<Utc>>,
        }

        let raw: Raw = serde_json::from_str(payload)?;
        let Some(action) = CommandAction::parse(&raw.action) else {
            return Err(EnvelopeError::UnsupportedAction {
                action: raw.action,
                correlation_id: raw.correlation_id,
            });
        };
        Ok(Self {
            action,
            correlation_id: raw.correlation_id.unwrap_or_else(CorrelationId::generate),
            params: raw.params,
            timestamp: raw.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

/// Lifecycle state as reported by a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedState {
    Starting,
    Running,
    Stopped,
    Error,
    Crashed,
    /// The bot refused a command.
    Rejected,
}

impl ReportedState {
    /// Whether this report means the bot is broken.
    #[must_use]
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Crashed)
    }
}

/// Status report or acknowledgement published by a bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEnvelope {
    pub state: ReportedState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub detail: Value,
}

impl StatusEnvelope {
    #[must_use]
    pub fn heartbeat(state: ReportedState) -> Self {
        Self {
            state,
            correlation_id: None,
            timestamp: Utc::now(),
            detail: Value::Null,
        }
    }

    #[must_use]
    pub fn ack(state: ReportedState, correlation_id: CorrelationId) -> Self {
        Self {
            state,
            correlation_id: Some(correlation_id),
            timestamp: Utc::now(),
            detail: Value::Null,
        }
    }

    /// Acknowledgement for a command whose action is not understood.
    #[must_use]
    pub fn unsupported_action(action: &str, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            state: ReportedState::Rejected,
            correlation_id,
            timestamp: Utc::now(),
            detail: json!({ "error": "UnsupportedAction", "action": action }),
        }
    }

    /// # Errors
    ///
    /// Returns [`EnvelopeError::Malformed`] for invalid documents.
    pub fn decode(payload: &str) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Error text carried in `detail.error`, if any.
    #[must_use]
    pub fn error_detail(&self) -> Option<&str> {
        self.detail.get("error").and_then(Value::as_str)
    }
}

/// Decode a log topic payload.
///
/// # Errors
///
/// Returns [`EnvelopeError::Malformed`] for invalid documents.
pub fn decode_log(payload: &str) -> Result<LogEntry, EnvelopeError> {
    #[derive(Deserialize)]
    struct Raw {
        #[serde(default = "default_level")]
        level: String,
        message: String,
        timestamp: Option<DateTime<Utc>>,
    }

    fn default_level() -> String {
        "INFO".to_string()
    }

    let raw: Raw = serde_json::from_str(payload)?;
    Ok(LogEntry {
        level: raw.level,
        message: raw.message,
        timestamp: raw.timestamp.unwrap_or_else(Utc::now),
    })
}

/// Which per-bot channel a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotChannel {
    Command,
    Status,
    Log,
}

/// Topic names under one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
}

impl Topics {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn command(&self, bot: &BotName) -> String {
        format!("{}/bots/{bot}/command", self.namespace)
    }

    #[must_use]
    pub fn status(&self, bot: &BotName) -> String {
        format!("{}/bots/{bot}/status", self.namespace)
    }

    #[must_use]
    pub fn log(&self, bot: &BotName) -> String {
        format!("{}/bots/{bot}/log", self.namespace)
    }

    /// Filter matching every bot's status topic.
    #[must_use]
    pub fn all_status(&self) -> String {
        format!("{}/bots/+/status", self.namespace)
    }

    /// Filter matching every bot's log topic.
    #[must_use]
    pub fn all_logs(&self) -> String {
        format!("{}/bots/+/log", self.namespace)
    }

    #[must_use]
    pub fn feed_requests(&self) -> String {
        format!("{}/feeds/request", self.namespace)
    }

    #[must_use]
    pub fn feed_response(&self, caller: &CallerHandle) -> String {
        format!("{}/feeds/response/{caller}", self.namespace)
    }

    /// Operator commands for the running control plane.
    #[must_use]
    pub fn control_requests(&self) -> String {
        format!("{}/control/request", self.namespace)
    }

    /// Replies to one operator client's commands.
    #[must_use]
    pub fn control_response(&self, client: &str) -> String {
        format!("{}/control/response/{client}", self.namespace)
    }

    /// Split a per-bot topic into the bot name and channel.
    #[must_use]
    pub fn parse_bot_topic(&self, topic: &str) -> Option<(BotName, BotChannel)> {
        let rest = topic.strip_prefix(self.namespace.as_str())?.strip_prefix("/bots/")?;
        let (name, channel) = rest.split_once('/')?;
        let channel = match channel {
            "command" => BotChannel::Command,
            "status" => BotChannel::Status,
            "log" => BotChannel::Log,
            _ => return None,
        };
        Some((BotName::new(name).ok()?, channel))
    }
}

/// Whether `topic` matches `filter`.
///
/// `+` matches exactly one level, a trailing `#` matches any remainder
/// including none.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("ns/bots/+/status", "ns/bots/bot1/status"));
        assert!(!topic_matches("ns/bots/+/status", "ns/bots/bot1/log"));
        assert!(!topic_matches("ns/bots/+/status", "ns/bots/a/b/status"));
        assert!(topic_matches("ns/#", "ns/bots/bot1/status"));
        assert!(topic_matches("ns/bots/#", "ns/bots"));
        assert!(!topic_matches("ns/bots", "ns/bots/bot1"));
        assert!(topic_matches("ns/feeds/request", "ns/feeds/request"));
    }

    #[test]
    fn unknown_action_is_reported_with_correlation() {
        let err = CommandEnvelope::decode(r#"{"action":"pause","correlation_id":"c-1"}"#).unwrap_err();
        match err {
            EnvelopeError::UnsupportedAction {
                action,
                correlation_id,
            } => {
                assert_eq!(action, "pause");
                assert_eq!(correlation_id, Some(CorrelationId::from_string("c-1")));
            }
            other => panic!("unexpected {other:?}"),
        }

        let ack = StatusEnvelope::unsupported_action("pause", Some(CorrelationId::from_string("c-1")));
        assert_eq!(ack.state, ReportedState::Rejected);
        assert_eq!(ack.error_detail(), Some("UnsupportedAction"));
    }

    #[test]
    fn garbage_command_is_malformed() {
        assert!(matches!(
            CommandEnvelope::decode("not json"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn command_encodes_lowercase_action() {
        let cmd = CommandEnvelope::new(CommandAction::Start, json!({"script": "pmm.py"}));
        let text = serde_json::to_string(&cmd).unwrap();
        assert!(text.contains(r#""action":"start""#));
        let decoded = CommandEnvelope::decode(&text).unwrap();
        assert_eq!(decoded.correlation_id, cmd.correlation_id);
    }

    #[test]
    fn status_without_correlation() {
        let status = StatusEnvelope::decode(
            r#"{"state":"running","timestamp":"2024-01-01T00:00:00Z","detail":{"pnl":"1.5"}}"#,
        )
        .unwrap();
        assert_eq!(status.state, ReportedState::Running);
        assert!(status.correlation_id.is_none());
        let msg = BrokerMessage::json("t", &status).unwrap();
        assert!(msg.correlation_id().is_none());
    }

    #[test]
    fn peek_correlation_id() {
        let msg = BrokerMessage::new("t", r#"{"state":"stopped","correlation_id":"abc","timestamp":"2024-01-01T00:00:00Z"}"#);
        assert_eq!(msg.correlation_id(), Some(CorrelationId::from_string("abc")));
        assert!(BrokerMessage::new("t", "plain text").correlation_id().is_none());
    }

    #[test]
    fn parse_bot_topics() {
        let topics = Topics::new("fleet");
        let bot = BotName::new("bot1").unwrap();
        assert_eq!(
            topics.parse_bot_topic(&topics.status(&bot)),
            Some((bot.clone(), BotChannel::Status))
        );
        assert_eq!(
            topics.parse_bot_topic(&topics.log(&bot)),
            Some((bot, BotChannel::Log))
        );
        assert_eq!(topics.parse_bot_topic("other/bots/bot1/status"), None);
        assert_eq!(topics.parse_bot_topic("fleet/bots/bot1/metrics"), None);
    }

    #[test]
    fn log_decoding_defaults() {
        let entry = decode_log(r#"{"message":"hello"}"#).unwrap();
        assert_eq!(entry.level, "INFO");
        assert_eq!(entry.message, "hello");
    }
}
