//! In-process broker, a [`BrokerTransport`] onto it, and a scripted bot.
//!
//! - [`MemoryBroker`]: Topic hub with wildcard filters. Can be taken
//!   offline to exercise reconnection.
//! - [`MemoryTransport`]: Client connection for the broker client.
//! - [`SimulatedBot`]: Answers start/stop commands the way a real bot
//!   would, with per-action scripted replies.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::{
    topic_matches, BotName, BrokerMessage, CommandAction, CommandEnvelope, EnvelopeError,
    ReportedState, StatusEnvelope, Topics,
};
use crate::error::Error;
use crate::port::BrokerTransport;

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

struct Connection {
    id: u64,
    /// Client connections are dropped when the broker goes offline.
    client: bool,
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

struct Hub {
    next_id: u64,
    online: bool,
    connects: u32,
    connections: Vec<Connection>,
    published: Vec<BrokerMessage>,
}

impl Hub {
    fn open(&mut self, client: bool, filters: Vec<String>) -> (u64, mpsc::UnboundedReceiver<BrokerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.next_id += 1;
        self.connections.push(Connection {
            id: self.next_id,
            client,
            filters,
            tx,
        });
        (self.next_id, rx)
    }

    fn deliver(&mut self, message: BrokerMessage) {
        self.connections.retain(|conn| {
            if !conn.filters.iter().any(|f| topic_matches(f, &message.topic)) {
                return !conn.tx.is_closed();
            }
            conn.tx.send(message.clone()).is_ok()
        });
        self.published.push(message);
    }

    fn is_open(&self, id: u64) -> bool {
        self.connections.iter().any(|conn| conn.id == id)
    }
}

/// Shared in-memory broker.
#[derive(Clone)]
pub struct MemoryBroker {
    hub: Arc<Mutex<Hub>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                next_id: 0,
                online: true,
                connects: 0,
                connections: Vec::new(),
                published: Vec::new(),
            })),
        }
    }

    /// A fresh client transport. Not connected until `connect` is called.
    #[must_use]
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(&self.hub),
            connection: None,
        }
    }

    /// Publish as an outside party.
    pub fn publish(&self, message: BrokerMessage) {
        self.hub.lock().deliver(message);
    }

    /// Listen as an outside party. Survives the broker going offline.
    #[must_use]
    pub fn subscribe(&self, filter: impl Into<String>) -> mpsc::UnboundedReceiver<BrokerMessage> {
        self.hub.lock().open(false, vec![filter.into()]).1
    }

    /// Take the broker down (dropping client connections) or bring it back.
    pub fn set_online(&self, online: bool) {
        let mut hub = self.hub.lock();
        hub.online = online;
        if !online {
            hub.connections.retain(|conn| !conn.client);
        }
    }

    /// Successful client connects so far.
    #[must_use]
    pub fn connect_count(&self) -> u32 {
        self.hub.lock().connects
    }

    /// Every message that went through the broker, in order.
    #[must_use]
    pub fn published(&self) -> Vec<BrokerMessage> {
        self.hub.lock().published.clone()
    }

    /// Published messages whose topic matches `filter`.
    #[must_use]
    pub fn published_on(&self, filter: &str) -> Vec<BrokerMessage> {
        self.hub
            .lock()
            .published
            .iter()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MemoryTransport
// ---------------------------------------------------------------------------

pub struct MemoryTransport {
    hub: Arc<Mutex<Hub>>,
    connection: Option<(u64, mpsc::UnboundedReceiver<BrokerMessage>)>,
}

impl MemoryTransport {
    fn live_id(&self) -> Result<u64, Error> {
        let hub = self.hub.lock();
        match &self.connection {
            Some((id, _)) if hub.online && hub.is_open(*id) => Ok(*id),
            _ => Err(Error::Connection("not connected".into())),
        }
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn connect(&mut self) -> Result<(), Error> {
        let mut hub = self.hub.lock();
        if !hub.online {
            return Err(Error::Connection("broker offline".into()));
        }
        if let Some((old, _)) = self.connection.take() {
            hub.connections.retain(|conn| conn.id != old);
        }
        hub.connects += 1;
        self.connection = Some(hub.open(true, Vec::new()));
        Ok(())
    }

    async fn subscribe(&mut self, filters: &[String]) -> Result<(), Error> {
        let id = self.live_id()?;
        let mut hub = self.hub.lock();
        if let Some(conn) = hub.connections.iter_mut().find(|conn| conn.id == id) {
            for filter in filters {
                if !conn.filters.contains(filter) {
                    conn.filters.push(filter.clone());
                }
            }
        }
        Ok(())
    }

    async fn publish(&mut self, message: BrokerMessage) -> Result<(), Error> {
        self.live_id()?;
        self.hub.lock().deliver(message);
        Ok(())
    }

    async fn next_message(&mut self) -> Option<BrokerMessage> {
        match &mut self.connection {
            Some((_, rx)) => rx.recv().await,
            None => None,
        }
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// SimulatedBot
// ---------------------------------------------------------------------------

/// How a simulated bot answers a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Acknowledge with the command's correlation id.
    Ack(ReportedState),
    /// Publish an uncorrelated status instead of an acknowledgement.
    Heartbeat(ReportedState),
    /// Say nothing.
    Silent,
}

struct Script {
    start: Reply,
    stop: Reply,
    commands: Vec<CommandEnvelope>,
    unsupported: Vec<String>,
}

/// A bot living on the [`MemoryBroker`].
pub struct SimulatedBot {
    broker: MemoryBroker,
    status_topic: String,
    log_topic: String,
    script: Arc<Mutex<Script>>,
    task: JoinHandle<()>,
}

impl SimulatedBot {
    /// Start listening on `name`'s command topic. Starts and stops are
    /// acknowledged successfully until scripted otherwise.
    #[must_use]
    pub fn spawn(broker: &MemoryBroker, topics: &Topics, name: &BotName) -> Self {
        let script = Arc::new(Mutex::new(Script {
            start: Reply::Ack(ReportedState::Running),
            stop: Reply::Ack(ReportedState::Stopped),
            commands: Vec::new(),
            unsupported: Vec::new(),
        }));
        let status_topic = topics.status(name);
        let mut rx = broker.subscribe(topics.command(name));

        let task = {
            let broker = broker.clone();
            let script = Arc::clone(&script);
            let status_topic = status_topic.clone();
            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    let status = match CommandEnvelope::decode(&message.payload) {
                        Ok(command) => {
                            let mut script = script.lock();
                            let reply = match command.action {
                                CommandAction::Start => script.start,
                                CommandAction::Stop => script.stop,
                            };
                            let id = command.correlation_id.clone();
                            script.commands.push(command);
                            match reply {
                                Reply::Ack(state) => Some(StatusEnvelope::ack(state, id)),
                                Reply::Heartbeat(state) => Some(StatusEnvelope::heartbeat(state)),
                                Reply::Silent => None,
                            }
                        }
                        Err(EnvelopeError::UnsupportedAction {
                            action,
                            correlation_id,
                        }) => {
                            script.lock().unsupported.push(action.clone());
                            Some(StatusEnvelope::unsupported_action(&action, correlation_id))
                        }
                        Err(EnvelopeError::Malformed(_)) => None,
                    };
                    if let Some(status) = status {
                        if let Ok(reply) = BrokerMessage::json(status_topic.clone(), &status) {
                            broker.publish(reply);
                        }
                    }
                }
            })
        };

        Self {
            broker: broker.clone(),
            status_topic,
            log_topic: topics.log(name),
            script,
            task,
        }
    }

    pub fn on_start(&self, reply: Reply) {
        self.script.lock().start = reply;
    }

    pub fn on_stop(&self, reply: Reply) {
        self.script.lock().stop = reply;
    }

    /// Commands received so far.
    #[must_use]
    pub fn commands(&self) -> Vec<CommandEnvelope> {
        self.script.lock().commands.clone()
    }

    /// Actions that were rejected as unsupported.
    #[must_use]
    pub fn unsupported(&self) -> Vec<String> {
        self.script.lock().unsupported.clone()
    }

    /// Publish an uncorrelated status report.
    pub fn report(&self, status: &StatusEnvelope) {
        if let Ok(message) = BrokerMessage::json(self.status_topic.clone(), status) {
            self.broker.publish(message);
        }
    }

    pub fn heartbeat(&self, state: ReportedState) {
        self.report(&StatusEnvelope::heartbeat(state));
    }

    pub fn log(&self, level: &str, message: &str) {
        let body = serde_json::json!({ "level": level, "message": message });
        self.broker
            .publish(BrokerMessage::new(self.log_topic.clone(), body.to_string()));
    }
}

impl Drop for SimulatedBot {
    fn drop(&mut self) {
        self.task.abort();
    }
}
