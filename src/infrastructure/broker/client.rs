//! Connection task and the handle used to talk to it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::backoff::ReconnectPolicy;
use super::pending::PendingTable;
use super::routing::RouteTable;
use crate::domain::{BrokerMessage, CommandEnvelope, CorrelationId};
use crate::error::ControlError;
use crate::infrastructure::config::broker::BrokerConfig;
use crate::port::BrokerTransport;

#[derive(Debug)]
enum Outbound {
    Publish(BrokerMessage),
    Subscribe(String),
    Shutdown,
}

/// Cloneable access to the broker connection.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Outbound>,
    pending: Arc<PendingTable>,
    routes: Arc<Mutex<RouteTable>>,
    connected: Arc<AtomicBool>,
    route_capacity: usize,
}

impl BrokerHandle {
    /// Queue a message for publishing without waiting for the transport.
    ///
    /// # Errors
    ///
    /// [`ControlError::UpstreamUnavailable`] when the outbound queue is full
    /// or the connection task has stopped.
    pub fn publish(&self, message: BrokerMessage) -> Result<(), ControlError> {
        self.tx
            .try_send(Outbound::Publish(message))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    ControlError::UpstreamUnavailable("broker outbound queue is full".into())
                }
                TrySendError::Closed(_) => {
                    ControlError::UpstreamUnavailable("broker client has stopped".into())
                }
            })
    }

    /// Publish `command` on `topic` and wait for the reply carrying its
    /// correlation id.
    ///
    /// The pending entry is removed when this future completes or is dropped,
    /// so a late reply is discarded by the connection task.
    ///
    /// # Errors
    ///
    /// [`ControlError::Timeout`] if no reply arrives within `timeout`,
    /// [`ControlError::UpstreamUnavailable`] if the message cannot be queued.
    pub async fn request(
        &self,
        topic: impl Into<String>,
        command: &CommandEnvelope,
        timeout: Duration,
    ) -> Result<BrokerMessage, ControlError> {
        self.request_json(topic, &command.correlation_id, command, timeout)
            .await
            .map_err(|e| match e {
                ControlError::Timeout(_) => ControlError::Timeout(format!(
                    "{} reply to {}",
                    command.action, command.correlation_id
                )),
                other => other,
            })
    }

    /// Publish any JSON `body` and wait for the reply carrying `correlation_id`.
    ///
    /// # Errors
    ///
    /// As [`BrokerHandle::request`].
    pub async fn request_json<T: Serialize>(
        &self,
        topic: impl Into<String>,
        correlation_id: &CorrelationId,
        body: &T,
        timeout: Duration,
    ) -> Result<BrokerMessage, ControlError> {
        let mut reply = self.pending.register(correlation_id.clone())?;
        let message =
            BrokerMessage::json(topic, body).map_err(|e| ControlError::InvalidRequest(e.to_string()))?;
        self.publish(message)?;

        match tokio::time::timeout(timeout, reply.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ControlError::UpstreamUnavailable(
                "broker client has stopped".into(),
            )),
            Err(_) => Err(ControlError::Timeout(format!("reply to {correlation_id}"))),
        }
    }

    /// Receive every uncorrelated message whose topic matches `filter`.
    ///
    /// The subscription is replayed after every reconnect for as long as the
    /// receiver lives.
    #[must_use]
    pub fn route(&self, filter: impl Into<String>) -> mpsc::Receiver<BrokerMessage> {
        let filter = filter.into();
        let (tx, rx) = mpsc::channel(self.route_capacity);
        self.routes.lock().add(filter.clone(), tx);
        if self.tx.try_send(Outbound::Subscribe(filter.clone())).is_err() {
            // Replayed from the route table on the next connect.
            debug!(filter = %filter, "Deferring broker subscription");
        }
        rx
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of requests awaiting a reply.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Ask the connection task to exit.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Outbound::Shutdown).await;
    }
}

/// Owns the transport and runs the connection loop.
pub struct BrokerClient<T: BrokerTransport> {
    transport: T,
    rx: mpsc::Receiver<Outbound>,
    pending: Arc<PendingTable>,
    routes: Arc<Mutex<RouteTable>>,
    connected: Arc<AtomicBool>,
    policy: ReconnectPolicy,
    backlog: VecDeque<BrokerMessage>,
    backlog_capacity: usize,
}

impl<T: BrokerTransport + 'static> BrokerClient<T> {
    /// Start the connection task.
    pub fn spawn(transport: T, config: &BrokerConfig) -> (BrokerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.outbound_capacity);
        let pending = PendingTable::new();
        let routes = Arc::new(Mutex::new(RouteTable::new()));
        let connected = Arc::new(AtomicBool::new(false));

        let handle = BrokerHandle {
            tx,
            pending: Arc::clone(&pending),
            routes: Arc::clone(&routes),
            connected: Arc::clone(&connected),
            route_capacity: config.route_capacity,
        };

        let client = Self {
            transport,
            rx,
            pending,
            routes,
            connected,
            policy: ReconnectPolicy::new(config.reconnection.clone()),
            backlog: VecDeque::new(),
            backlog_capacity: config.outbound_capacity,
        };
        let span = info_span!("broker", client_id = %config.client_id);
        let task = tokio::spawn(client.run().instrument(span));
        (handle, task)
    }

    async fn run(mut self) {
        let mut first_attempt = true;
        loop {
            if !self.connected.load(Ordering::Acquire) {
                if !self.establish(first_attempt).await {
                    break;
                }
                first_attempt = false;
            }

            tokio::select! {
                outbound = self.rx.recv() => match outbound {
                    Some(Outbound::Publish(message)) => self.send(message).await,
                    Some(Outbound::Subscribe(filter)) => {
                        if let Err(e) = self.transport.subscribe(std::slice::from_ref(&filter)).await {
                            warn!(filter = %filter, error = %e, "Broker subscribe failed");
                            self.mark_disconnected();
                        }
                    }
                    Some(Outbound::Shutdown) | None => break,
                },
                inbound = self.transport.next_message() => match inbound {
                    Some(message) => self.dispatch(message),
                    None => {
                        warn!(transport = self.transport.name(), "Broker connection lost");
                        self.mark_disconnected();
                    }
                },
            }
        }
        self.connected.store(false, Ordering::Release);
        info!("Broker client stopped");
    }

    /// Connect and resubscribe, backing off between failures. Returns `false`
    /// if shutdown was requested meanwhile.
    async fn establish(&mut self, first_attempt: bool) -> bool {
        let mut wait = !first_attempt;
        loop {
            if wait {
                let delay = self.policy.next_wait();
                info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.policy.consecutive_failures() + 1,
                    "Reconnecting to broker after delay"
                );
                if !self.idle(delay).await {
                    return false;
                }
            }
            wait = true;

            if let Err(e) = self.transport.connect().await {
                warn!(error = %e, "Broker connection failed");
                self.policy.record_failure();
                continue;
            }

            let filters = self.routes.lock().filters();
            if !filters.is_empty() {
                debug!(filters = filters.len(), "Resubscribing broker routes");
                if let Err(e) = self.transport.subscribe(&filters).await {
                    warn!(error = %e, "Broker resubscription failed");
                    self.policy.record_failure();
                    continue;
                }
            }

            self.policy.reset();
            self.connected.store(true, Ordering::Release);
            info!(transport = self.transport.name(), "Broker connected");
            self.flush_backlog().await;
            return true;
        }
    }

    /// Sleep for `delay` while parking outbound traffic.
    async fn idle(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                outbound = self.rx.recv() => match outbound {
                    Some(Outbound::Publish(message)) => self.park(message),
                    // Route table already holds the filter.
                    Some(Outbound::Subscribe(_)) => {}
                    Some(Outbound::Shutdown) | None => return false,
                },
            }
        }
    }

    fn park(&mut self, message: BrokerMessage) {
        if self.backlog.len() >= self.backlog_capacity {
            if let Some(dropped) = self.backlog.pop_front() {
                warn!(topic = %dropped.topic, "Broker backlog full, dropping oldest message");
            }
        }
        self.backlog.push_back(message);
    }

    async fn flush_backlog(&mut self) {
        while let Some(message) = self.backlog.pop_front() {
            if let Err(e) = self.transport.publish(message.clone()).await {
                warn!(error = %e, "Broker publish failed while flushing backlog");
                self.backlog.push_front(message);
                self.mark_disconnected();
                return;
            }
        }
    }

    async fn send(&mut self, message: BrokerMessage) {
        let topic = message.topic.clone();
        if let Err(e) = self.transport.publish(message.clone()).await {
            warn!(topic = %topic, error = %e, "Broker publish failed");
            self.park(message);
            self.mark_disconnected();
        }
    }

    fn mark_disconnected(&mut self) {
        self.connected.store(false, Ordering::Release);
    }

    fn dispatch(&mut self, message: BrokerMessage) {
        if let Some(id) = message.correlation_id() {
            if let Err(message) = self.pending.resolve(&id, message) {
                warn!(
                    correlation_id = %id,
                    topic = %message.topic,
                    "Dropping reply for unknown or expired request"
                );
            }
            return;
        }

        let delivered = self.routes.lock().dispatch(&message);
        if delivered == 0 {
            debug!(topic = %message.topic, "No route for broker message");
        }
    }
}
