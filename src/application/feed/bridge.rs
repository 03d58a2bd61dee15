//! Serves feed requests from bot processes over the broker.
//!
//! Bots publish `{op, key, caller, request_id}` on `{namespace}/feeds/request`
//! and receive the answer on `{namespace}/feeds/response/{caller}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info_span, warn, Instrument};

use super::manager::FeedManager;
use crate::domain::{BrokerMessage, CallerHandle, FeedKey, FeedSnapshot, Topics};
use crate::error::ControlError;
use crate::infrastructure::broker::BrokerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedOp {
    Acquire,
    Release,
    Read,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRequest {
    pub op: FeedOp,
    pub key: FeedKey,
    pub caller: CallerHandle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<FeedSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FeedResponse {
    fn from_result(request_id: Option<String>, result: Result<Option<FeedSnapshot>, ControlError>) -> Self {
        match result {
            Ok(snapshot) => Self {
                request_id,
                ok: true,
                snapshot,
                error: None,
            },
            Err(e) => Self {
                request_id,
                ok: false,
                snapshot: None,
                error: Some(e.to_string()),
            },
        }
    }
}

async fn serve(manager: &FeedManager, request: &FeedRequest) -> Result<Option<FeedSnapshot>, ControlError> {
    match request.op {
        FeedOp::Acquire => manager.acquire(&request.key, &request.caller).await.map(Some),
        FeedOp::Release => manager.release(&request.key, &request.caller).map(|()| None),
        FeedOp::Read => manager.read(&request.key).map(Some),
    }
}

async fn answer(manager: &FeedManager, broker: &BrokerHandle, topics: &Topics, request: FeedRequest) {
    debug!(op = ?request.op, key = %request.key, caller = %request.caller, "Serving feed request");
    let result = serve(manager, &request).await;
    let response = FeedResponse::from_result(request.request_id, result);
    match BrokerMessage::json(topics.feed_response(&request.caller), &response) {
        Ok(reply) => {
            if let Err(e) = broker.publish(reply) {
                warn!(error = %e, "Failed to publish feed response");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode feed response"),
    }
}

/// Requests of one caller, served strictly in arrival order.
struct CallerQueue {
    tx: mpsc::UnboundedSender<FeedRequest>,
    /// Queued plus in service. Zero means the worker is parked on `recv`.
    pending: Arc<AtomicUsize>,
}

impl CallerQueue {
    fn spawn(manager: &FeedManager, broker: &BrokerHandle, topics: &Topics) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<FeedRequest>();
        let pending = Arc::new(AtomicUsize::new(0));
        let (manager, broker, topics) = (manager.clone(), broker.clone(), topics.clone());
        let in_flight = Arc::clone(&pending);
        tokio::spawn(
            async move {
                while let Some(request) = rx.recv().await {
                    answer(&manager, &broker, &topics, request).await;
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                }
            }
            .in_current_span(),
        );
        Self { tx, pending }
    }

    fn idle(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0
    }
}

/// Route feed requests from the broker into `manager`.
///
/// Each caller gets its own worker, so a slow upstream open for one bot never
/// delays another, while one bot's `acquire` always completes before its
/// following `release`. Idle workers are dropped and respawned on demand.
#[must_use]
pub fn spawn_feed_bridge(manager: FeedManager, broker: BrokerHandle, topics: Topics) -> JoinHandle<()> {
    let mut requests = broker.route(topics.feed_requests());
    tokio::spawn(
        async move {
            let mut queues: HashMap<CallerHandle, CallerQueue> = HashMap::new();
            while let Some(message) = requests.recv().await {
                let request: FeedRequest = match serde_json::from_str(&message.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Discarding malformed feed request");
                        continue;
                    }
                };
                queues.retain(|caller, queue| *caller == request.caller || !queue.idle());
                let queue = queues
                    .entry(request.caller.clone())
                    .or_insert_with(|| CallerQueue::spawn(&manager, &broker, &topics));
                queue.pending.fetch_add(1, Ordering::AcqRel);
                if let Err(mpsc::error::SendError(request)) = queue.tx.send(request) {
                    warn!(caller = %request.caller, "Feed worker gone, dropping request");
                    queues.remove(&request.caller);
                }
            }
        }
        .instrument(info_span!("feed_bridge")),
    )
}
