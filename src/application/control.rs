//! Operator commands for a running control plane, carried over the broker.
//!
//! `botfleet stop|archive|remove|retry` publish a [`ControlRequest`] on
//! `{namespace}/control/request`; the answer comes back on
//! `{namespace}/control/response/{client}` with the request id echoed as
//! `correlation_id`, so the sender's broker client resolves it as a reply.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use super::orchestrator::{Orchestrator, StopOptions};
use crate::domain::{BotName, BotSnapshot, BrokerMessage, CorrelationId, Topics};
use crate::error::ControlError;
use crate::infrastructure::broker::BrokerHandle;
use crate::port::ArchiveDestination;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlOp {
    Stop,
    Archive,
    Remove,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlRequest {
    pub op: ControlOp,
    pub bot: BotName,
    /// Echoed back as the reply's `correlation_id`.
    pub request_id: CorrelationId,
    /// Topic level the reply is published under.
    pub client: String,
    #[serde(default)]
    pub skip_archive: bool,
    /// Archive to this remote bucket instead of the local archive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

impl ControlRequest {
    #[must_use]
    pub fn new(op: ControlOp, bot: BotName) -> Self {
        let request_id = CorrelationId::generate();
        Self {
            op,
            bot,
            client: format!("cli-{request_id}"),
            request_id,
            skip_archive: false,
            bucket: None,
        }
    }

    fn destination(&self) -> ArchiveDestination {
        match &self.bucket {
            Some(bucket) => ArchiveDestination::Remote {
                bucket: bucket.clone(),
            },
            None => ArchiveDestination::Local,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    pub correlation_id: CorrelationId,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<BotSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A client id must stay a single topic level.
fn valid_client(client: &str) -> bool {
    !client.is_empty() && !client.contains(['/', '+', '#'])
}

/// Run one operator command against the orchestrator.
///
/// # Errors
///
/// Whatever the orchestrator reports for the operation.
pub async fn execute(orchestrator: &Orchestrator, request: &ControlRequest) -> Result<Option<BotSnapshot>, ControlError> {
    let bot = &request.bot;
    match request.op {
        ControlOp::Stop => {
            let options = if request.skip_archive {
                StopOptions::skip_archive()
            } else {
                StopOptions::archive_to(request.destination())
            };
            orchestrator.stop(bot, options).await.map(Some)
        }
        ControlOp::Archive => orchestrator.archive(bot, request.destination()).await.map(Some),
        ControlOp::Retry => orchestrator.retry(bot).await.map(Some),
        ControlOp::Remove => orchestrator.remove(bot).await.map(|()| None),
    }
}

async fn answer(orchestrator: &Orchestrator, broker: &BrokerHandle, topics: &Topics, request: ControlRequest) {
    info!(op = ?request.op, bot = %request.bot, client = %request.client, "Operator command");
    let response = match execute(orchestrator, &request).await {
        Ok(snapshot) => ControlResponse {
            correlation_id: request.request_id,
            ok: true,
            snapshot,
            error: None,
        },
        Err(e) => {
            warn!(op = ?request.op, bot = %request.bot, error = %e, "Operator command rejected");
            ControlResponse {
                correlation_id: request.request_id,
                ok: false,
                snapshot: None,
                error: Some(e.to_string()),
            }
        }
    };
    match BrokerMessage::json(topics.control_response(&request.client), &response) {
        Ok(reply) => {
            if let Err(e) = broker.publish(reply) {
                warn!(error = %e, "Failed to publish control response");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode control response"),
    }
}

/// Send `request` to a running control plane and wait for its answer.
///
/// # Errors
///
/// [`ControlError::Timeout`] if the control plane does not answer within
/// `timeout`, [`ControlError::InvalidRequest`] for an undecodable answer.
pub async fn send(
    broker: &BrokerHandle,
    topics: &Topics,
    request: &ControlRequest,
    timeout: Duration,
) -> Result<ControlResponse, ControlError> {
    // Keeps the reply topic subscribed until the answer is in.
    let _replies = broker.route(topics.control_response(&request.client));
    let reply = broker
        .request_json(topics.control_requests(), &request.request_id, request, timeout)
        .await?;
    serde_json::from_str(&reply.payload).map_err(|e| ControlError::InvalidRequest(format!("bad control response: {e}")))
}

/// Serve operator commands from the broker.
///
/// Every command runs on its own task; the orchestrator serializes them per
/// bot.
#[must_use]
pub fn spawn_control_bridge(orchestrator: Orchestrator, broker: BrokerHandle, topics: Topics) -> JoinHandle<()> {
    let mut requests = broker.route(topics.control_requests());
    tokio::spawn(
        async move {
            while let Some(message) = requests.recv().await {
                let request: ControlRequest = match serde_json::from_str(&message.payload) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(error = %e, "Discarding malformed control request");
                        continue;
                    }
                };
                if !valid_client(&request.client) {
                    warn!(client = %request.client, "Discarding control request with unusable client id");
                    continue;
                }
                let (orchestrator, broker, topics) = (orchestrator.clone(), broker.clone(), topics.clone());
                tokio::spawn(async move { answer(&orchestrator, &broker, &topics, request).await }.in_current_span());
            }
        }
        .instrument(info_span!("control_bridge")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_single_topic_levels() {
        assert!(valid_client("cli-1234"));
        assert!(!valid_client(""));
        assert!(!valid_client("a/b"));
        assert!(!valid_client("+"));
        assert!(!valid_client("x#"));
    }

    #[test]
    fn bucket_selects_remote_destination() {
        let mut request = ControlRequest::new(ControlOp::Archive, BotName::new("bot1").unwrap());
        assert_eq!(request.destination(), ArchiveDestination::Local);
        request.bucket = Some("cold".into());
        assert_eq!(
            request.destination(),
            ArchiveDestination::Remote {
                bucket: "cold".into()
            }
        );
    }

    #[test]
    fn request_carries_no_correlation_id_field() {
        let request = ControlRequest::new(ControlOp::Stop, BotName::new("bot1").unwrap());
        let message = BrokerMessage::json("fleet/control/request", &request).unwrap();
        assert!(message.correlation_id().is_none());
    }
}
