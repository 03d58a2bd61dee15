//! Handlers for the operator commands: `stop`, `archive`, `remove`, `retry`.
//!
//! These connect to the broker named in the config, send one command to the
//! running control plane and print its answer.

use std::time::Duration;

use serde_json::json;

use crate::adapter::inbound::cli::command::BotTarget;
use crate::adapter::inbound::cli::output;
use crate::adapter::outbound::websocket_broker::WebSocketBroker;
use crate::application::control::{self, ControlOp, ControlRequest, ControlResponse};
use crate::domain::Topics;
use crate::error::{ControlError, Result};
use crate::infrastructure::broker::BrokerClient;
use crate::infrastructure::config::Config;

/// Send `op` for `target` and print the outcome.
///
/// `configure` fills in the op-specific fields of the request.
///
/// # Errors
///
/// Config and connection errors, a timeout, or the control plane rejecting
/// the command.
pub async fn execute(target: &BotTarget, op: ControlOp, configure: impl FnOnce(&mut ControlRequest)) -> Result<()> {
    let config = Config::load(&target.config)?;
    let mut broker_config = config.broker.clone();
    let mut request = ControlRequest::new(op, target.name.clone());
    configure(&mut request);
    // Never reuse the control plane's own client id.
    broker_config.client_id = format!("{}-{}", broker_config.client_id, request.client);

    let topics = Topics::new(broker_config.namespace.clone());
    let (handle, task) = BrokerClient::spawn(WebSocketBroker::new(&broker_config)?, &broker_config);
    let timeout = Duration::from_secs(target.timeout_secs);
    let outcome = control::send(&handle, &topics, &request, timeout).await;
    handle.shutdown().await;
    let _ = task.await;

    report(op, &request, outcome?)
}

fn verb(op: ControlOp) -> &'static str {
    match op {
        ControlOp::Stop => "Stopped",
        ControlOp::Archive => "Archived",
        ControlOp::Remove => "Removed",
        ControlOp::Retry => "Redeploying",
    }
}

fn report(op: ControlOp, request: &ControlRequest, response: ControlResponse) -> Result<()> {
    if output::is_json() {
        output::json_output(json!({
            "op": op,
            "bot": request.bot,
            "ok": response.ok,
            "snapshot": response.snapshot,
            "error": response.error,
        }));
    }
    if !response.ok {
        let reason = response.error.unwrap_or_else(|| "no reason given".into());
        return Err(ControlError::InvalidRequest(format!("{} {}: {reason}", request.bot, op_name(op))).into());
    }
    if output::is_json() {
        return Ok(());
    }
    output::success(&format!("{} {}", verb(op), request.bot));
    if let Some(snapshot) = &response.snapshot {
        output::field("State", snapshot.state.as_str());
        if let Some(error) = &snapshot.error {
            output::field("Error", error);
        }
    }
    Ok(())
}

fn op_name(op: ControlOp) -> &'static str {
    match op {
        ControlOp::Stop => "stop",
        ControlOp::Archive => "archive",
        ControlOp::Remove => "remove",
        ControlOp::Retry => "retry",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BotName, CorrelationId};

    fn request(op: ControlOp) -> ControlRequest {
        ControlRequest::new(op, BotName::new("bot1").unwrap())
    }

    #[test]
    fn rejected_command_becomes_an_error() {
        let request = request(ControlOp::Remove);
        let response = ControlResponse {
            correlation_id: CorrelationId::generate(),
            ok: false,
            snapshot: None,
            error: Some("invalid state for bot1: running".into()),
        };
        let err = report(ControlOp::Remove, &request, response).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bot1 remove"), "{message}");
        assert!(message.contains("running"), "{message}");
    }

    #[test]
    fn accepted_command_without_snapshot_is_ok() {
        let request = request(ControlOp::Remove);
        let response = ControlResponse {
            correlation_id: request.request_id.clone(),
            ok: true,
            snapshot: None,
            error: None,
        };
        assert!(report(ControlOp::Remove, &request, response).is_ok());
    }
}
