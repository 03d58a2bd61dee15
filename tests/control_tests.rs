//! Operator commands sent over the broker to a running fleet.

use std::time::Duration;

use botfleet::application::control::{self, ControlOp, ControlRequest};
use botfleet::application::spawn_control_bridge;
use botfleet::domain::{BotName, BotState, BrokerMessage};
use botfleet::infrastructure::broker::{BrokerClient, BrokerHandle};
use botfleet::testkit::config;
use botfleet::testkit::fleet::{wait_for_removal, Fleet};

const ANSWER_TIMEOUT: Duration = Duration::from_secs(30);

fn name(raw: &str) -> BotName {
    BotName::new(raw).unwrap()
}

/// A fleet serving operator commands, plus a separate operator connection.
fn serving() -> (Fleet, BrokerHandle) {
    let fleet = Fleet::start();
    let _bridge = spawn_control_bridge(fleet.orchestrator.clone(), fleet.handle.clone(), fleet.topics.clone());
    let mut operator_config = config::broker();
    operator_config.client_id = "operator".into();
    let (operator, _task) = BrokerClient::spawn(fleet.broker.transport(), &operator_config);
    (fleet, operator)
}

#[tokio::test(start_paused = true)]
async fn stop_over_the_broker_archives_the_bot() {
    let (fleet, operator) = serving();
    let bot1 = name("bot1");
    let _bot = fleet.bot(&bot1);
    fleet.deploy_running(&bot1).await;
    let mut events = fleet.orchestrator.subscribe();

    let request = ControlRequest::new(ControlOp::Stop, bot1.clone());
    let response = control::send(&operator, &fleet.topics, &request, ANSWER_TIMEOUT)
        .await
        .unwrap();
    assert!(response.ok, "{:?}", response.error);
    assert_eq!(response.correlation_id, request.request_id);
    assert_eq!(response.snapshot.unwrap().state, BotState::Stopping);

    fleet.wait_for(&mut events, &bot1, BotState::Archived).await;
    assert_eq!(fleet.archive.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_without_archive_then_remove() {
    let (fleet, operator) = serving();
    let bot1 = name("bot1");
    let _bot = fleet.bot(&bot1);
    fleet.deploy_running(&bot1).await;
    let mut events = fleet.orchestrator.subscribe();

    let mut stop = ControlRequest::new(ControlOp::Stop, bot1.clone());
    stop.skip_archive = true;
    let response = control::send(&operator, &fleet.topics, &stop, ANSWER_TIMEOUT).await.unwrap();
    assert!(response.ok);
    fleet.wait_for(&mut events, &bot1, BotState::Stopped).await;
    assert_eq!(fleet.archive.calls(), 0);

    let mut events = fleet.orchestrator.subscribe();
    let remove = ControlRequest::new(ControlOp::Remove, bot1.clone());
    let response = control::send(&operator, &fleet.topics, &remove, ANSWER_TIMEOUT).await.unwrap();
    assert!(response.ok, "{:?}", response.error);
    assert!(response.snapshot.is_none());
    wait_for_removal(&fleet.orchestrator, &mut events, &bot1).await;
}

#[tokio::test(start_paused = true)]
async fn rejection_comes_back_as_an_error_answer() {
    let (fleet, operator) = serving();

    let request = ControlRequest::new(ControlOp::Stop, name("ghost"));
    let response = control::send(&operator, &fleet.topics, &request, ANSWER_TIMEOUT)
        .await
        .unwrap();
    assert!(!response.ok);
    assert!(response.snapshot.is_none());
    assert!(response.error.unwrap().contains("not found"));
}

#[tokio::test(start_paused = true)]
async fn malformed_requests_are_dropped_and_serving_continues() {
    let (fleet, operator) = serving();
    let bot1 = name("bot1");
    let _bot = fleet.bot(&bot1);
    fleet.deploy_running(&bot1).await;

    fleet
        .broker
        .publish(BrokerMessage::new(fleet.topics.control_requests(), "not json"));
    let mut hostile = ControlRequest::new(ControlOp::Stop, bot1.clone());
    hostile.client = "a/b".into();
    fleet
        .broker
        .publish(BrokerMessage::json(fleet.topics.control_requests(), &hostile).unwrap());

    let mut stop = ControlRequest::new(ControlOp::Stop, bot1.clone());
    stop.skip_archive = true;
    let response = control::send(&operator, &fleet.topics, &stop, ANSWER_TIMEOUT).await.unwrap();
    assert!(response.ok);

    let answers = fleet
        .broker
        .published_on(&format!("{}/control/response/#", fleet.topics.namespace()));
    assert_eq!(answers.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_command_times_out() {
    let fleet = Fleet::start();
    let (operator, _task) = BrokerClient::spawn(fleet.broker.transport(), &config::broker());

    let request = ControlRequest::new(ControlOp::Retry, name("bot1"));
    let err = control::send(&operator, &fleet.topics, &request, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("timed out"), "{err}");
}
