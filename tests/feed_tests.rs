//! Feed sharing, eviction and the broker-facing request bridge.

use std::sync::Arc;
use std::time::Duration;

use botfleet::application::feed::{FeedOp, FeedRequest, FeedResponse};
use botfleet::application::{spawn_feed_bridge, FeedManager};
use botfleet::domain::{
    BrokerMessage, CallerHandle, DataKind, FeedEvent, FeedKey, FeedPayload, Topics,
};
use botfleet::error::ControlError;
use botfleet::infrastructure::broker::BrokerClient;
use botfleet::infrastructure::config::feeds::FeedConfig;
use botfleet::testkit::broker::MemoryBroker;
use botfleet::testkit::config;
use botfleet::testkit::feed::CountingUpstream;
use futures_util::future::join_all;
use rust_decimal_macros::dec;

fn feed_config() -> FeedConfig {
    FeedConfig {
        sweep_interval_secs: 10,
        idle_timeout_secs: 60,
        unhealthy_timeout_secs: 30,
        ..FeedConfig::default()
    }
}

fn btc_trades() -> FeedKey {
    FeedKey::new("binance", "BTCUSDT", DataKind::Trades, None)
}

fn eth_candles() -> FeedKey {
    FeedKey::new("binance", "ETHUSDT", DataKind::Candles, Some("1m".into()))
}

fn manager() -> (FeedManager, CountingUpstream) {
    let upstream = CountingUpstream::new();
    let manager = FeedManager::new(Arc::new(upstream.clone()), &feed_config());
    (manager, upstream)
}

/// Run every ready task to completion before continuing.
async fn drain() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_share_one_connection() {
    let (manager, upstream) = manager();
    let key = btc_trades();
    let callers: Vec<CallerHandle> = (0..8).map(|_| manager.caller()).collect();

    let results = join_all(callers.iter().map(|c| manager.acquire(&key, c))).await;
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(upstream.open_count(&key), 1);

    let feeds = manager.active_feeds();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].references, 8);
    assert_eq!(feeds[0].expires_in_secs, None);
}

#[tokio::test(start_paused = true)]
async fn failed_open_does_not_poison_waiting_callers() {
    let (manager, upstream) = manager();
    let key = btc_trades();
    upstream.fail_next_opens(1);
    let callers: Vec<CallerHandle> = (0..3).map(|_| manager.caller()).collect();

    let results = join_all(callers.iter().map(|c| manager.acquire(&key, c))).await;
    let failures = results.iter().filter(|r| r.is_err()).count();
    assert_eq!(failures, 1);
    assert!(matches!(
        results.iter().find(|r| r.is_err()),
        Some(Err(ControlError::UpstreamUnavailable(_)))
    ));
    assert_eq!(upstream.open_count(&key), 2);
    assert_eq!(manager.active_feeds()[0].references, 2);
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_open_distinct_connections() {
    let (manager, upstream) = manager();
    let caller = manager.caller();

    manager.acquire(&btc_trades(), &caller).await.unwrap();
    manager.acquire(&eth_candles(), &caller).await.unwrap();

    assert_eq!(upstream.open_count(&btc_trades()), 1);
    assert_eq!(upstream.open_count(&eth_candles()), 1);
    let keys: Vec<FeedKey> = manager.active_feeds().into_iter().map(|f| f.key).collect();
    assert_eq!(keys, vec![btc_trades(), eth_candles()]);
}

#[tokio::test(start_paused = true)]
async fn released_feed_is_reused_within_grace_period() {
    let (manager, upstream) = manager();
    let key = btc_trades();
    let first = manager.caller();
    manager.acquire(&key, &first).await.unwrap();
    manager.release(&key, &first).unwrap();

    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(manager.sweep().await.evicted, 0);

    let second = manager.caller();
    manager.acquire(&key, &second).await.unwrap();
    assert_eq!(upstream.open_count(&key), 1);
    assert_eq!(upstream.close_count(&key), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_feed_is_evicted_at_grace_boundary() {
    let (manager, upstream) = manager();
    let key = btc_trades();
    let caller = manager.caller();
    manager.acquire(&key, &caller).await.unwrap();
    manager.release(&key, &caller).unwrap();

    tokio::time::advance(Duration::from_secs(60)).await;
    let report = manager.sweep().await;
    assert_eq!(report.evicted, 1);
    assert_eq!(upstream.close_count(&key), 1);
    assert!(manager.is_empty());
    assert!(matches!(manager.read(&key), Err(ControlError::NotFound(_))));

    // A later acquire starts from scratch.
    manager.acquire(&key, &caller).await.unwrap();
    assert_eq!(upstream.open_count(&key), 2);
}

#[tokio::test(start_paused = true)]
async fn one_caller_releasing_keeps_feed_for_others() {
    let (manager, upstream) = manager();
    let key = btc_trades();
    let (a, b) = (manager.caller(), manager.caller());
    manager.acquire(&key, &a).await.unwrap();
    manager.acquire(&key, &b).await.unwrap();
    manager.release(&key, &a).unwrap();

    tokio::time::advance(Duration::from_secs(600)).await;
    assert_eq!(manager.sweep().await.evicted, 0);
    assert_eq!(upstream.close_count(&key), 0);
    assert_eq!(manager.active_feeds()[0].references, 1);
}

#[tokio::test(start_paused = true)]
async fn sweeper_task_evicts_on_its_own() {
    let (manager, upstream) = manager();
    let key = btc_trades();
    let sweeper = manager.spawn_sweeper(feed_config().sweep_interval());
    let caller = manager.caller();
    manager.acquire(&key, &caller).await.unwrap();
    manager.release(&key, &caller).unwrap();

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(manager.len(), 1);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(manager.is_empty());
    assert_eq!(upstream.close_count(&key), 1);
    sweeper.abort();
}

#[tokio::test(start_paused = true)]
async fn pushed_data_reaches_every_reader() {
    let (manager, upstream) = manager();
    let key = btc_trades();
    let (a, b) = (manager.caller(), manager.caller());
    manager.acquire(&key, &a).await.unwrap();

    assert!(upstream.push(
        &key,
        FeedEvent::Data(FeedPayload::Trade {
            price: dec!(64000),
            quantity: dec!(0.5),
            buyer_is_maker: true,
            timestamp: chrono::Utc::now(),
        }),
    ));
    drain().await;

    let snapshot = manager.acquire(&key, &b).await.unwrap();
    assert!(matches!(
        snapshot.payload,
        Some(FeedPayload::Trade { price, .. }) if price == dec!(64000)
    ));
    assert!(snapshot.received_at.is_some());
    assert!(manager.active_feeds()[0].has_data);
}

#[tokio::test(start_paused = true)]
async fn ended_stream_is_reopened_after_unhealthy_timeout() {
    let (manager, upstream) = manager();
    let key = btc_trades();
    let caller = manager.caller();
    manager.acquire(&key, &caller).await.unwrap();

    upstream.end_stream(&key);
    drain().await;
    assert!(!manager.read(&key).unwrap().healthy);

    tokio::time::advance(Duration::from_secs(30)).await;
    let report = manager.sweep().await;
    assert_eq!(report.reopened, 1);
    assert_eq!(upstream.open_count(&key), 2);
    assert!(manager.read(&key).unwrap().healthy);
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_every_feed() {
    let (manager, upstream) = manager();
    let caller = manager.caller();
    manager.acquire(&btc_trades(), &caller).await.unwrap();
    manager.acquire(&eth_candles(), &caller).await.unwrap();

    manager.shutdown().await;
    assert!(manager.is_empty());
    assert_eq!(upstream.close_count(&btc_trades()), 1);
    assert_eq!(upstream.close_count(&eth_candles()), 1);
}

// ---------------------------------------------------------------------------
// Broker bridge
// ---------------------------------------------------------------------------

struct Bridge {
    broker: MemoryBroker,
    topics: Topics,
    manager: FeedManager,
    upstream: CountingUpstream,
}

async fn bridge() -> Bridge {
    let broker = MemoryBroker::new();
    let broker_config = config::broker();
    let topics = Topics::new(broker_config.namespace.clone());
    let (handle, _client) = BrokerClient::spawn(broker.transport(), &broker_config);
    let (manager, upstream) = manager();
    let _bridge = spawn_feed_bridge(manager.clone(), handle, topics.clone());
    drain().await;
    Bridge {
        broker,
        topics,
        manager,
        upstream,
    }
}

impl Bridge {
    async fn call(&self, op: FeedOp, key: FeedKey, caller: &CallerHandle, id: &str) -> FeedResponse {
        let mut replies = self.broker.subscribe(self.topics.feed_response(caller));
        let request = FeedRequest {
            op,
            key,
            caller: caller.clone(),
            request_id: Some(id.to_string()),
        };
        self.broker
            .publish(BrokerMessage::json(self.topics.feed_requests(), &request).unwrap());
        let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .expect("feed response")
            .expect("broker open");
        serde_json::from_str(&reply.payload).unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn bridge_serves_acquire_read_and_release() {
    let bridge = bridge().await;
    let caller = CallerHandle::generate();
    let key = btc_trades();

    let acquired = bridge.call(FeedOp::Acquire, key.clone(), &caller, "r1").await;
    assert!(acquired.ok);
    assert_eq!(acquired.request_id.as_deref(), Some("r1"));
    assert_eq!(acquired.snapshot.unwrap().key, key);
    assert_eq!(bridge.upstream.open_count(&key), 1);

    let read = bridge.call(FeedOp::Read, key.clone(), &caller, "r2").await;
    assert!(read.ok);
    assert_eq!(read.request_id.as_deref(), Some("r2"));

    let released = bridge.call(FeedOp::Release, key.clone(), &caller, "r3").await;
    assert!(released.ok);
    assert!(released.snapshot.is_none());
    assert_eq!(bridge.manager.active_feeds()[0].references, 0);
}

#[tokio::test(start_paused = true)]
async fn bridge_reports_errors_to_the_caller() {
    let bridge = bridge().await;
    let caller = CallerHandle::generate();

    let response = bridge.call(FeedOp::Read, btc_trades(), &caller, "missing").await;
    assert!(!response.ok);
    assert_eq!(response.request_id.as_deref(), Some("missing"));
    assert!(response.error.unwrap().contains("not found"));

    let bad_key = FeedKey::new("binance", "BTCUSDT", DataKind::Candles, None);
    let response = bridge.call(FeedOp::Acquire, bad_key, &caller, "bad").await;
    assert!(!response.ok);
    assert!(response.error.unwrap().contains("resolution"));
}

impl Bridge {
    fn send(&self, op: FeedOp, key: FeedKey, caller: &CallerHandle, id: &str) {
        let request = FeedRequest {
            op,
            key,
            caller: caller.clone(),
            request_id: Some(id.to_string()),
        };
        self.broker
            .publish(BrokerMessage::json(self.topics.feed_requests(), &request).unwrap());
    }
}

#[tokio::test(start_paused = true)]
async fn bridge_serves_one_callers_requests_in_order() {
    let bridge = bridge().await;
    bridge.upstream.set_open_delay(Duration::from_millis(200));
    let caller = CallerHandle::generate();
    let key = btc_trades();
    let mut replies = bridge.broker.subscribe(bridge.topics.feed_response(&caller));

    bridge.send(FeedOp::Acquire, key.clone(), &caller, "a");
    bridge.send(FeedOp::Release, key.clone(), &caller, "r");

    let mut responses = Vec::new();
    for _ in 0..2 {
        let reply = tokio::time::timeout(Duration::from_secs(5), replies.recv())
            .await
            .expect("feed response")
            .expect("broker open");
        responses.push(serde_json::from_str::<FeedResponse>(&reply.payload).unwrap());
    }
    let ids: Vec<_> = responses.iter().map(|r| r.request_id.as_deref()).collect();
    assert_eq!(ids, vec![Some("a"), Some("r")]);
    assert!(responses.iter().all(|r| r.ok));
    assert_eq!(bridge.manager.active_feeds()[0].references, 0);

    tokio::time::advance(Duration::from_secs(60)).await;
    assert_eq!(bridge.manager.sweep().await.evicted, 1);
    assert_eq!(bridge.upstream.close_count(&key), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_open_for_one_caller_does_not_block_another() {
    let bridge = bridge().await;
    let (slow, fast) = (CallerHandle::generate(), CallerHandle::generate());
    bridge.manager.acquire(&eth_candles(), &bridge.manager.caller()).await.unwrap();
    bridge.upstream.set_open_delay(Duration::from_secs(3));

    let mut slow_replies = bridge.broker.subscribe(bridge.topics.feed_response(&slow));
    bridge.send(FeedOp::Acquire, btc_trades(), &slow, "slow");
    let read = bridge.call(FeedOp::Read, eth_candles(), &fast, "fast").await;
    assert!(read.ok);
    assert!(slow_replies.try_recv().is_err());

    tokio::time::sleep(Duration::from_secs(4)).await;
    let reply = slow_replies.try_recv().unwrap();
    let response: FeedResponse = serde_json::from_str(&reply.payload).unwrap();
    assert!(response.ok);
}

#[tokio::test(start_paused = true)]
async fn bridge_ignores_malformed_requests() {
    let bridge = bridge().await;
    bridge
        .broker
        .publish(BrokerMessage::new(bridge.topics.feed_requests(), "{not json"));
    drain().await;

    let caller = CallerHandle::generate();
    let response = bridge.call(FeedOp::Acquire, btc_trades(), &caller, "after").await;
    assert!(response.ok);
}
