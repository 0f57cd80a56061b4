use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use config::Environment;
use config::shared::{ChannelPolicyConfig, EngineConfig, ReservationConfig, StoreConfig};
use syncroute::delivery::PullRequest;
use syncroute::engine::SyncEngine;
use syncroute::error::ErrorKind;
use syncroute::reservation::SyncStatus;
use syncroute::router::PolicyBackends;
use syncroute::test_utils::environment::TestEnvironment;
use syncroute::test_utils::event::insert_event;
use syncroute::types::{BatchStatus, NodeId};
use telemetry::init_test_tracing;

fn engine_config(channels: Vec<ChannelPolicyConfig>) -> EngineConfig {
    EngineConfig {
        routing: TestEnvironment::routing_config(),
        reservation: ReservationConfig::default(),
        channels,
        store: StoreConfig::Memory,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_routes_captured_events_until_shutdown() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    for id in 1..=4 {
        env.capture.push(insert_event(id, "item")).await;
    }

    let engine = SyncEngine::start(
        engine_config(vec![ChannelPolicyConfig::new("item")]),
        env.capture.clone(),
        env.catalog.clone(),
        PolicyBackends::new(),
    )
    .await
    .unwrap();

    let mut batches = Vec::new();
    for _ in 0..100 {
        let pull = engine
            .delivery()
            .pull(PullRequest::new("store-1"))
            .await
            .unwrap();
        assert_eq!(pull.status, SyncStatus::Ok);
        if !pull.batches.is_empty() {
            batches = pull.batches;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].event_count, 4);

    let node_id = NodeId::new("store-1");
    let event_ids = engine
        .delivery()
        .rematerialize(&node_id, batches[0].batch_id)
        .await
        .unwrap();
    assert_eq!(event_ids, vec![1, 2, 3, 4]);
    engine
        .delivery()
        .acknowledge(&node_id, batches[0].batch_id, BatchStatus::Acked)
        .await
        .unwrap();

    engine.shutdown_and_wait().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_rejects_invalid_configuration() {
    init_test_tracing();
    let env = TestEnvironment::new();

    let result = SyncEngine::start(
        engine_config(vec![
            ChannelPolicyConfig::new("item"),
            ChannelPolicyConfig::new("item"),
        ]),
        env.capture.clone(),
        env.catalog.clone(),
        PolicyBackends::new(),
    )
    .await;

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidChannelPolicy);
}

fn configuration_dir(base: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("engine-config-{}", uuid::Uuid::new_v4()));
    let configuration = dir.join("configuration");
    fs::create_dir_all(&configuration).unwrap();
    fs::write(configuration.join("base.yaml"), base).unwrap();
    let environment = Environment::load().unwrap();
    fs::write(
        configuration.join(format!("{}.json", environment.as_str())),
        "{}",
    )
    .unwrap();
    dir
}

#[tokio::test(flavor = "multi_thread")]
async fn engine_starts_from_configuration_files() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    env.capture.push(insert_event(1, "item")).await;

    let dir = configuration_dir(
        "routing:\n  node_id: server\n  interval_ms: 50\nchannels:\n  - channel_id: item\n",
    );
    let engine = SyncEngine::start_from_configuration_in(
        &dir,
        env.capture.clone(),
        env.catalog.clone(),
        PolicyBackends::new(),
    )
    .await
    .unwrap();

    let mut batches = Vec::new();
    for _ in 0..100 {
        let pull = engine
            .delivery()
            .pull(PullRequest::new("store-1"))
            .await
            .unwrap();
        if !pull.batches.is_empty() {
            batches = pull.batches;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(batches.len(), 1);

    engine.shutdown_and_wait().await.unwrap();
    fs::remove_dir_all(dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn unloadable_configuration_is_a_config_error() {
    init_test_tracing();
    let env = TestEnvironment::new();

    // `routing.node_id` is required.
    let dir = configuration_dir("channels: []\n");
    let result = SyncEngine::start_from_configuration_in(
        &dir,
        env.capture.clone(),
        env.catalog.clone(),
        PolicyBackends::new(),
    )
    .await;

    assert_eq!(result.unwrap_err().kind(), ErrorKind::ConfigError);
    fs::remove_dir_all(dir).unwrap();
}
