use std::time::Duration;

use chrono::{TimeDelta, Utc};
use config::shared::ChannelPolicyConfig;
use syncroute::capture::TransactionVisibility;
use syncroute::concurrency::lease::ROUTING_LEASE_NAME;
use syncroute::error::ErrorKind;
use syncroute::failpoints::{
    ROUTING_PASS__AFTER_BATCHES_FINALIZED, ROUTING_PASS__AFTER_EVENT_SCANNED,
    ROUTING_PASS__BEFORE_RANGE_SCAN,
};
use syncroute::routing::PassOutcome;
use syncroute::store::lease::LeaseStore;
use syncroute::test_utils::environment::TestEnvironment;
use syncroute::test_utils::event::insert_event;
use syncroute::test_utils::failpoints::FailpointScenario;
use syncroute::types::{GapStatus, OPEN_END_ID};
use telemetry::init_test_tracing;

fn gap_bounds(env_gaps: Vec<syncroute::types::DataGap>) -> Vec<(i64, i64, GapStatus)> {
    env_gaps
        .into_iter()
        .map(|gap| (gap.start_id, gap.end_id, gap.status))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn crash_after_batches_finalized_is_resumed_without_duplicates() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(
        ROUTING_PASS__AFTER_BATCHES_FINALIZED,
        "1*return(no_retry)",
    )]);

    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1", "store-2"]).await;
    env.capture
        .set_transaction_visibility(TransactionVisibility::NoneOpen)
        .await;

    let mut config = TestEnvironment::routing_config();
    config.gap_liveness_timeout_ms = 1;
    let channels = vec![ChannelPolicyConfig::new("item")];

    for id in 1..=3 {
        env.capture.push(insert_event(id, "item")).await;
    }

    let mut service = env.routing_service(config.clone(), channels.clone());
    let err = service.run_pass().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WithNoRetry);

    // The batches were stored but the claimed gap was never released.
    assert_eq!(env.routed_event_ids("store-1").await, vec![1, 2, 3]);
    assert_eq!(
        gap_bounds(env.store.data_gaps().await),
        vec![(0, OPEN_END_ID, GapStatus::InUse)]
    );

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut service = env.routing_service(config, channels);
    let PassOutcome::Completed(summary) = service.run_pass().await.unwrap() else {
        panic!("routing lease was not available");
    };

    assert_eq!(summary.targets_already_batched, 6);
    assert_eq!(summary.batches_finalized, 0);
    for node_id in ["store-1", "store-2"] {
        assert_eq!(env.batches_of(node_id).await.len(), 1);
        assert_eq!(env.routed_event_ids(node_id).await, vec![1, 2, 3]);
    }
    assert_eq!(
        gap_bounds(env.store.data_gaps().await),
        vec![(0, 3, GapStatus::Ok), (4, OPEN_END_ID, GapStatus::Open)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_range_scan_creates_no_batches() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(
        ROUTING_PASS__BEFORE_RANGE_SCAN,
        "1*return(timed_retry)",
    )]);

    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    env.capture.push(insert_event(1, "item")).await;

    let mut service = env.routing_service(
        TestEnvironment::routing_config(),
        vec![ChannelPolicyConfig::new("item")],
    );
    let err = service.run_pass().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::WithTimedRetry);
    assert!(env.store.outgoing_batches().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn long_scan_keeps_lease_and_claims_alive() {
    init_test_tracing();
    let _scenario = FailpointScenario::setup(&[(ROUTING_PASS__AFTER_EVENT_SCANNED, "sleep(50)")]);

    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    for id in 1..=8 {
        env.capture.push(insert_event(id, "item")).await;
    }

    // Heartbeat every ~66ms while the scan takes ~400ms.
    let mut config = TestEnvironment::routing_config();
    config.lease_ttl_ms = 200;
    config.gap_liveness_timeout_ms = 200;
    let channels = vec![ChannelPolicyConfig::new("item")];

    let started_at = Utc::now();
    let mut slow = env.routing_service(config.clone(), channels.clone());
    let slow_pass = tokio::spawn(async move { slow.run_pass().await });

    tokio::time::sleep(Duration::from_millis(250)).await;

    let mut other = env.routing_service(config, channels);
    assert_eq!(other.run_pass().await.unwrap(), PassOutcome::LeaseUnavailable);

    let gaps = env.store.data_gaps().await;
    assert_eq!(gaps[0].status, GapStatus::InUse);
    assert!(gaps[0].last_updated_at > started_at + TimeDelta::milliseconds(100));

    let PassOutcome::Completed(summary) = slow_pass.await.unwrap().unwrap() else {
        panic!("routing lease was not available");
    };
    assert_eq!(summary.events_routed, 8);
    assert_eq!(env.routed_event_ids("store-1").await, (1..=8).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pass_stops_when_lease_is_taken_over_mid_scan() {
    init_test_tracing();
    let _scenario =
        FailpointScenario::setup(&[(ROUTING_PASS__AFTER_EVENT_SCANNED, "1*sleep(300)")]);

    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    for id in 1..=2 {
        env.capture.push(insert_event(id, "item")).await;
    }

    let mut config = TestEnvironment::routing_config();
    config.lease_ttl_ms = 100;
    let mut stalled = env.routing_service(config, vec![ChannelPolicyConfig::new("item")]);
    let stalled_pass = tokio::spawn(async move { stalled.run_pass().await });

    // The stalled pass lets its lease expire while sleeping after its first event.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        env.store
            .try_acquire_lease(ROUTING_LEASE_NAME, "intruder", Duration::from_secs(60))
            .await
            .unwrap()
    );

    let err = stalled_pass.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LeaseNotHeld);

    assert!(env.store.outgoing_batches().await.is_empty());
    assert_eq!(
        gap_bounds(env.store.data_gaps().await),
        vec![(0, OPEN_END_ID, GapStatus::InUse)]
    );
}
