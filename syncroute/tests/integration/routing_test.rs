use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use config::shared::{BatchAlgorithm, ChannelPolicyConfig, RouterType};
use syncroute::bail;
use syncroute::capture::TransactionVisibility;
use syncroute::error::{ErrorKind, SyncResult};
use syncroute::router::PolicyBackends;
use syncroute::router::expression::{ExpressionBindings, ExpressionEvaluator};
use syncroute::routing::{PassOutcome, PassSummary};
use syncroute::test_utils::environment::{TestEnvironment, TestRoutingService};
use syncroute::test_utils::event::{
    delete_row, from_node, in_transaction, insert_event, insert_row, update_row,
};
use syncroute::types::{ChannelId, GapStatus, Node, NodeId, OPEN_END_ID, RowImage};
use telemetry::init_test_tracing;

async fn run_pass(service: &mut TestRoutingService) -> PassSummary {
    match service.run_pass().await.unwrap() {
        PassOutcome::Completed(summary) => summary,
        PassOutcome::LeaseUnavailable => panic!("routing lease was not available"),
    }
}

fn sizes(batches: &[syncroute::types::OutgoingBatch]) -> Vec<usize> {
    batches.iter().map(|batch| batch.event_count).collect()
}

fn gap_bounds(service: &TestRoutingService) -> Vec<(i64, i64, GapStatus)> {
    service
        .gap_tracker()
        .gaps()
        .map(|gap| (gap.start_id, gap.end_id, gap.status))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn twelve_inserts_are_batched_per_enabled_node() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1", "store-3"]).await;
    env.catalog
        .add_node(Node::new("store-2", "store", "store-2").disabled())
        .await;
    env.capture
        .set_transaction_visibility(TransactionVisibility::NoneOpen)
        .await;

    let mut channel = ChannelPolicyConfig::new("item");
    channel.max_batch_size = 5;
    channel.batch_algorithm = BatchAlgorithm::Nontransactional;
    let mut service = env.routing_service(TestEnvironment::routing_config(), vec![channel]);

    for id in 1..=12 {
        env.capture.push(insert_event(id, "item")).await;
    }

    let summary = run_pass(&mut service).await;

    assert_eq!(summary.events_routed, 12);
    assert_eq!(summary.batches_finalized, 6);
    for node_id in ["store-1", "store-3"] {
        assert_eq!(sizes(&env.batches_of(node_id).await), vec![5, 5, 2]);
        assert_eq!(
            env.routed_event_ids(node_id).await,
            (1..=12).collect::<Vec<_>>()
        );
    }
    assert!(env.batches_of("store-2").await.is_empty());
    assert_eq!(
        gap_bounds(&service),
        vec![(0, 12, GapStatus::Ok), (13, OPEN_END_ID, GapStatus::Open)]
    );

    // Nothing new was captured, so a second pass routes nothing.
    let summary = run_pass(&mut service).await;
    assert_eq!(summary.events_scanned, 0);
    assert_eq!(env.batches_of("store-1").await.len(), 3);
    assert_eq!(
        gap_bounds(&service),
        vec![(0, 12, GapStatus::Ok), (13, OPEN_END_ID, GapStatus::Open)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn column_match_routes_moved_row_to_both_owners() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &[]).await;
    env.catalog.add_node(Node::new("store-1", "store", "1")).await;
    env.catalog.add_node(Node::new("store-2", "store", "2")).await;

    let mut channel = ChannelPolicyConfig::new("item");
    channel.router_type = Some(RouterType::ColumnMatch);
    channel.router_expression = Some("STORE_ID=:EXTERNAL_ID".to_string());
    let mut service = env.routing_service(TestEnvironment::routing_config(), vec![channel]);

    let owned_by_first = RowImage::new().with("store_id", Some("1"));
    let owned_by_second = RowImage::new().with("store_id", Some("2"));
    env.capture
        .push(insert_row(1, "item", owned_by_first.clone()))
        .await;
    env.capture
        .push(update_row(2, "item", owned_by_first, owned_by_second.clone()))
        .await;
    env.capture.push(delete_row(3, "item", owned_by_second)).await;

    run_pass(&mut service).await;

    assert_eq!(env.routed_event_ids("store-1").await, vec![1, 2]);
    assert_eq!(env.routed_event_ids("store-2").await, vec![2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn column_match_on_null_routes_only_the_transition() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;

    let mut channel = ChannelPolicyConfig::new("item");
    channel.router_type = Some(RouterType::ColumnMatch);
    channel.router_expression = Some("CLOSED_AT=NULL".to_string());
    let mut service = env.routing_service(TestEnvironment::routing_config(), vec![channel]);

    let closed = RowImage::new().with("closed_at", Some("2024-01-01"));
    env.capture.push(insert_row(1, "item", closed.clone())).await;
    run_pass(&mut service).await;
    assert!(env.batches_of("store-1").await.is_empty());

    let reopened = RowImage::new().with("closed_at", None);
    env.capture.push(update_row(2, "item", closed, reopened)).await;
    run_pass(&mut service).await;

    let batches = env.batches_of("store-1").await;
    assert_eq!(batches.len(), 1);
    assert_eq!(env.routed_event_ids("store-1").await, vec![2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn transactional_batches_keep_transactions_together() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;

    let mut channel = ChannelPolicyConfig::new("item");
    channel.max_batch_size = 2;
    channel.batch_algorithm = BatchAlgorithm::Transactional;
    let mut service = env.routing_service(TestEnvironment::routing_config(), vec![channel]);

    // Transactions `a` and `b` committed interleaved.
    for (id, transaction_id) in [(1, "a"), (2, "b"), (3, "a"), (4, "b"), (5, "a")] {
        env.capture
            .push(in_transaction(insert_event(id, "item"), transaction_id))
            .await;
    }

    run_pass(&mut service).await;

    assert_eq!(sizes(&env.batches_of("store-1").await), vec![3, 2]);
    assert_eq!(env.routed_event_ids("store-1").await, vec![1, 3, 5, 2, 4]);
}

#[tokio::test(flavor = "multi_thread")]
async fn events_are_not_routed_back_to_their_source() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1", "store-2"]).await;

    let mut ping_back = ChannelPolicyConfig::new("echo");
    ping_back.ping_back = true;
    env.catalog.link_channel("echo", "store").await;
    let mut service = env.routing_service(
        TestEnvironment::routing_config(),
        vec![ChannelPolicyConfig::new("item"), ping_back],
    );

    env.capture
        .push(from_node(insert_event(1, "item"), "store-1"))
        .await;
    env.capture
        .push(from_node(insert_event(2, "echo"), "store-1"))
        .await;

    run_pass(&mut service).await;

    let mut second = env.routed_event_ids("store-2").await;
    second.sort_unstable();
    assert_eq!(env.routed_event_ids("store-1").await, vec![2]);
    assert_eq!(second, vec![1, 2]);
    assert!(env.batches_of("server").await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn skipped_event_types_still_resolve_their_ids() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    env.capture
        .set_transaction_visibility(TransactionVisibility::NoneOpen)
        .await;

    let mut channel = ChannelPolicyConfig::new("item");
    channel.sync_on_delete = false;
    let mut service = env.routing_service(TestEnvironment::routing_config(), vec![channel]);

    let row = RowImage::new().with("id", Some("1"));
    env.capture.push(insert_row(1, "item", row.clone())).await;
    env.capture.push(delete_row(2, "item", row)).await;

    let summary = run_pass(&mut service).await;

    assert_eq!(summary.events_routed, 1);
    assert_eq!(summary.events_unrouted, 1);
    assert_eq!(env.routed_event_ids("store-1").await, vec![1]);
    assert_eq!(
        gap_bounds(&service),
        vec![(0, 2, GapStatus::Ok), (3, OPEN_END_ID, GapStatus::Open)]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn late_committed_event_is_routed_by_a_later_pass() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    let mut service = env.routing_service(
        TestEnvironment::routing_config(),
        vec![ChannelPolicyConfig::new("item")],
    );

    // Id 3 is assigned but its transaction has not committed yet.
    for id in [1, 2, 4] {
        env.capture.push(insert_event(id, "item")).await;
    }
    env.capture.reserve_id(5).await;

    run_pass(&mut service).await;
    assert_eq!(
        gap_bounds(&service),
        vec![
            (0, 0, GapStatus::Open),
            (1, 2, GapStatus::Ok),
            (3, 3, GapStatus::Open),
            (4, 4, GapStatus::Ok),
            (5, OPEN_END_ID, GapStatus::Open),
        ]
    );

    env.capture.push(insert_event(3, "item")).await;
    run_pass(&mut service).await;

    assert_eq!(env.routed_event_ids("store-1").await, vec![1, 2, 4, 3]);
    assert_eq!(
        gap_bounds(&service),
        vec![
            (0, 0, GapStatus::Open),
            (1, 4, GapStatus::Ok),
            (5, OPEN_END_ID, GapStatus::Open),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_channel_is_retried_without_duplicating_other_channels() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    env.catalog.link_channel("price", "store").await;
    env.capture
        .set_transaction_visibility(TransactionVisibility::NoneOpen)
        .await;

    let mut config = TestEnvironment::routing_config();
    config.gap_liveness_timeout_ms = 1;

    // The subselect router needs an executor that is not registered.
    let mut broken = ChannelPolicyConfig::new("price");
    broken.router_type = Some(RouterType::Subselect);
    broken.router_expression = Some("c.region = :REGION".to_string());
    let mut service = env.routing_service(
        config.clone(),
        vec![ChannelPolicyConfig::new("item"), broken],
    );

    env.capture.push(insert_event(1, "item")).await;
    env.capture.push(insert_event(2, "price")).await;
    env.capture.push(insert_event(3, "item")).await;

    let summary = run_pass(&mut service).await;

    assert_eq!(summary.failed_channels, vec![ChannelId::new("price")]);
    assert_eq!(summary.events_deferred, 1);
    assert_eq!(env.routed_event_ids("store-1").await, vec![1, 3]);
    assert_eq!(
        gap_bounds(&service),
        vec![(0, 1, GapStatus::Ok), (2, OPEN_END_ID, GapStatus::InUse)]
    );

    // Once the claim times out, a pass with a fixed policy routes the remaining event.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut service = env.routing_service(
        config,
        vec![ChannelPolicyConfig::new("item"), ChannelPolicyConfig::new("price")],
    );
    let summary = run_pass(&mut service).await;

    assert_eq!(summary.targets_already_batched, 1);
    let mut routed = env.routed_event_ids("store-1").await;
    routed.sort_unstable();
    assert_eq!(routed, vec![1, 2, 3]);
    assert_eq!(
        gap_bounds(&service),
        vec![(0, 3, GapStatus::Ok), (4, OPEN_END_ID, GapStatus::Open)]
    );
}

/// Routes to every candidate, failing on rows that carry a `poison` column.
struct PoisonSensitiveEvaluator;

#[async_trait]
impl ExpressionEvaluator for PoisonSensitiveEvaluator {
    async fn evaluate(
        &self,
        _expression: &str,
        bindings: &ExpressionBindings,
        candidates: &[Node],
    ) -> SyncResult<Vec<NodeId>> {
        if bindings.contains_key("POISON") {
            bail!(ErrorKind::Unknown, "Row cannot be evaluated");
        }

        Ok(candidates.iter().map(|node| node.node_id.clone()).collect())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_transactional_channel_defers_the_whole_transaction() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    env.catalog.link_channel("price", "store").await;
    env.capture
        .set_transaction_visibility(TransactionVisibility::NoneOpen)
        .await;

    let mut config = TestEnvironment::routing_config();
    config.gap_liveness_timeout_ms = 1;

    let mut item = ChannelPolicyConfig::new("item");
    item.router_type = Some(RouterType::Scripted);
    item.router_expression = Some("all".to_string());
    item.batch_algorithm = BatchAlgorithm::Transactional;
    let channels = vec![item, ChannelPolicyConfig::new("price")];

    env.capture
        .push(in_transaction(insert_event(1, "item"), "a"))
        .await;
    env.capture
        .push(in_transaction(insert_event(2, "item"), "a"))
        .await;
    let poisoned = insert_row(3, "item", RowImage::new().with("poison", Some("1")));
    env.capture.push(in_transaction(poisoned, "a")).await;
    env.capture.push(insert_event(4, "price")).await;

    let mut service = env.routing_service_with_backends(
        config.clone(),
        channels.clone(),
        PolicyBackends::new().with_expression_evaluator(Arc::new(PoisonSensitiveEvaluator)),
    );
    let summary = run_pass(&mut service).await;

    // Nothing of transaction `a` is batched, so it is never delivered in two parts.
    assert_eq!(summary.failed_channels, vec![ChannelId::new("item")]);
    assert_eq!(summary.events_routed, 1);
    assert_eq!(summary.events_deferred, 3);
    assert_eq!(env.routed_event_ids("store-1").await, vec![4]);
    assert_eq!(
        service.gap_tracker().gaps().last().map(|gap| (gap.start_id, gap.status)),
        Some((1, GapStatus::InUse))
    );

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut service = env.routing_service_with_backends(
        config,
        channels,
        PolicyBackends::new().with_expression_evaluator(Arc::new(EveryCandidate)),
    );
    let summary = run_pass(&mut service).await;

    assert_eq!(summary.targets_already_batched, 1);
    let batches = env.batches_of("store-1").await;
    assert_eq!(sizes(&batches), vec![1, 3]);
    assert_eq!(env.routed_event_ids("store-1").await, vec![4, 1, 2, 3]);
}

struct EveryCandidate;

#[async_trait]
impl ExpressionEvaluator for EveryCandidate {
    async fn evaluate(
        &self,
        _expression: &str,
        _bindings: &ExpressionBindings,
        candidates: &[Node],
    ) -> SyncResult<Vec<NodeId>> {
        Ok(candidates.iter().map(|node| node.node_id.clone()).collect())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn routing_cap_leaves_remaining_events_for_later() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;

    let mut channel = ChannelPolicyConfig::new("item");
    channel.max_data_to_route = Some(2);
    let mut service = env.routing_service(TestEnvironment::routing_config(), vec![channel]);

    for id in 1..=5 {
        env.capture.push(insert_event(id, "item")).await;
    }

    let summary = run_pass(&mut service).await;

    assert_eq!(summary.events_routed, 2);
    assert_eq!(summary.events_deferred, 3);
    assert_eq!(env.routed_event_ids("store-1").await, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread")]
async fn capture_read_failure_fails_the_pass_and_keeps_claims() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    env.capture
        .set_transaction_visibility(TransactionVisibility::NoneOpen)
        .await;

    let mut config = TestEnvironment::routing_config();
    config.gap_liveness_timeout_ms = 1;
    let mut service = env.routing_service(config, vec![ChannelPolicyConfig::new("item")]);

    for id in 1..=4 {
        env.capture.push(insert_event(id, "item")).await;
    }
    env.capture.set_unreadable_from(Some(3)).await;

    let err = service.run_pass().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CaptureReadFailed);
    assert!(env.batches_of("store-1").await.is_empty());
    assert_eq!(
        gap_bounds(&service),
        vec![(0, OPEN_END_ID, GapStatus::InUse)]
    );

    env.capture.set_unreadable_from(None).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let summary = run_pass(&mut service).await;
    assert_eq!(summary.events_routed, 4);
    assert_eq!(env.routed_event_ids("store-1").await, vec![1, 2, 3, 4]);
    assert_eq!(
        gap_bounds(&service),
        vec![(0, 4, GapStatus::Ok), (5, OPEN_END_ID, GapStatus::Open)]
    );
}
