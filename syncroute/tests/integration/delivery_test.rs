use config::shared::{ChannelPolicyConfig, ReservationConfig};
use syncroute::delivery::PullRequest;
use syncroute::reservation::SyncStatus;
use syncroute::routing::PassOutcome;
use syncroute::test_utils::environment::TestEnvironment;
use syncroute::test_utils::event::insert_event;
use syncroute::types::{BatchStatus, Node, NodeId};
use telemetry::init_test_tracing;

#[tokio::test(flavor = "multi_thread")]
async fn routed_batches_are_pulled_and_acknowledged() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    env.catalog
        .add_node(Node::new("store-2", "store", "store-2").disabled())
        .await;

    let mut channel = ChannelPolicyConfig::new("item");
    channel.max_batch_size = 2;
    let channels = vec![channel];
    let mut routing = env.routing_service(TestEnvironment::routing_config(), channels.clone());
    let delivery = env.delivery_service(ReservationConfig::default(), channels);

    for id in 1..=3 {
        env.capture.push(insert_event(id, "item")).await;
    }
    assert!(matches!(
        routing.run_pass().await.unwrap(),
        PassOutcome::Completed(_)
    ));

    let unknown = delivery.pull(PullRequest::new("store-9")).await.unwrap();
    assert_eq!(unknown.status, SyncStatus::RegistrationRequired);
    let disabled = delivery.pull(PullRequest::new("store-2")).await.unwrap();
    assert_eq!(disabled.status, SyncStatus::Forbidden);

    let pull = delivery.pull(PullRequest::new("store-1")).await.unwrap();
    assert_eq!(pull.status.code(), 200);
    assert!(pull.holds_reservation());
    assert_eq!(pull.batches.len(), 2);
    assert!(pull.batches.iter().all(|batch| batch.status == BatchStatus::Sent));

    // The first pull still streams, so a second one is refused as busy.
    let busy = delivery.pull(PullRequest::new("store-1")).await.unwrap();
    assert_eq!(busy.status.code(), 503);
    assert!(!busy.holds_reservation());

    let node_id = NodeId::new("store-1");
    for batch in &pull.batches {
        let event_ids = delivery
            .rematerialize(&node_id, batch.batch_id)
            .await
            .unwrap();
        assert_eq!(event_ids.len(), batch.event_count);
        delivery
            .acknowledge(&node_id, batch.batch_id, BatchStatus::Acked)
            .await
            .unwrap();
    }
    drop(pull);

    let again = delivery.pull(PullRequest::new("store-1")).await.unwrap();
    assert_eq!(again.status, SyncStatus::Ok);
    assert!(again.batches.is_empty());
    assert!(delivery.in_flight(&node_id).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledging_an_unsent_batch_is_rejected() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    let channels = vec![ChannelPolicyConfig::new("item")];
    let mut routing = env.routing_service(TestEnvironment::routing_config(), channels.clone());
    let delivery = env.delivery_service(ReservationConfig::default(), channels);

    env.capture.push(insert_event(1, "item")).await;
    routing.run_pass().await.unwrap();

    let err = delivery
        .acknowledge(&NodeId::new("store-1"), 1, BatchStatus::Acked)
        .await
        .unwrap_err();
    assert_eq!(
        err.kind(),
        syncroute::error::ErrorKind::InvalidBatchTransition
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_pull_frees_its_slot_and_is_offered_again() {
    init_test_tracing();
    let env = TestEnvironment::new();
    env.register_group("item", "store", &["store-1"]).await;
    let channels = vec![ChannelPolicyConfig::new("item")];
    let mut routing = env.routing_service(TestEnvironment::routing_config(), channels.clone());
    let delivery = env.delivery_service(ReservationConfig::default(), channels);

    for id in 1..=2 {
        env.capture.push(insert_event(id, "item")).await;
    }
    routing.run_pass().await.unwrap();

    // The transfer breaks off: nothing is acknowledged and the response is dropped.
    let abandoned = delivery.pull(PullRequest::new("store-1")).await.unwrap();
    assert_eq!(abandoned.batches.len(), 1);
    let batch_id = abandoned.batches[0].batch_id;
    drop(abandoned);

    let retry = delivery.pull(PullRequest::new("store-1")).await.unwrap();
    assert_eq!(retry.status, SyncStatus::Ok);
    assert!(retry.holds_reservation());
    assert_eq!(
        retry.batches.iter().map(|batch| batch.batch_id).collect::<Vec<_>>(),
        vec![batch_id]
    );

    let node_id = NodeId::new("store-1");
    delivery
        .acknowledge(&node_id, batch_id, BatchStatus::Acked)
        .await
        .unwrap();
    drop(retry);

    let done = delivery.pull(PullRequest::new("store-1")).await.unwrap();
    assert_eq!(done.status, SyncStatus::Ok);
    assert!(done.batches.is_empty());
}
