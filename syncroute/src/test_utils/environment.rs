use config::shared::{ChannelPolicyConfig, ReservationConfig, RoutingConfig};

use crate::capture::memory::MemoryCaptureSource;
use crate::catalog::memory::MemoryNodeCatalog;
use crate::delivery::DeliveryService;
use crate::reservation::{ReservationManager, SyncGate};
use crate::router::{ChannelPolicies, PolicyBackends};
use crate::routing::RoutingService;
use crate::store::batch::BatchStore;
use crate::store::both::memory::MemoryStore;
use crate::types::{EventId, Node, NodeId, OutgoingBatch};

/// Id of the router node in test environments.
pub const ROUTER_NODE_ID: &str = "server";

pub type TestRoutingService = RoutingService<MemoryStore, MemoryCaptureSource, MemoryNodeCatalog>;

pub type TestDeliveryService = DeliveryService<MemoryStore, MemoryNodeCatalog>;

/// In-memory store, capture source and catalog shared by the services under test.
#[derive(Debug, Clone, Default)]
pub struct TestEnvironment {
    pub store: MemoryStore,
    pub capture: MemoryCaptureSource,
    pub catalog: MemoryNodeCatalog,
}

impl TestEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routing settings of [`ROUTER_NODE_ID`] with defaults suited to tests.
    pub fn routing_config() -> RoutingConfig {
        let mut config = RoutingConfig::new(ROUTER_NODE_ID);
        config.interval_ms = 50;
        config.lease_ttl_ms = 60_000;
        config
    }

    /// Registers the router node and `nodes`, linking `channel_id` to `node_group_id`.
    pub async fn register_group(&self, channel_id: &str, node_group_id: &str, nodes: &[&str]) {
        self.catalog
            .add_node(Node::new(ROUTER_NODE_ID, "server", ROUTER_NODE_ID))
            .await;
        for node_id in nodes {
            self.catalog
                .add_node(Node::new(*node_id, node_group_id, *node_id))
                .await;
        }
        self.catalog.link_channel(channel_id, node_group_id).await;
    }

    pub fn routing_service(
        &self,
        config: RoutingConfig,
        channels: Vec<ChannelPolicyConfig>,
    ) -> TestRoutingService {
        self.routing_service_with_backends(config, channels, PolicyBackends::new())
    }

    pub fn routing_service_with_backends(
        &self,
        config: RoutingConfig,
        channels: Vec<ChannelPolicyConfig>,
        backends: PolicyBackends,
    ) -> TestRoutingService {
        RoutingService::new(
            config,
            self.store.clone(),
            self.capture.clone(),
            self.catalog.clone(),
            ChannelPolicies::new(channels),
            backends,
        )
    }

    pub fn delivery_service(
        &self,
        reservation: ReservationConfig,
        channels: Vec<ChannelPolicyConfig>,
    ) -> TestDeliveryService {
        DeliveryService::new(
            self.store.clone(),
            SyncGate::new(self.catalog.clone(), ReservationManager::new(reservation)),
            ChannelPolicies::new(channels),
        )
    }

    /// Returns the stored batches of `node_id` ordered by batch id.
    pub async fn batches_of(&self, node_id: &str) -> Vec<OutgoingBatch> {
        let node_id = NodeId::new(node_id);

        self.store
            .outgoing_batches()
            .await
            .into_iter()
            .filter(|batch| batch.node_id == node_id)
            .collect()
    }

    /// Returns every event id batched for `node_id`, in batch order.
    pub async fn routed_event_ids(&self, node_id: &str) -> Vec<EventId> {
        let mut event_ids = Vec::new();
        for batch in self.batches_of(node_id).await {
            event_ids.extend(
                self.store
                    .get_batch_event_ids(&batch.node_id, batch.batch_id)
                    .await
                    .unwrap(),
            );
        }
        event_ids
    }
}
