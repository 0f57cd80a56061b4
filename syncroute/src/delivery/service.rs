use std::collections::{HashMap, HashSet};

use config::shared::{ChannelPolicyConfig, PULL_POOL_ID};
use metrics::counter;
use tracing::{debug, info};

use crate::catalog::NodeCatalog;
use crate::error::SyncResult;
use crate::metrics::{CHANNEL_ID_LABEL, STATUS_LABEL, SYNC_BATCH_TRANSITIONS_TOTAL};
use crate::reservation::{Admission, ReservationGuard, ReservationKind, SyncGate, SyncStatus};
use crate::router::ChannelPolicies;
use crate::store::batch::BatchStore;
use crate::types::{BatchId, BatchStatus, ChannelId, EventId, NodeId, OutgoingBatch};

/// Channel queue used when a request names none.
pub const DEFAULT_CHANNEL_QUEUE: &str = "default";

/// Pull request of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub node_id: NodeId,
    pub channel_queue: String,
    /// Channels whose batches stay queued for a later pull.
    pub suspended_channels: HashSet<ChannelId>,
    /// Channels whose batches the node does not want. They are acknowledged unsent.
    pub ignored_channels: HashSet<ChannelId>,
    /// Checks whether a pull would be admitted without taking a slot.
    pub liveness_check: bool,
}

impl PullRequest {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            channel_queue: DEFAULT_CHANNEL_QUEUE.to_string(),
            suspended_channels: HashSet::new(),
            ignored_channels: HashSet::new(),
            liveness_check: false,
        }
    }

    pub fn liveness_check(mut self) -> Self {
        self.liveness_check = true;
        self
    }

    pub fn suspend(mut self, channel_id: impl Into<ChannelId>) -> Self {
        self.suspended_channels.insert(channel_id.into());
        self
    }

    pub fn ignore(mut self, channel_id: impl Into<ChannelId>) -> Self {
        self.ignored_channels.insert(channel_id.into());
        self
    }
}

/// Answer to a [`PullRequest`].
///
/// The reservation is held until the response is dropped, which must happen only once the
/// batches were streamed or the transfer was abandoned. Batches of an abandoned transfer are
/// offered again by the next pull of the node until they are acknowledged.
#[derive(Debug)]
pub struct PullResponse {
    pub status: SyncStatus,
    /// Batches to stream, now `SENT`, ordered by batch id. Includes batches sent earlier and
    /// never acknowledged.
    pub batches: Vec<OutgoingBatch>,
    reservation: Option<ReservationGuard>,
}

impl PullResponse {
    fn rejected(status: SyncStatus) -> Self {
        Self {
            status,
            batches: Vec::new(),
            reservation: None,
        }
    }

    pub fn holds_reservation(&self) -> bool {
        self.reservation.is_some()
    }
}

/// Serves pull requests and delivery acknowledgements for finalized batches.
#[derive(Debug, Clone)]
pub struct DeliveryService<S, C> {
    store: S,
    gate: SyncGate<C>,
    policies: ChannelPolicies,
}

impl<S, C> DeliveryService<S, C>
where
    S: BatchStore,
    C: NodeCatalog,
{
    pub fn new(store: S, gate: SyncGate<C>, policies: ChannelPolicies) -> Self {
        Self {
            store,
            gate,
            policies,
        }
    }

    /// Admits a pull and selects the batches to stream.
    ///
    /// At most `max_batches_in_flight_per_node` batches per channel are returned. Batches
    /// still waiting for an acknowledgment take precedence over queued ones.
    pub async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        let kind = if request.liveness_check {
            ReservationKind::Soft
        } else {
            ReservationKind::Hard
        };

        let reservation = match self
            .gate
            .admit(&request.node_id, &request.channel_queue, PULL_POOL_ID, kind)
            .await?
        {
            Admission::Admitted(reservation) => reservation,
            Admission::Rejected(status) => {
                debug!(node_id = %request.node_id, %status, "pull rejected");
                return Ok(PullResponse::rejected(status));
            }
        };

        if request.liveness_check {
            return Ok(PullResponse {
                status: SyncStatus::Ok,
                batches: Vec::new(),
                reservation: Some(reservation),
            });
        }

        let mut deliverable = self.store.get_deliverable_batches(&request.node_id).await?;
        // Stable sort keeps batch id order within each group.
        deliverable.sort_by_key(|batch| batch.status != BatchStatus::Sent);

        let mut selected: HashMap<ChannelId, usize> = HashMap::new();
        let mut batches = Vec::new();
        for batch in deliverable {
            if request.ignored_channels.contains(&batch.channel_id) {
                self.acknowledge_ignored(&batch).await?;
                continue;
            }
            if request.suspended_channels.contains(&batch.channel_id) {
                continue;
            }

            let count = selected.entry(batch.channel_id.clone()).or_insert(0);
            if *count >= self.max_batches_in_flight(&batch.channel_id) {
                continue;
            }
            *count += 1;

            if batch.status == BatchStatus::Sent {
                debug!(
                    node_id = %batch.node_id,
                    batch_id = batch.batch_id,
                    "offering unacknowledged batch again"
                );
                batches.push(batch);
                continue;
            }

            let batch = self
                .transition(&batch.node_id, batch.batch_id, BatchStatus::Sent)
                .await?;
            batches.push(batch);
        }
        batches.sort_by_key(|batch| batch.batch_id);

        info!(
            node_id = %request.node_id,
            batches = batches.len(),
            "pull admitted"
        );

        Ok(PullResponse {
            status: SyncStatus::Ok,
            batches,
            reservation: Some(reservation),
        })
    }

    /// Records the delivery result of a sent batch.
    pub async fn acknowledge(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
        status: BatchStatus,
    ) -> SyncResult<OutgoingBatch> {
        self.transition(node_id, batch_id, status).await
    }

    /// Returns the event ids of a stored batch so it can be delivered again as is.
    pub async fn rematerialize(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> SyncResult<Vec<EventId>> {
        self.store.get_batch_event_ids(node_id, batch_id).await
    }

    /// Returns, per channel, how many batches of `node_id` are waiting for an
    /// acknowledgement.
    pub async fn in_flight(&self, node_id: &NodeId) -> SyncResult<HashMap<ChannelId, usize>> {
        self.store.get_in_flight_counts(node_id).await
    }

    async fn acknowledge_ignored(&self, batch: &OutgoingBatch) -> SyncResult<()> {
        debug!(
            node_id = %batch.node_id,
            channel_id = %batch.channel_id,
            batch_id = batch.batch_id,
            "acknowledging batch of ignored channel"
        );

        self.transition(&batch.node_id, batch.batch_id, BatchStatus::Sent)
            .await?;
        self.transition(&batch.node_id, batch.batch_id, BatchStatus::Acked)
            .await?;

        Ok(())
    }

    async fn transition(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
        status: BatchStatus,
    ) -> SyncResult<OutgoingBatch> {
        let batch = self
            .store
            .update_batch_status(node_id, batch_id, status)
            .await?;

        counter!(
            SYNC_BATCH_TRANSITIONS_TOTAL,
            CHANNEL_ID_LABEL => batch.channel_id.to_string(),
            STATUS_LABEL => status.as_str()
        )
        .increment(1);

        Ok(batch)
    }

    fn max_batches_in_flight(&self, channel_id: &ChannelId) -> usize {
        let limit = match self.policies.get(channel_id) {
            Ok(policy) => policy.config().max_batches_in_flight_per_node,
            Err(_) => ChannelPolicyConfig::DEFAULT_MAX_BATCHES_IN_FLIGHT_PER_NODE,
        };

        limit as usize
    }
}

#[cfg(test)]
mod tests {
    use config::shared::ReservationConfig;

    use super::*;
    use crate::catalog::memory::MemoryNodeCatalog;
    use crate::reservation::ReservationManager;
    use crate::store::both::memory::MemoryStore;
    use crate::types::{EventTypeCounts, NewOutgoingBatch, Node};

    async fn service(
        store: &MemoryStore,
    ) -> DeliveryService<MemoryStore, MemoryNodeCatalog> {
        let catalog = MemoryNodeCatalog::new();
        catalog.add_node(Node::new("store-1", "store", "1")).await;

        let mut item = ChannelPolicyConfig::new("item");
        item.max_batches_in_flight_per_node = 2;

        DeliveryService::new(
            store.clone(),
            SyncGate::new(catalog, ReservationManager::new(ReservationConfig::default())),
            ChannelPolicies::new([item, ChannelPolicyConfig::new("audit")]),
        )
    }

    async fn queue(store: &MemoryStore, channel_id: &str, event_ids: Vec<EventId>) {
        store
            .insert_outgoing_batch(NewOutgoingBatch {
                node_id: NodeId::new("store-1"),
                channel_id: ChannelId::new(channel_id),
                event_ids,
                event_counts: EventTypeCounts::default(),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn pull_honours_in_flight_limit() {
        let store = MemoryStore::new();
        let service = service(&store).await;
        for id in 1..=3 {
            queue(&store, "item", vec![id]).await;
        }

        let response = service.pull(PullRequest::new("store-1")).await.unwrap();
        let ids: Vec<BatchId> = response.batches.iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![1, 2]);
        drop(response);

        // Nothing was acknowledged, so the same two batches fill the limit again.
        let response = service.pull(PullRequest::new("store-1")).await.unwrap();
        let ids: Vec<BatchId> = response.batches.iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![1, 2]);
        drop(response);

        let node = NodeId::new("store-1");
        service.acknowledge(&node, 1, BatchStatus::Acked).await.unwrap();
        let response = service.pull(PullRequest::new("store-1")).await.unwrap();
        let ids: Vec<BatchId> = response.batches.iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[tokio::test]
    async fn abandoned_pull_is_offered_again() {
        let store = MemoryStore::new();
        let service = service(&store).await;
        queue(&store, "item", vec![1]).await;
        let node = NodeId::new("store-1");

        let abandoned = service.pull(PullRequest::new("store-1")).await.unwrap();
        assert_eq!(abandoned.batches.len(), 1);
        drop(abandoned);

        let retry = service.pull(PullRequest::new("store-1")).await.unwrap();
        assert_eq!(retry.batches.len(), 1);
        assert_eq!(retry.batches[0].batch_id, 1);
        assert_eq!(retry.batches[0].status, BatchStatus::Sent);
        drop(retry);

        service.acknowledge(&node, 1, BatchStatus::Acked).await.unwrap();
        let done = service.pull(PullRequest::new("store-1")).await.unwrap();
        assert!(done.batches.is_empty());
        assert!(service.in_flight(&node).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ignored_channels_are_acknowledged_and_suspended_kept() {
        let store = MemoryStore::new();
        let service = service(&store).await;
        queue(&store, "item", vec![1]).await;
        queue(&store, "audit", vec![2]).await;

        let response = service
            .pull(PullRequest::new("store-1").ignore("audit").suspend("item"))
            .await
            .unwrap();
        assert!(response.batches.is_empty());

        let node = NodeId::new("store-1");
        let audit = store.get_outgoing_batch(&node, 2).await.unwrap().unwrap();
        let item = store.get_outgoing_batch(&node, 1).await.unwrap().unwrap();
        assert_eq!(audit.status, BatchStatus::Acked);
        assert_eq!(item.status, BatchStatus::Queued);
    }

    #[tokio::test]
    async fn liveness_check_takes_no_slot_and_returns_nothing() {
        let store = MemoryStore::new();
        let service = service(&store).await;
        queue(&store, "item", vec![1]).await;

        let check = service
            .pull(PullRequest::new("store-1").liveness_check())
            .await
            .unwrap();
        assert_eq!(check.status, SyncStatus::Ok);
        assert!(check.batches.is_empty());

        let pull = service.pull(PullRequest::new("store-1")).await.unwrap();
        assert_eq!(pull.status, SyncStatus::Ok);
        assert_eq!(pull.batches.len(), 1);

        let busy = service.pull(PullRequest::new("store-1")).await.unwrap();
        assert_eq!(busy.status, SyncStatus::Busy);
        let busy_check = service
            .pull(PullRequest::new("store-1").liveness_check())
            .await
            .unwrap();
        assert_eq!(busy_check.status, SyncStatus::Busy);
    }

    #[tokio::test]
    async fn failed_batch_is_delivered_again_unchanged() {
        let store = MemoryStore::new();
        let service = service(&store).await;
        queue(&store, "item", vec![4, 5, 6]).await;
        let node = NodeId::new("store-1");

        drop(service.pull(PullRequest::new("store-1")).await.unwrap());
        service.acknowledge(&node, 1, BatchStatus::Error).await.unwrap();

        let retry = service.pull(PullRequest::new("store-1")).await.unwrap();
        assert_eq!(retry.batches[0].batch_id, 1);
        assert_eq!(service.rematerialize(&node, 1).await.unwrap(), vec![4, 5, 6]);
    }
}
