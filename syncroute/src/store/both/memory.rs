use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::store::batch::BatchStore;
use crate::store::gap::{GapChange, GapStore};
use crate::store::lease::LeaseStore;
use crate::types::{
    BatchId, BatchStatus, ChannelId, DataGap, EventId, NewOutgoingBatch, NodeId, OutgoingBatch,
};

#[derive(Debug)]
struct StoredBatch {
    batch: OutgoingBatch,
    event_ids: Vec<EventId>,
}

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    gaps: BTreeMap<(EventId, EventId), DataGap>,
    batches: BTreeMap<(NodeId, BatchId), StoredBatch>,
    /// Last batch id handed out per node.
    last_batch_ids: HashMap<NodeId, BatchId>,
    /// Nodes each event was batched for.
    routed: BTreeMap<EventId, HashSet<NodeId>>,
    leases: HashMap<String, Lease>,
}

/// In-memory implementation of every store trait.
///
/// State is lost when the process exits. Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all gaps ordered by bounds.
    pub async fn data_gaps(&self) -> Vec<DataGap> {
        let inner = self.inner.lock().await;
        inner.gaps.values().cloned().collect()
    }

    /// Returns every stored batch ordered by node and batch id.
    pub async fn outgoing_batches(&self) -> Vec<OutgoingBatch> {
        let inner = self.inner.lock().await;
        inner
            .batches
            .values()
            .map(|stored| stored.batch.clone())
            .collect()
    }
}

impl GapStore for MemoryStore {
    async fn load_data_gaps(&self) -> SyncResult<Vec<DataGap>> {
        Ok(self.data_gaps().await)
    }

    async fn apply_gap_changes(&self, changes: Vec<GapChange>) -> SyncResult<()> {
        let mut inner = self.inner.lock().await;

        for change in changes {
            match change {
                GapChange::Upsert(gap) => {
                    inner.gaps.insert((gap.start_id, gap.end_id), gap);
                }
                GapChange::Delete { start_id, end_id } => {
                    inner.gaps.remove(&(start_id, end_id));
                }
            }
        }

        Ok(())
    }
}

impl BatchStore for MemoryStore {
    async fn insert_outgoing_batch(&self, batch: NewOutgoingBatch) -> SyncResult<OutgoingBatch> {
        let mut inner = self.inner.lock().await;

        let last_batch_id = inner.last_batch_ids.entry(batch.node_id.clone()).or_insert(0);
        *last_batch_id += 1;
        let batch_id = *last_batch_id;

        let outgoing = OutgoingBatch {
            batch_id,
            node_id: batch.node_id.clone(),
            channel_id: batch.channel_id,
            status: BatchStatus::Queued,
            event_count: batch.event_ids.len(),
            event_counts: batch.event_counts,
            created_at: batch.created_at,
            last_updated_at: batch.created_at,
        };

        for event_id in &batch.event_ids {
            inner
                .routed
                .entry(*event_id)
                .or_default()
                .insert(batch.node_id.clone());
        }

        inner.batches.insert(
            (batch.node_id, batch_id),
            StoredBatch {
                batch: outgoing.clone(),
                event_ids: batch.event_ids,
            },
        );

        Ok(outgoing)
    }

    async fn get_outgoing_batch(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> SyncResult<Option<OutgoingBatch>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .batches
            .get(&(node_id.clone(), batch_id))
            .map(|stored| stored.batch.clone()))
    }

    async fn get_batch_event_ids(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> SyncResult<Vec<EventId>> {
        let inner = self.inner.lock().await;

        match inner.batches.get(&(node_id.clone(), batch_id)) {
            Some(stored) => Ok(stored.event_ids.clone()),
            None => bail!(
                ErrorKind::BatchNotFound,
                "Outgoing batch not found",
                format!("batch {batch_id} of node `{node_id}` does not exist")
            ),
        }
    }

    async fn get_routed_targets(
        &self,
        start_id: EventId,
        end_id: EventId,
    ) -> SyncResult<HashSet<(EventId, NodeId)>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .routed
            .range(start_id..=end_id)
            .flat_map(|(event_id, nodes)| {
                nodes.iter().map(move |node_id| (*event_id, node_id.clone()))
            })
            .collect())
    }

    async fn get_deliverable_batches(&self, node_id: &NodeId) -> SyncResult<Vec<OutgoingBatch>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .batches
            .values()
            .filter(|stored| &stored.batch.node_id == node_id && stored.batch.status.is_deliverable())
            .map(|stored| stored.batch.clone())
            .collect())
    }

    async fn get_in_flight_counts(&self, node_id: &NodeId) -> SyncResult<HashMap<ChannelId, usize>> {
        let inner = self.inner.lock().await;

        let mut counts = HashMap::new();
        for stored in inner.batches.values() {
            if &stored.batch.node_id == node_id && stored.batch.status == BatchStatus::Sent {
                *counts.entry(stored.batch.channel_id.clone()).or_insert(0) += 1;
            }
        }

        Ok(counts)
    }

    async fn update_batch_status(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
        status: BatchStatus,
    ) -> SyncResult<OutgoingBatch> {
        let mut inner = self.inner.lock().await;

        let Some(stored) = inner.batches.get_mut(&(node_id.clone(), batch_id)) else {
            bail!(
                ErrorKind::BatchNotFound,
                "Outgoing batch not found",
                format!("batch {batch_id} of node `{node_id}` does not exist")
            );
        };

        if !stored.batch.status.can_transition_to(status) {
            bail!(
                ErrorKind::InvalidBatchTransition,
                "Batch status transition is not allowed",
                format!(
                    "batch {batch_id} of node `{node_id}` cannot move from {} to {status}",
                    stored.batch.status
                )
            );
        }

        stored.batch.status = status;
        stored.batch.last_updated_at = Utc::now();

        Ok(stored.batch.clone())
    }

    async fn purge_acknowledged_batches(
        &self,
        older_than: DateTime<Utc>,
        below_event_id: EventId,
    ) -> SyncResult<u64> {
        let mut inner = self.inner.lock().await;

        let purged: Vec<(NodeId, BatchId)> = inner
            .batches
            .iter()
            .filter(|(_, stored)| {
                stored.batch.status == BatchStatus::Acked
                    && stored.batch.last_updated_at < older_than
                    && stored.event_ids.iter().all(|event_id| *event_id < below_event_id)
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in &purged {
            let Some(stored) = inner.batches.remove(key) else {
                continue;
            };
            for event_id in stored.event_ids {
                let now_unrouted = match inner.routed.get_mut(&event_id) {
                    Some(nodes) => {
                        nodes.remove(&key.0);
                        nodes.is_empty()
                    }
                    None => false,
                };
                if now_unrouted {
                    inner.routed.remove(&event_id);
                }
            }
        }

        Ok(purged.len() as u64)
    }
}

impl LeaseStore for MemoryStore {
    async fn try_acquire_lease(&self, name: &str, owner: &str, ttl: Duration) -> SyncResult<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365));

        if let Some(lease) = inner.leases.get(name)
            && lease.owner != owner
            && lease.expires_at > now
        {
            return Ok(false);
        }

        inner.leases.insert(
            name.to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );

        Ok(true)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> SyncResult<bool> {
        let mut inner = self.inner.lock().await;

        if inner.leases.get(name).is_some_and(|lease| lease.owner == owner) {
            inner.leases.remove(name);
            return Ok(true);
        }

        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventTypeCounts;

    fn new_batch(node_id: &str, event_ids: Vec<EventId>) -> NewOutgoingBatch {
        NewOutgoingBatch {
            node_id: NodeId::new(node_id),
            channel_id: ChannelId::new("item"),
            event_ids,
            event_counts: EventTypeCounts::default(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn batch_ids_are_gapless_per_node() {
        let store = MemoryStore::new();

        let a1 = store.insert_outgoing_batch(new_batch("a", vec![1])).await.unwrap();
        let b1 = store.insert_outgoing_batch(new_batch("b", vec![1])).await.unwrap();
        let a2 = store.insert_outgoing_batch(new_batch("a", vec![2, 3])).await.unwrap();

        assert_eq!((a1.batch_id, a2.batch_id, b1.batch_id), (1, 2, 1));
        assert_eq!(a2.event_count, 2);
        assert_eq!(a2.status, BatchStatus::Queued);
    }

    #[tokio::test]
    async fn routed_targets_cover_range() {
        let store = MemoryStore::new();
        store.insert_outgoing_batch(new_batch("a", vec![4, 5])).await.unwrap();
        store.insert_outgoing_batch(new_batch("b", vec![5, 9])).await.unwrap();

        let targets = store.get_routed_targets(5, 8).await.unwrap();

        assert_eq!(
            targets,
            HashSet::from([(5, NodeId::new("a")), (5, NodeId::new("b"))])
        );
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let store = MemoryStore::new();
        let node = NodeId::new("a");
        store.insert_outgoing_batch(new_batch("a", vec![1])).await.unwrap();

        let err = store
            .update_batch_status(&node, 1, BatchStatus::Acked)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidBatchTransition);

        store.update_batch_status(&node, 1, BatchStatus::Sent).await.unwrap();
        let counts = store.get_in_flight_counts(&node).await.unwrap();
        assert_eq!(counts.get(&ChannelId::new("item")), Some(&1));
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.try_acquire_lease("routing", "a", ttl).await.unwrap());
        assert!(!store.try_acquire_lease("routing", "b", ttl).await.unwrap());
        assert!(store.try_acquire_lease("routing", "a", ttl).await.unwrap());

        assert!(!store.release_lease("routing", "b").await.unwrap());
        assert!(store.release_lease("routing", "a").await.unwrap());
        assert!(store.try_acquire_lease("routing", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let store = MemoryStore::new();

        assert!(store.try_acquire_lease("routing", "a", Duration::ZERO).await.unwrap());
        assert!(
            store
                .try_acquire_lease("routing", "b", Duration::from_secs(60))
                .await
                .unwrap()
        );
    }
}
