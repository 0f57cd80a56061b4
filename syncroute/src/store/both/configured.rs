use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use config::shared::StoreConfig;

use crate::error::SyncResult;
use crate::store::batch::BatchStore;
use crate::store::both::memory::MemoryStore;
use crate::store::both::postgres::PostgresStore;
use crate::store::gap::{GapChange, GapStore};
use crate::store::lease::LeaseStore;
use crate::store::migrations::apply_routing_migrations;
use crate::types::{
    BatchId, BatchStatus, ChannelId, DataGap, EventId, NewOutgoingBatch, NodeId, OutgoingBatch,
};

macro_rules! dispatch {
    ($self:ident, $store:ident => $call:expr) => {
        match $self {
            ConfiguredStore::Memory($store) => $call,
            ConfiguredStore::Postgres($store) => $call,
        }
    };
}

/// Store selected by [`StoreConfig`].
#[derive(Debug, Clone)]
pub enum ConfiguredStore {
    Memory(MemoryStore),
    Postgres(PostgresStore),
}

impl ConfiguredStore {
    /// Builds the configured store. For Postgres, pending migrations are applied first.
    pub async fn connect(config: &StoreConfig) -> SyncResult<Self> {
        match config {
            StoreConfig::Memory => Ok(ConfiguredStore::Memory(MemoryStore::new())),
            StoreConfig::Postgres(connection) => {
                apply_routing_migrations(connection).await?;
                Ok(ConfiguredStore::Postgres(PostgresStore::new(connection)))
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConfiguredStore::Memory(_) => "memory",
            ConfiguredStore::Postgres(_) => "postgres",
        }
    }
}

impl GapStore for ConfiguredStore {
    async fn load_data_gaps(&self) -> SyncResult<Vec<DataGap>> {
        dispatch!(self, store => store.load_data_gaps().await)
    }

    async fn apply_gap_changes(&self, changes: Vec<GapChange>) -> SyncResult<()> {
        dispatch!(self, store => store.apply_gap_changes(changes).await)
    }
}

impl BatchStore for ConfiguredStore {
    async fn insert_outgoing_batch(&self, batch: NewOutgoingBatch) -> SyncResult<OutgoingBatch> {
        dispatch!(self, store => store.insert_outgoing_batch(batch).await)
    }

    async fn get_outgoing_batch(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> SyncResult<Option<OutgoingBatch>> {
        dispatch!(self, store => store.get_outgoing_batch(node_id, batch_id).await)
    }

    async fn get_batch_event_ids(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> SyncResult<Vec<EventId>> {
        dispatch!(self, store => store.get_batch_event_ids(node_id, batch_id).await)
    }

    async fn get_routed_targets(
        &self,
        start_id: EventId,
        end_id: EventId,
    ) -> SyncResult<HashSet<(EventId, NodeId)>> {
        dispatch!(self, store => store.get_routed_targets(start_id, end_id).await)
    }

    async fn get_deliverable_batches(&self, node_id: &NodeId) -> SyncResult<Vec<OutgoingBatch>> {
        dispatch!(self, store => store.get_deliverable_batches(node_id).await)
    }

    async fn get_in_flight_counts(&self, node_id: &NodeId) -> SyncResult<HashMap<ChannelId, usize>> {
        dispatch!(self, store => store.get_in_flight_counts(node_id).await)
    }

    async fn update_batch_status(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
        status: BatchStatus,
    ) -> SyncResult<OutgoingBatch> {
        dispatch!(self, store => store.update_batch_status(node_id, batch_id, status).await)
    }

    async fn purge_acknowledged_batches(
        &self,
        older_than: DateTime<Utc>,
        below_event_id: EventId,
    ) -> SyncResult<u64> {
        dispatch!(self, store => store.purge_acknowledged_batches(older_than, below_event_id).await)
    }
}

impl LeaseStore for ConfiguredStore {
    async fn try_acquire_lease(&self, name: &str, owner: &str, ttl: Duration) -> SyncResult<bool> {
        dispatch!(self, store => store.try_acquire_lease(name, owner, ttl).await)
    }

    async fn release_lease(&self, name: &str, owner: &str) -> SyncResult<bool> {
        dispatch!(self, store => store.release_lease(name, owner).await)
    }
}
