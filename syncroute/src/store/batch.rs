use std::collections::{HashMap, HashSet};
use std::future::Future;

use chrono::{DateTime, Utc};

use crate::error::SyncResult;
use crate::types::{BatchId, BatchStatus, ChannelId, EventId, NodeId, NewOutgoingBatch, OutgoingBatch};

/// Persistence of outgoing batches and their event membership.
pub trait BatchStore {
    /// Stores a finalized batch as `QUEUED` under the next batch id of its node.
    ///
    /// Batch ids are allocated per node, start at 1 and never skip a number.
    fn insert_outgoing_batch(
        &self,
        batch: NewOutgoingBatch,
    ) -> impl Future<Output = SyncResult<OutgoingBatch>> + Send;

    fn get_outgoing_batch(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> impl Future<Output = SyncResult<Option<OutgoingBatch>>> + Send;

    /// Returns the event ids of a batch in batch order.
    fn get_batch_event_ids(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
    ) -> impl Future<Output = SyncResult<Vec<EventId>>> + Send;

    /// Returns the `(event, node)` pairs with an id in `[start_id, end_id]` already present in
    /// some batch.
    fn get_routed_targets(
        &self,
        start_id: EventId,
        end_id: EventId,
    ) -> impl Future<Output = SyncResult<HashSet<(EventId, NodeId)>>> + Send;

    /// Returns the batches of a node not yet acknowledged (`QUEUED`, `SENT`, `ERROR` and
    /// `RESEND`) ordered by batch id.
    fn get_deliverable_batches(
        &self,
        node_id: &NodeId,
    ) -> impl Future<Output = SyncResult<Vec<OutgoingBatch>>> + Send;

    /// Returns, per channel, how many batches of a node are `SENT` and not yet acknowledged.
    fn get_in_flight_counts(
        &self,
        node_id: &NodeId,
    ) -> impl Future<Output = SyncResult<HashMap<ChannelId, usize>>> + Send;

    /// Moves a batch to `status`, rejecting transitions the batch lifecycle does not allow.
    fn update_batch_status(
        &self,
        node_id: &NodeId,
        batch_id: BatchId,
        status: BatchStatus,
    ) -> impl Future<Output = SyncResult<OutgoingBatch>> + Send;

    /// Deletes `ACKED` batches last updated before `older_than` whose events all lie below
    /// `below_event_id`. Returns the number deleted.
    ///
    /// Batches holding an event a later pass may scan again are kept, since they are what
    /// [`BatchStore::get_routed_targets`] reports as already batched.
    fn purge_acknowledged_batches(
        &self,
        older_than: DateTime<Utc>,
        below_event_id: EventId,
    ) -> impl Future<Output = SyncResult<u64>> + Send;
}
