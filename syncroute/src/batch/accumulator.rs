use std::collections::HashMap;

use chrono::{DateTime, Utc};
use config::shared::BatchAlgorithm;
use metrics::counter;
use tracing::debug;

use crate::batch::BatchSettings;
use crate::error::SyncResult;
use crate::metrics::{CHANNEL_ID_LABEL, SYNC_BATCHES_FINALIZED_TOTAL};
use crate::store::batch::BatchStore;
use crate::types::{
    BatchStatus, ChannelId, EventId, EventType, EventTypeCounts, NewOutgoingBatch, NodeId,
    OutgoingBatch,
};

/// Decision that one event goes to one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub event_id: EventId,
    pub node_id: NodeId,
    pub channel_id: ChannelId,
    pub event_type: EventType,
    pub transaction_id: Option<String>,
}

/// Batch still being filled. Only exists once it holds an event.
#[derive(Debug)]
struct OpenBatch {
    node_id: NodeId,
    channel_id: ChannelId,
    status: BatchStatus,
    settings: BatchSettings,
    events: Vec<(EventId, EventType)>,
    last_transaction_id: Option<String>,
    /// Index of the first event of the trailing transaction.
    transaction_start: usize,
    created_at: DateTime<Utc>,
}

impl OpenBatch {
    fn new(node_id: NodeId, channel_id: ChannelId, settings: BatchSettings) -> Self {
        Self {
            node_id,
            channel_id,
            status: BatchStatus::New,
            settings,
            events: Vec::new(),
            last_transaction_id: None,
            transaction_start: 0,
            created_at: Utc::now(),
        }
    }

    fn completes_before(&self, next_transaction_id: Option<&str>) -> bool {
        self.settings.completes_before(
            self.events.len(),
            self.last_transaction_id.as_deref(),
            next_transaction_id,
        )
    }

    fn push(&mut self, event_id: EventId, event_type: EventType, transaction_id: Option<String>) {
        if transaction_id.is_none() || transaction_id != self.last_transaction_id {
            self.transaction_start = self.events.len();
        }
        self.events.push((event_id, event_type));
        self.last_transaction_id = transaction_id;
    }

    /// Removes the events of the trailing transaction from `from_event_id` on, returning
    /// their ids.
    fn withdraw_trailing(&mut self, from_event_id: EventId) -> Vec<EventId> {
        let trailing = self.events.split_off(self.transaction_start);
        let (withdrawn, kept): (Vec<_>, Vec<_>) = trailing
            .into_iter()
            .partition(|(event_id, _)| *event_id >= from_event_id);
        self.events.extend(kept);
        self.last_transaction_id = None;
        self.transaction_start = self.events.len();

        withdrawn.into_iter().map(|(event_id, _)| event_id).collect()
    }

    fn into_new_outgoing(self) -> NewOutgoingBatch {
        let mut event_counts = EventTypeCounts::default();
        for (_, event_type) in &self.events {
            event_counts.record(*event_type);
        }

        NewOutgoingBatch {
            node_id: self.node_id,
            channel_id: self.channel_id,
            event_ids: self.events.into_iter().map(|(event_id, _)| event_id).collect(),
            event_counts,
            created_at: self.created_at,
        }
    }
}

/// Open batches of a routing pass, one per node and channel.
///
/// Owned by the single active routing pass. A batch becomes visible to delivery only once it
/// is finalized, at which point the store numbers it and stores it as `QUEUED`.
#[derive(Debug)]
pub struct BatchAccumulator<S> {
    store: S,
    open: HashMap<(NodeId, ChannelId), OpenBatch>,
    /// Complete batches waiting for [`BatchAccumulator::flush_if_due`], in completion order.
    complete: Vec<OpenBatch>,
}

impl<S> BatchAccumulator<S>
where
    S: BatchStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            open: HashMap::new(),
            complete: Vec::new(),
        }
    }

    /// Adds a routed event to the open batch of its node and channel.
    ///
    /// When the open batch is already complete under `settings` it is set aside for the next
    /// flush and a new batch is opened.
    pub fn accumulate(&mut self, decision: RoutingDecision, settings: BatchSettings) {
        let key = (decision.node_id.clone(), decision.channel_id.clone());

        if let Some(open) = self.open.get(&key)
            && open.completes_before(decision.transaction_id.as_deref())
            && let Some(complete) = self.open.remove(&key)
        {
            self.complete.push(complete);
        }

        let open = self.open.entry(key).or_insert_with(|| {
            OpenBatch::new(
                decision.node_id.clone(),
                decision.channel_id.clone(),
                settings,
            )
        });
        open.push(
            decision.event_id,
            decision.event_type,
            decision.transaction_id,
        );
    }

    /// Takes back the events of `transaction_id` that were added to the open batches of
    /// `channel_id`, keeping those below `from_event_id`. Returns the distinct ids taken back,
    /// in id order.
    ///
    /// Used when a transactional channel fails partway through a transaction, so that a
    /// later pass batches the whole transaction together.
    pub fn withdraw_transaction(
        &mut self,
        channel_id: &ChannelId,
        transaction_id: &str,
        from_event_id: EventId,
    ) -> Vec<EventId> {
        let mut withdrawn = Vec::new();
        let mut emptied = Vec::new();
        for (key, open) in self.open.iter_mut() {
            if &key.1 != channel_id || open.last_transaction_id.as_deref() != Some(transaction_id)
            {
                continue;
            }

            withdrawn.extend(open.withdraw_trailing(from_event_id));
            if open.events.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            self.open.remove(&key);
        }

        withdrawn.sort_unstable();
        withdrawn.dedup();
        if !withdrawn.is_empty() {
            debug!(
                channel_id = %channel_id,
                transaction_id,
                events = withdrawn.len(),
                "withdrew partially routed transaction"
            );
        }

        withdrawn
    }

    /// Finalizes the batches that are complete, returning them as stored.
    pub async fn flush_if_due(&mut self) -> SyncResult<Vec<OutgoingBatch>> {
        for key in self.due_keys() {
            if let Some(complete) = self.open.remove(&key) {
                self.complete.push(complete);
            }
        }

        self.finalize_complete().await
    }

    /// Finalizes every batch, complete or not. Called when the pass has no more events.
    pub async fn finalize_open(&mut self) -> SyncResult<Vec<OutgoingBatch>> {
        let mut remaining: Vec<OpenBatch> = self.open.drain().map(|(_, open)| open).collect();
        remaining.sort_by(|a, b| {
            let first_id = |open: &OpenBatch| open.events.first().map(|(event_id, _)| *event_id);
            (&a.node_id, &a.channel_id, first_id(a)).cmp(&(&b.node_id, &b.channel_id, first_id(b)))
        });
        self.complete.extend(remaining);

        self.finalize_complete().await
    }

    /// Returns the number of batches not yet finalized.
    pub fn pending_batches(&self) -> usize {
        self.open.len() + self.complete.len()
    }

    /// Open batches that already reached their size, which only non-transactional rules
    /// finalize without waiting for the next event.
    fn due_keys(&self) -> Vec<(NodeId, ChannelId)> {
        self.open
            .iter()
            .filter(|(_, open)| {
                open.events.len() >= open.settings.max_batch_size
                    && open.settings.algorithm != BatchAlgorithm::Transactional
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    async fn finalize_complete(&mut self) -> SyncResult<Vec<OutgoingBatch>> {
        let complete = std::mem::take(&mut self.complete);
        let mut finalized = Vec::with_capacity(complete.len());

        for batch in complete {
            debug_assert_eq!(batch.status, BatchStatus::New);
            if batch.events.is_empty() {
                continue;
            }

            let channel_id = batch.channel_id.clone();
            let stored = self
                .store
                .insert_outgoing_batch(batch.into_new_outgoing())
                .await?;

            counter!(
                SYNC_BATCHES_FINALIZED_TOTAL,
                CHANNEL_ID_LABEL => channel_id.to_string()
            )
            .increment(1);

            debug!(
                node_id = %stored.node_id,
                channel_id = %stored.channel_id,
                batch_id = stored.batch_id,
                event_count = stored.event_count,
                "batch finalized"
            );

            finalized.push(stored);
        }

        Ok(finalized)
    }
}
