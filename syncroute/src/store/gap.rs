use std::future::Future;

use crate::error::SyncResult;
use crate::types::{DataGap, EventId};

/// One mutation of the gap table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GapChange {
    /// Inserts the gap or replaces the one with the same bounds.
    Upsert(DataGap),
    Delete { start_id: EventId, end_id: EventId },
}

/// Persistence of the gap table.
///
/// The gap tracker reloads the whole table when a pass claims ranges and keeps its own ordered
/// copy for the rest of the pass, so implementations need no cache.
pub trait GapStore {
    /// Returns every persisted gap ordered by `start_id`.
    fn load_data_gaps(&self) -> impl Future<Output = SyncResult<Vec<DataGap>>> + Send;

    /// Applies all changes atomically, in order.
    fn apply_gap_changes(
        &self,
        changes: Vec<GapChange>,
    ) -> impl Future<Output = SyncResult<()>> + Send;
}
