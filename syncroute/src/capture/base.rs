use std::future::Future;

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;

use crate::error::SyncResult;
use crate::types::{CapturedEvent, EventId};

/// What the capture source can tell about transactions still writing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionVisibility {
    /// The source cannot observe open transactions.
    Unsupported,
    /// No transaction that could still commit events is open.
    NoneOpen,
    /// The oldest open transaction started at the given time.
    OldestStartedAt(DateTime<Utc>),
}

impl TransactionVisibility {
    /// Returns `true` when every transaction started at or before `at` has finished.
    pub fn rules_out_transactions_started_before(&self, at: DateTime<Utc>) -> bool {
        match self {
            TransactionVisibility::Unsupported => false,
            TransactionVisibility::NoneOpen => true,
            TransactionVisibility::OldestStartedAt(started_at) => *started_at > at,
        }
    }
}

/// Ordered log of captured row mutations.
///
/// Ids are strictly increasing but may have holes, either permanently (rolled back
/// transactions, sequence caching) or temporarily (transactions that committed an id later
/// than a higher one).
pub trait CaptureSource {
    /// Streams the events with an id in `[from_id, to_id]` in id order.
    ///
    /// The stream is finite and may be restarted from any id.
    fn stream_events(
        &self,
        from_id: EventId,
        to_id: EventId,
    ) -> BoxStream<'_, SyncResult<CapturedEvent>>;

    /// Returns the highest id assigned so far, or `None` when nothing has been captured.
    fn current_high_water_id(&self) -> impl Future<Output = SyncResult<Option<EventId>>> + Send;

    fn transaction_visibility(
        &self,
    ) -> impl Future<Output = SyncResult<TransactionVisibility>> + Send {
        async { Ok(TransactionVisibility::Unsupported) }
    }
}
