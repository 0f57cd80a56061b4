use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, SyncError};
use crate::types::{BatchId, ChannelId, EventId, EventType, NodeId};

/// Delivery state of an [`OutgoingBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Still being filled by the routing pass.
    New,
    /// Finalized and visible to delivery.
    Queued,
    Sent,
    Acked,
    Error,
    Resend,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::New => "new",
            BatchStatus::Queued => "queued",
            BatchStatus::Sent => "sent",
            BatchStatus::Acked => "acked",
            BatchStatus::Error => "error",
            BatchStatus::Resend => "resend",
        }
    }

    /// Returns `true` when the batch should be handed to the next delivery attempt.
    ///
    /// A `SENT` batch without acknowledgment belongs to a transfer that may have been
    /// abandoned, so it is offered again.
    pub fn is_deliverable(&self) -> bool {
        matches!(
            self,
            BatchStatus::Queued | BatchStatus::Sent | BatchStatus::Error | BatchStatus::Resend
        )
    }

    /// Returns whether delivery may move a batch from `self` to `next`.
    ///
    /// Reporting the current status again is accepted so retried acknowledgments are harmless.
    pub fn can_transition_to(&self, next: BatchStatus) -> bool {
        if *self == next {
            return *self != BatchStatus::New;
        }

        match (self, next) {
            (BatchStatus::New, BatchStatus::Queued) => true,
            (BatchStatus::Queued | BatchStatus::Error | BatchStatus::Resend, BatchStatus::Sent) => {
                true
            }
            (
                BatchStatus::Sent,
                BatchStatus::Acked | BatchStatus::Error | BatchStatus::Resend,
            ) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(BatchStatus::New),
            "queued" => Ok(BatchStatus::Queued),
            "sent" => Ok(BatchStatus::Sent),
            "acked" => Ok(BatchStatus::Acked),
            "error" => Ok(BatchStatus::Error),
            "resend" => Ok(BatchStatus::Resend),
            other => bail!(
                ErrorKind::DeserializationError,
                "Unknown batch status",
                format!("`{other}` is not a batch status")
            ),
        }
    }
}

/// Number of events of each type in a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeCounts {
    pub insert: u32,
    pub update: u32,
    pub delete: u32,
    pub reload: u32,
    pub other: u32,
}

impl EventTypeCounts {
    pub fn record(&mut self, event_type: EventType) {
        let counter = match event_type {
            EventType::Insert => &mut self.insert,
            EventType::Update => &mut self.update,
            EventType::Delete => &mut self.delete,
            EventType::Reload => &mut self.reload,
            EventType::Other => &mut self.other,
        };
        *counter += 1;
    }

    pub fn total(&self) -> u32 {
        self.insert + self.update + self.delete + self.reload + self.other
    }
}

/// A finalized batch as handed to the store, before it has been numbered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutgoingBatch {
    pub node_id: NodeId,
    pub channel_id: ChannelId,
    pub event_ids: Vec<EventId>,
    pub event_counts: EventTypeCounts,
    pub created_at: DateTime<Utc>,
}

/// Unit of delivery to one node on one channel.
///
/// Event ids are kept by the store and fetched with the batch key when a batch is delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingBatch {
    pub batch_id: BatchId,
    pub node_id: NodeId,
    pub channel_id: ChannelId,
    pub status: BatchStatus,
    pub event_count: usize,
    pub event_counts: EventTypeCounts,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_transitions() {
        assert!(BatchStatus::New.can_transition_to(BatchStatus::Queued));
        assert!(BatchStatus::Queued.can_transition_to(BatchStatus::Sent));
        assert!(BatchStatus::Sent.can_transition_to(BatchStatus::Acked));
        assert!(BatchStatus::Sent.can_transition_to(BatchStatus::Resend));
        assert!(BatchStatus::Resend.can_transition_to(BatchStatus::Sent));
        assert!(BatchStatus::Acked.can_transition_to(BatchStatus::Acked));

        assert!(!BatchStatus::Queued.can_transition_to(BatchStatus::Acked));
        assert!(!BatchStatus::Acked.can_transition_to(BatchStatus::Sent));
        assert!(!BatchStatus::New.can_transition_to(BatchStatus::New));
        assert!(!BatchStatus::Sent.can_transition_to(BatchStatus::Queued));
    }

    #[test]
    fn unacknowledged_batches_stay_deliverable() {
        assert!(BatchStatus::Queued.is_deliverable());
        assert!(BatchStatus::Sent.is_deliverable());
        assert!(BatchStatus::Resend.is_deliverable());
        assert!(!BatchStatus::Acked.is_deliverable());
        assert!(!BatchStatus::New.is_deliverable());
    }

    #[test]
    fn counts_by_event_type() {
        let mut counts = EventTypeCounts::default();
        counts.record(EventType::Insert);
        counts.record(EventType::Insert);
        counts.record(EventType::Delete);

        assert_eq!(counts.insert, 2);
        assert_eq!(counts.delete, 1);
        assert_eq!(counts.total(), 3);
    }
}
