use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, SyncError};
use crate::types::EventId;

/// Upper bound of the tail gap, which is always open ended.
pub const OPEN_END_ID: EventId = EventId::MAX;

/// Lifecycle state of a [`DataGap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapStatus {
    /// May still contain unrouted events and is available for scanning.
    Open,
    /// Claimed by a routing pass.
    InUse,
    /// Fully resolved.
    Ok,
    /// Resolved and past the retention horizon.
    Expired,
}

impl GapStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GapStatus::Open => "open",
            GapStatus::InUse => "in_use",
            GapStatus::Ok => "ok",
            GapStatus::Expired => "expired",
        }
    }

    /// Returns `true` when every id of the range has been accounted for.
    pub fn is_resolved(&self) -> bool {
        matches!(self, GapStatus::Ok | GapStatus::Expired)
    }
}

impl fmt::Display for GapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GapStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(GapStatus::Open),
            "in_use" => Ok(GapStatus::InUse),
            "ok" => Ok(GapStatus::Ok),
            "expired" => Ok(GapStatus::Expired),
            other => bail!(
                ErrorKind::DeserializationError,
                "Unknown gap status",
                format!("`{other}` is not a gap status")
            ),
        }
    }
}

/// Inclusive range `[start_id, end_id]` of the event id space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataGap {
    pub start_id: EventId,
    pub end_id: EventId,
    pub status: GapStatus,
    /// When the range was first tracked. Holes split out of a gap keep this time.
    pub created_at: DateTime<Utc>,
    /// Time of the last status change, which is the claim time for `IN_USE` gaps.
    pub last_updated_at: DateTime<Utc>,
    /// Routing pass holding the claim.
    pub claimed_by: Option<String>,
}

impl DataGap {
    pub fn new(start_id: EventId, end_id: EventId, now: DateTime<Utc>) -> Self {
        Self {
            start_id,
            end_id,
            status: GapStatus::Open,
            created_at: now,
            last_updated_at: now,
            claimed_by: None,
        }
    }

    pub fn with_status(mut self, status: GapStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns `true` for the open-ended gap above the highest known id.
    pub fn is_tail(&self) -> bool {
        self.end_id == OPEN_END_ID
    }

    pub fn contains(&self, id: EventId) -> bool {
        self.start_id <= id && id <= self.end_id
    }

    pub fn overlaps(&self, other: &DataGap) -> bool {
        self.start_id <= other.end_id && other.start_id <= self.end_id
    }

    /// Returns `true` when `next` starts right after this gap ends.
    pub fn abuts(&self, next: &DataGap) -> bool {
        self.end_id != OPEN_END_ID && self.end_id + 1 == next.start_id
    }
}

impl fmt::Display for DataGap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_tail() {
            write!(f, "[{}, ∞) {}", self.start_id, self.status)
        } else {
            write!(f, "[{}, {}] {}", self.start_id, self.end_id, self.status)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_width_gap_contains_its_only_id() {
        let gap = DataGap::new(5, 5, Utc::now());

        assert!(gap.contains(5));
        assert!(!gap.contains(4));
        assert!(!gap.contains(6));
    }

    #[test]
    fn tail_never_abuts() {
        let now = Utc::now();
        let tail = DataGap::new(10, OPEN_END_ID, now);
        let before = DataGap::new(3, 9, now);

        assert!(before.abuts(&tail));
        assert!(!tail.abuts(&before));
        assert!(tail.is_tail());
    }

    #[test]
    fn status_round_trips_through_storage_names() {
        for status in [
            GapStatus::Open,
            GapStatus::InUse,
            GapStatus::Ok,
            GapStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<GapStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<GapStatus>().is_err());
    }
}
