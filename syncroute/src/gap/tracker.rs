use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::metrics::{STATUS_LABEL, SYNC_GAP_STALE_CLAIMS_TOTAL, SYNC_GAPS};
use crate::store::gap::{GapChange, GapStore};
use crate::types::{DataGap, EventId, GapStatus, OPEN_END_ID};

/// Result of scanning one claimed gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapScan {
    /// Ids of the events seen in the range. Events routed to nobody count as seen.
    found_ids: Vec<EventId>,
    /// Every id up to and including this one was scanned.
    scanned_through: EventId,
    interrupted: bool,
}

impl GapScan {
    /// A scan that read every id of the gap up to `scanned_through`.
    ///
    /// For the tail gap `scanned_through` is the high-water id the pass read.
    pub fn completed(found_ids: Vec<EventId>, scanned_through: EventId) -> Self {
        Self {
            found_ids,
            scanned_through,
            interrupted: false,
        }
    }

    /// A scan that stopped at `failed_id`, which must be routed again by a later pass.
    pub fn interrupted_at(found_ids: Vec<EventId>, failed_id: EventId) -> Self {
        Self {
            found_ids,
            scanned_through: failed_id.saturating_sub(1),
            interrupted: true,
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted
    }
}

/// Facts about the pass needed to decide which holes are provably empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseContext {
    pub now: DateTime<Utc>,
    /// When the pass read the high-water id. Every id it scans was assigned before this.
    pub high_water_read_at: DateTime<Utc>,
    /// Set when the capture source proved that no transaction that could still commit one of
    /// the scanned ids is open.
    pub holes_ruled_out: bool,
}

/// Number of tracked gaps per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GapSummary {
    pub open: usize,
    pub in_use: usize,
    pub ok: usize,
    pub expired: usize,
}

impl GapSummary {
    pub fn total(&self) -> usize {
        self.open + self.in_use + self.ok + self.expired
    }
}

fn age(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

/// Ordered view of the gap table with the operations of a routing pass.
///
/// The gaps tile the id space: they never overlap and the last one, the tail, ends at
/// [`OPEN_END_ID`]. Every change is written to the store before the in-memory copy is
/// updated.
#[derive(Debug)]
pub struct GapTracker<S> {
    store: S,
    gaps: BTreeMap<EventId, DataGap>,
    liveness_timeout: Duration,
    stale_gap_timeout: Duration,
}

impl<S> GapTracker<S>
where
    S: GapStore,
{
    /// Creates a tracker. Nothing is loaded until [`GapTracker::load`] or a claim.
    pub fn new(store: S, liveness_timeout: Duration, stale_gap_timeout: Duration) -> Self {
        Self {
            store,
            gaps: BTreeMap::new(),
            liveness_timeout,
            stale_gap_timeout,
        }
    }

    /// Reloads the gap table, repairing overlaps and creating the first gap when it is empty.
    pub async fn load(&mut self, now: DateTime<Utc>) -> SyncResult<()> {
        let mut loaded = self.store.load_data_gaps().await?;
        loaded.sort_by_key(|gap| (gap.start_id, gap.end_id));

        let mut changes = Vec::new();
        let mut kept: Vec<DataGap> = Vec::with_capacity(loaded.len());
        for mut gap in loaded {
            if let Some(previous) = kept.last()
                && gap.start_id <= previous.end_id
            {
                warn!(gap = %gap, previous = %previous, "repairing overlapping gap");
                let previous_end = previous.end_id;

                changes.push(GapChange::Delete {
                    start_id: gap.start_id,
                    end_id: gap.end_id,
                });
                if gap.end_id <= previous_end {
                    continue;
                }

                gap.start_id = previous_end + 1;
                changes.push(GapChange::Upsert(gap.clone()));
            }

            kept.push(gap);
        }

        if kept.is_empty() {
            let first = DataGap::new(0, OPEN_END_ID, now);
            info!(gap = %first, "creating first gap");
            changes.push(GapChange::Upsert(first.clone()));
            kept.push(first);
        }

        if !changes.is_empty() {
            self.store.apply_gap_changes(changes).await?;
        }

        self.gaps = kept.into_iter().map(|gap| (gap.start_id, gap)).collect();

        Ok(())
    }

    /// Claims up to `limit` open gaps below the tail, plus the tail itself when it is open,
    /// for the pass identified by `owner`.
    ///
    /// Claims older than the liveness timeout are returned to `OPEN` first, so ranges of a
    /// crashed pass are picked up again.
    pub async fn claim_next_ranges(
        &mut self,
        limit: usize,
        owner: &str,
        now: DateTime<Utc>,
    ) -> SyncResult<Vec<DataGap>> {
        self.load(now).await?;

        let mut changes = Vec::new();
        for gap in self.gaps.values_mut() {
            if gap.status == GapStatus::InUse
                && age(gap.last_updated_at, now) >= self.liveness_timeout
            {
                warn!(gap = %gap, claimed_by = ?gap.claimed_by, "reopening abandoned gap claim");
                counter!(SYNC_GAP_STALE_CLAIMS_TOTAL).increment(1);

                gap.status = GapStatus::Open;
                gap.claimed_by = None;
                gap.last_updated_at = now;
                changes.push(GapChange::Upsert(gap.clone()));
            }
        }

        let mut claimed = Vec::new();
        let mut claimed_below_tail = 0;
        for gap in self.gaps.values_mut() {
            if gap.status != GapStatus::Open {
                continue;
            }
            if !gap.is_tail() {
                if claimed_below_tail >= limit {
                    continue;
                }
                claimed_below_tail += 1;
            }

            gap.status = GapStatus::InUse;
            gap.claimed_by = Some(owner.to_string());
            gap.last_updated_at = now;
            changes.push(GapChange::Upsert(gap.clone()));
            claimed.push(gap.clone());
        }

        if !changes.is_empty() {
            self.store.apply_gap_changes(changes).await?;
        }

        debug!(owner, claimed = claimed.len(), "claimed gaps");

        Ok(claimed)
    }

    /// Moves the claim time of every gap `owner` holds to `now`, so a long scan is not
    /// taken for an abandoned one. Returns how many claims were refreshed.
    pub async fn refresh_claims(&mut self, owner: &str, now: DateTime<Utc>) -> SyncResult<usize> {
        let refreshed: Vec<DataGap> = self
            .gaps
            .values()
            .filter(|gap| {
                gap.status == GapStatus::InUse && gap.claimed_by.as_deref() == Some(owner)
            })
            .map(|gap| {
                let mut gap = gap.clone();
                gap.last_updated_at = now;
                gap
            })
            .collect();
        if refreshed.is_empty() {
            return Ok(0);
        }

        let changes = refreshed.iter().cloned().map(GapChange::Upsert).collect();
        self.store.apply_gap_changes(changes).await?;

        let count = refreshed.len();
        for gap in refreshed {
            self.gaps.insert(gap.start_id, gap);
        }

        Ok(count)
    }

    /// Records the result of scanning a claimed gap.
    ///
    /// Runs of seen ids become `OK`. Ids without an event stay `OPEN`, keeping the time they
    /// were first tracked, unless they are older than the stale gap timeout or ruled out by
    /// the context. Scanning the tail moves it above the last seen id. When the scan was
    /// interrupted the unscanned remainder stays claimed until the liveness timeout.
    /// Resolved pieces merge with resolved neighbors.
    pub async fn release(
        &mut self,
        claim: &DataGap,
        scan: GapScan,
        context: &ReleaseContext,
    ) -> SyncResult<()> {
        let Some(current) = self.gaps.get(&claim.start_id).cloned() else {
            bail!(
                ErrorKind::InvalidState,
                "Released gap is not tracked",
                format!("gap {claim} is missing from the gap table")
            );
        };
        if current.end_id != claim.end_id
            || current.status != GapStatus::InUse
            || current.claimed_by != claim.claimed_by
        {
            bail!(
                ErrorKind::InvalidState,
                "Released gap is no longer claimed by this pass",
                format!("gap {current} does not match claim {claim}")
            );
        }

        let mut pieces = self.split_scanned(&current, scan, context);
        coalesce_resolved(&mut pieces);

        let mut changes = vec![GapChange::Delete {
            start_id: current.start_id,
            end_id: current.end_id,
        }];
        let mut removed_keys = vec![current.start_id];

        if let Some(first) = pieces.first_mut()
            && first.status == GapStatus::Ok
            && let Some((_, predecessor)) = self.gaps.range(..current.start_id).next_back()
            && predecessor.status == GapStatus::Ok
            && predecessor.abuts(first)
        {
            first.start_id = predecessor.start_id;
            first.created_at = first.created_at.min(predecessor.created_at);
            changes.push(GapChange::Delete {
                start_id: predecessor.start_id,
                end_id: predecessor.end_id,
            });
            removed_keys.push(predecessor.start_id);
        }

        if let Some(last) = pieces.last_mut()
            && last.status == GapStatus::Ok
            && let Some(next_start) = current.end_id.checked_add(1)
            && let Some((_, successor)) = self.gaps.range(next_start..).next()
            && successor.status == GapStatus::Ok
            && last.abuts(successor)
        {
            last.end_id = successor.end_id;
            last.created_at = last.created_at.min(successor.created_at);
            changes.push(GapChange::Delete {
                start_id: successor.start_id,
                end_id: successor.end_id,
            });
            removed_keys.push(successor.start_id);
        }

        changes.extend(pieces.iter().cloned().map(GapChange::Upsert));
        self.store.apply_gap_changes(changes).await?;

        for key in removed_keys {
            self.gaps.remove(&key);
        }
        for piece in &pieces {
            debug!(gap = %piece, status = %piece.status, "gap piece recorded");
        }
        self.gaps
            .extend(pieces.into_iter().map(|piece| (piece.start_id, piece)));

        Ok(())
    }

    /// Splits a claimed gap along the scan result, in id order.
    fn split_scanned(
        &self,
        current: &DataGap,
        scan: GapScan,
        context: &ReleaseContext,
    ) -> Vec<DataGap> {
        let scanned_end = scan.scanned_through.min(current.end_id);
        let mut found: Vec<EventId> = scan
            .found_ids
            .into_iter()
            .filter(|id| current.start_id <= *id && *id <= scanned_end)
            .collect();
        found.sort_unstable();
        found.dedup();

        // Ids in the tail may have been assigned long after the tail was created.
        let hole_created_at = if current.is_tail() {
            context.high_water_read_at
        } else {
            current.created_at
        };

        let mut pieces = Vec::new();
        let mut cursor = Some(current.start_id);
        let mut index = 0;
        while index < found.len() {
            let run_start = found[index];
            let mut run_end = run_start;
            while index + 1 < found.len() && found[index + 1] == run_end + 1 {
                index += 1;
                run_end = found[index];
            }
            index += 1;

            if let Some(next) = cursor
                && next < run_start
            {
                pieces.push(self.hole(next, run_start - 1, hole_created_at, context));
            }

            let mut resolved = DataGap::new(run_start, run_end, hole_created_at)
                .with_status(GapStatus::Ok);
            resolved.last_updated_at = context.now;
            pieces.push(resolved);

            cursor = run_end.checked_add(1);
        }

        let Some(cursor) = cursor else {
            return pieces;
        };

        if scan.interrupted {
            if cursor <= scanned_end {
                pieces.push(self.hole(cursor, scanned_end, hole_created_at, context));
            }
            if let Some(remainder_start) = scanned_end.checked_add(1)
                && remainder_start.max(cursor) <= current.end_id
            {
                let mut remainder = current.clone();
                remainder.start_id = remainder_start.max(cursor);
                pieces.push(remainder);
            }
            return pieces;
        }

        if current.is_tail() {
            let mut tail_start = cursor;
            if context.holes_ruled_out && cursor <= scanned_end {
                pieces.push(self.hole(cursor, scanned_end, hole_created_at, context));
                tail_start = scanned_end + 1;
            }

            let created_at = if tail_start == current.start_id {
                current.created_at
            } else {
                context.high_water_read_at
            };
            let mut tail = DataGap::new(tail_start, OPEN_END_ID, created_at);
            tail.last_updated_at = context.now;
            pieces.push(tail);
            return pieces;
        }

        if cursor <= scanned_end {
            pieces.push(self.hole(cursor, scanned_end, hole_created_at, context));
        }
        if scanned_end < current.end_id {
            let mut unscanned = DataGap::new(scanned_end + 1, current.end_id, current.created_at);
            unscanned.last_updated_at = context.now;
            pieces.push(unscanned);
        }

        pieces
    }

    fn hole(
        &self,
        start_id: EventId,
        end_id: EventId,
        created_at: DateTime<Utc>,
        context: &ReleaseContext,
    ) -> DataGap {
        let mut hole = DataGap::new(start_id, end_id, created_at);
        hole.last_updated_at = context.now;

        if context.holes_ruled_out || age(created_at, context.now) >= self.stale_gap_timeout {
            hole.status = GapStatus::Ok;
        }

        hole
    }

    /// Marks `OK` gaps untouched for `retention` as `EXPIRED`, except the resolved gap with
    /// the highest ids. Returns the number of expired gaps.
    pub async fn expire(&mut self, retention: Duration, now: DateTime<Utc>) -> SyncResult<usize> {
        let newest_resolved = self
            .gaps
            .values()
            .filter(|gap| gap.status == GapStatus::Ok)
            .map(|gap| gap.start_id)
            .max();

        let mut expired = Vec::new();
        for gap in self.gaps.values() {
            if gap.status == GapStatus::Ok
                && Some(gap.start_id) != newest_resolved
                && age(gap.last_updated_at, now) >= retention
            {
                let mut gap = gap.clone().with_status(GapStatus::Expired);
                gap.last_updated_at = now;
                expired.push(gap);
            }
        }

        if expired.is_empty() {
            return Ok(0);
        }

        self.store
            .apply_gap_changes(expired.iter().cloned().map(GapChange::Upsert).collect())
            .await?;

        let count = expired.len();
        for gap in expired {
            self.gaps.insert(gap.start_id, gap);
        }

        debug!(count, "expired resolved gaps");

        Ok(count)
    }

    /// Removes the run of `EXPIRED` gaps at the bottom of the id space. Returns how many were
    /// removed.
    pub async fn purge_expired(&mut self) -> SyncResult<usize> {
        let purged: Vec<(EventId, EventId)> = self
            .gaps
            .values()
            .take_while(|gap| gap.status == GapStatus::Expired)
            .map(|gap| (gap.start_id, gap.end_id))
            .collect();

        if purged.is_empty() {
            return Ok(0);
        }

        self.store
            .apply_gap_changes(
                purged
                    .iter()
                    .map(|(start_id, end_id)| GapChange::Delete {
                        start_id: *start_id,
                        end_id: *end_id,
                    })
                    .collect(),
            )
            .await?;

        for (start_id, _) in &purged {
            self.gaps.remove(start_id);
        }

        Ok(purged.len())
    }

    /// Counts gaps by status and publishes the counts as gauges.
    pub fn summary(&self) -> GapSummary {
        let mut summary = GapSummary::default();
        for gap in self.gaps.values() {
            match gap.status {
                GapStatus::Open => summary.open += 1,
                GapStatus::InUse => summary.in_use += 1,
                GapStatus::Ok => summary.ok += 1,
                GapStatus::Expired => summary.expired += 1,
            }
        }

        for (status, count) in [
            (GapStatus::Open, summary.open),
            (GapStatus::InUse, summary.in_use),
            (GapStatus::Ok, summary.ok),
            (GapStatus::Expired, summary.expired),
        ] {
            gauge!(SYNC_GAPS, STATUS_LABEL => status.as_str()).set(count as f64);
        }

        summary
    }

    /// Returns the first id a later pass may still scan: the start of the lowest `OPEN` or
    /// `IN_USE` gap. Every id below it is resolved or expired.
    pub fn lowest_unresolved_id(&self) -> EventId {
        self.gaps
            .values()
            .find(|gap| matches!(gap.status, GapStatus::Open | GapStatus::InUse))
            .map_or(0, |gap| gap.start_id)
    }

    /// Returns the tracked gaps in id order.
    pub fn gaps(&self) -> impl Iterator<Item = &DataGap> {
        self.gaps.values()
    }
}

/// Merges consecutive resolved pieces. Pieces are contiguous and in id order.
fn coalesce_resolved(pieces: &mut Vec<DataGap>) {
    let mut merged: Vec<DataGap> = Vec::with_capacity(pieces.len());
    for piece in pieces.drain(..) {
        if let Some(previous) = merged.last_mut()
            && previous.status == GapStatus::Ok
            && piece.status == GapStatus::Ok
        {
            previous.end_id = piece.end_id;
            previous.created_at = previous.created_at.min(piece.created_at);
            continue;
        }
        merged.push(piece);
    }
    *pieces = merged;
}
