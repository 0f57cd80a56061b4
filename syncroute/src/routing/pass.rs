use std::collections::{HashMap, HashSet};
use std::time::Instant;

use chrono::Utc;
use config::shared::{BatchAlgorithm, ChannelPolicyConfig, RoutingConfig};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::batch::{BatchAccumulator, BatchSettings, RoutingDecision};
use crate::capture::CaptureSource;
use crate::catalog::NodeCatalog;
use crate::concurrency::lease::RoutingLease;
use crate::error::{SyncError, SyncResult};
use crate::failpoints::{
    ROUTING_PASS__AFTER_BATCHES_FINALIZED, ROUTING_PASS__AFTER_EVENT_SCANNED,
    ROUTING_PASS__BEFORE_RANGE_SCAN, sync_fail_point,
};
use crate::gap::{GapScan, GapSummary, GapTracker, ReleaseContext};
use crate::metrics::{
    CHANNEL_ID_LABEL, ERROR_KIND_LABEL, SYNC_CHANNEL_FAILURES_TOTAL, SYNC_EVENTS_ROUTED_TOTAL,
    SYNC_EVENTS_UNROUTED_TOTAL, SYNC_ROUTING_PASS_DURATION_SECONDS, SYNC_ROUTING_PASSES_TOTAL,
};
use crate::router::{ChannelPolicies, PolicyBackends, RouterEngine};
use crate::routing::RegroupingReader;
use crate::store::batch::BatchStore;
use crate::store::gap::GapStore;
use crate::store::lease::LeaseStore;
use crate::types::{CapturedEvent, ChannelId, DataGap, EventId, EventType, NodeId};

/// What a routing pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSummary {
    pub pass_id: Uuid,
    pub high_water_id: Option<EventId>,
    pub gaps_claimed: usize,
    pub events_scanned: usize,
    /// Events sent to at least one node.
    pub events_routed: usize,
    /// Events intentionally sent to nobody, including skipped event types and disabled
    /// channels.
    pub events_unrouted: usize,
    /// Events left for a later pass because their channel failed or hit its routing cap.
    pub events_deferred: usize,
    /// Targets skipped because a stored batch already holds the event for that node.
    pub targets_already_batched: usize,
    pub batches_finalized: usize,
    pub failed_channels: Vec<ChannelId>,
    pub gaps_expired: usize,
    pub gaps: GapSummary,
}

/// Result of [`RoutingService::run_pass`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    Completed(PassSummary),
    /// Another process holds the routing lease.
    LeaseUnavailable,
}

enum EventOutcome {
    Routed,
    Unrouted,
    /// Must be read again by a later pass, together with every event from `from_id` on.
    Deferred { from_id: EventId },
}

/// Mutable state of a single pass.
struct PassState<S> {
    /// Claim owner of this pass.
    owner: String,
    last_heartbeat: Instant,
    /// First id of the gap being scanned.
    scan_start: EventId,
    accumulator: BatchAccumulator<S>,
    /// Channels whose remaining events this pass leaves alone.
    deferred_channels: HashSet<ChannelId>,
    failed_channels: Vec<ChannelId>,
    /// Events handled per channel for `max_data_to_route`.
    handled_per_channel: HashMap<ChannelId, usize>,
    last_transaction_ids: HashMap<ChannelId, Option<String>>,
    summary: PassSummary,
}

/// Runs routing passes for one router node.
///
/// At most one pass runs at a time across processes, serialized by the routing lease.
#[derive(Debug)]
pub struct RoutingService<S, C, N> {
    config: RoutingConfig,
    store: S,
    capture: C,
    catalog: N,
    policies: ChannelPolicies,
    router: RouterEngine,
    lease: RoutingLease<S>,
    gaps: GapTracker<S>,
}

impl<S, C, N> RoutingService<S, C, N>
where
    S: GapStore + BatchStore + LeaseStore + Clone + Send + Sync,
    C: CaptureSource + Send + Sync,
    N: NodeCatalog + Send + Sync,
{
    pub fn new(
        config: RoutingConfig,
        store: S,
        capture: C,
        catalog: N,
        policies: ChannelPolicies,
        backends: PolicyBackends,
    ) -> Self {
        let router = RouterEngine::new(NodeId::new(config.node_id.clone()), backends);
        let lease = RoutingLease::new(store.clone(), &config.node_id, config.lease_ttl());
        let gaps = GapTracker::new(
            store.clone(),
            config.gap_liveness_timeout(),
            config.stale_gap_timeout(),
        );

        Self {
            config,
            store,
            capture,
            catalog,
            policies,
            router,
            lease,
            gaps,
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    /// Returns the gap tracker as left by the last pass.
    pub fn gap_tracker(&self) -> &GapTracker<S> {
        &self.gaps
    }

    pub fn gap_tracker_mut(&mut self) -> &mut GapTracker<S> {
        &mut self.gaps
    }

    /// Runs one routing pass when the routing lease is free.
    ///
    /// Gaps are released only after every batch of the pass is stored, so a pass that fails
    /// midway leaves its claims `IN_USE` and a later pass routes the ranges again once the
    /// claims time out.
    pub async fn run_pass(&mut self) -> SyncResult<PassOutcome> {
        if !self.lease.acquire().await? {
            info!(owner = %self.lease.owner(), "routing lease is held elsewhere, skipping pass");
            return Ok(PassOutcome::LeaseUnavailable);
        }

        let pass_id = Uuid::new_v4();
        let started = Instant::now();
        info!(%pass_id, "starting routing pass");

        let result = self.route_claimed_gaps(pass_id).await;
        let released = self.lease.release().await;

        let summary = result?;
        released?;

        counter!(SYNC_ROUTING_PASSES_TOTAL).increment(1);
        histogram!(SYNC_ROUTING_PASS_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        info!(
            %pass_id,
            gaps_claimed = summary.gaps_claimed,
            events_scanned = summary.events_scanned,
            events_routed = summary.events_routed,
            batches_finalized = summary.batches_finalized,
            failed_channels = summary.failed_channels.len(),
            "routing pass finished"
        );

        Ok(PassOutcome::Completed(summary))
    }

    async fn route_claimed_gaps(&mut self, pass_id: Uuid) -> SyncResult<PassSummary> {
        let high_water_id = self.capture.current_high_water_id().await?;
        // Every id up to the high-water id was assigned before this instant.
        let high_water_read_at = Utc::now();
        let visibility = self.capture.transaction_visibility().await?;
        let holes_ruled_out = visibility.rules_out_transactions_started_before(high_water_read_at);

        let owner = pass_id.to_string();
        let claims = self
            .gaps
            .claim_next_ranges(self.config.max_gaps_per_pass, &owner, Utc::now())
            .await?;

        let mut state = PassState {
            owner,
            last_heartbeat: Instant::now(),
            scan_start: 0,
            accumulator: BatchAccumulator::new(self.store.clone()),
            deferred_channels: HashSet::new(),
            failed_channels: Vec::new(),
            handled_per_channel: HashMap::new(),
            last_transaction_ids: HashMap::new(),
            summary: PassSummary {
                pass_id,
                high_water_id,
                gaps_claimed: claims.len(),
                events_scanned: 0,
                events_routed: 0,
                events_unrouted: 0,
                events_deferred: 0,
                targets_already_batched: 0,
                batches_finalized: 0,
                failed_channels: Vec::new(),
                gaps_expired: 0,
                gaps: GapSummary::default(),
            },
        };

        let mut scans = Vec::with_capacity(claims.len());
        for claim in claims {
            self.lease.renew().await?;
            state.last_heartbeat = Instant::now();
            let scan = self.scan_gap(&claim, high_water_id, &mut state).await?;
            scans.push((claim, scan));
        }

        let finalized = state.accumulator.finalize_open().await?;
        state.summary.batches_finalized += finalized.len();

        sync_fail_point(ROUTING_PASS__AFTER_BATCHES_FINALIZED)?;

        let context = ReleaseContext {
            now: Utc::now(),
            high_water_read_at,
            holes_ruled_out,
        };
        for (claim, scan) in scans {
            self.gaps.release(&claim, scan, &context).await?;
        }

        let mut summary = state.summary;
        summary.failed_channels = state.failed_channels;
        summary.gaps_expired = self
            .gaps
            .expire(self.config.gap_retention(), Utc::now())
            .await?;
        summary.gaps = self.gaps.summary();

        Ok(summary)
    }

    /// Routes the events of one claimed gap up to the high-water id.
    ///
    /// A long scan renews the routing lease and the pass's gap claims every heartbeat
    /// interval. Losing the lease fails the pass before anything else is stored.
    async fn scan_gap(
        &mut self,
        claim: &DataGap,
        high_water_id: Option<EventId>,
        state: &mut PassState<S>,
    ) -> SyncResult<GapScan> {
        let scan_end = match high_water_id {
            Some(high_water_id) => claim.end_id.min(high_water_id),
            None => claim.start_id.saturating_sub(1),
        };
        if scan_end < claim.start_id {
            return Ok(GapScan::completed(Vec::new(), scan_end));
        }

        sync_fail_point(ROUTING_PASS__BEFORE_RANGE_SCAN)?;
        debug!(start_id = claim.start_id, end_id = scan_end, "scanning gap");
        state.scan_start = claim.start_id;

        let already_batched = self
            .store
            .get_routed_targets(claim.start_id, scan_end)
            .await?;

        let mut reader = RegroupingReader::new(
            self.capture.stream_events(claim.start_id, scan_end),
            self.config.peek_ahead_window,
        );
        let mut found_ids = Vec::new();
        let mut first_deferred_id: Option<EventId> = None;

        while let Some(event) = reader.next_event().await? {
            state.summary.events_scanned += 1;

            match self.route_event(&event, &already_batched, state).await? {
                EventOutcome::Routed => {
                    state.summary.events_routed += 1;
                    found_ids.push(event.id);
                }
                EventOutcome::Unrouted => {
                    state.summary.events_unrouted += 1;
                    found_ids.push(event.id);
                }
                EventOutcome::Deferred { from_id } => {
                    state.summary.events_deferred += 1;
                    first_deferred_id =
                        Some(first_deferred_id.map_or(from_id, |id| id.min(from_id)));
                }
            }

            let flushed = state.accumulator.flush_if_due().await?;
            state.summary.batches_finalized += flushed.len();

            sync_fail_point(ROUTING_PASS__AFTER_EVENT_SCANNED)?;

            if state.last_heartbeat.elapsed() >= self.config.heartbeat_interval() {
                self.lease.renew().await?;
                let refreshed = self.gaps.refresh_claims(&state.owner, Utc::now()).await?;
                debug!(owner = %state.owner, refreshed, "renewed routing lease and gap claims");
                state.last_heartbeat = Instant::now();
            }
        }

        Ok(match first_deferred_id {
            Some(deferred_id) => GapScan::interrupted_at(found_ids, deferred_id),
            None => GapScan::completed(found_ids, scan_end),
        })
    }

    async fn route_event(
        &self,
        event: &CapturedEvent,
        already_batched: &HashSet<(EventId, NodeId)>,
        state: &mut PassState<S>,
    ) -> SyncResult<EventOutcome> {
        let channel_id = &event.channel_id;
        let deferred = EventOutcome::Deferred { from_id: event.id };
        if state.deferred_channels.contains(channel_id) {
            return Ok(deferred);
        }

        let policy = match self.policies.get(channel_id) {
            Ok(policy) => policy,
            Err(err) => {
                fail_channel(state, channel_id, &err);
                return Ok(deferred);
            }
        };
        let config = policy.config();

        if !config.enabled || !syncs_event_type(config, event.event_type) {
            return Ok(EventOutcome::Unrouted);
        }

        if reached_routing_cap(config, event, state) {
            debug!(channel_id = %channel_id, "channel reached its routing cap for this pass");
            state.deferred_channels.insert(channel_id.clone());
            return Ok(deferred);
        }

        let targets = match self.router.route(event, &policy, &self.catalog).await {
            Ok(targets) => targets,
            Err(err) if err.kind().is_configuration() || err.kind().is_policy_evaluation() => {
                fail_channel(state, channel_id, &err);
                return Ok(withdraw_open_transaction(config, event, state));
            }
            Err(err) => return Err(err),
        };

        *state
            .handled_per_channel
            .entry(channel_id.clone())
            .or_insert(0) += 1;
        state
            .last_transaction_ids
            .insert(channel_id.clone(), event.transaction_id.clone());

        if targets.is_empty() {
            counter!(SYNC_EVENTS_UNROUTED_TOTAL, CHANNEL_ID_LABEL => channel_id.to_string())
                .increment(1);
            return Ok(EventOutcome::Unrouted);
        }

        let settings = BatchSettings::from(config);
        for node_id in targets {
            if already_batched.contains(&(event.id, node_id.clone())) {
                state.summary.targets_already_batched += 1;
                continue;
            }

            state.accumulator.accumulate(
                RoutingDecision {
                    event_id: event.id,
                    node_id,
                    channel_id: channel_id.clone(),
                    event_type: event.event_type,
                    transaction_id: event.transaction_id.clone(),
                },
                settings,
            );
        }

        counter!(SYNC_EVENTS_ROUTED_TOTAL, CHANNEL_ID_LABEL => channel_id.to_string())
            .increment(1);

        Ok(EventOutcome::Routed)
    }
}

fn syncs_event_type(config: &ChannelPolicyConfig, event_type: EventType) -> bool {
    match event_type {
        EventType::Insert => config.sync_on_insert,
        EventType::Update => config.sync_on_update,
        EventType::Delete => config.sync_on_delete,
        EventType::Reload | EventType::Other => true,
    }
}

/// Returns `true` once a channel handled `max_data_to_route` events in this pass.
///
/// A transactional channel still takes the rest of the transaction it is in.
fn reached_routing_cap<S>(
    config: &ChannelPolicyConfig,
    event: &CapturedEvent,
    state: &PassState<S>,
) -> bool {
    let Some(max_data_to_route) = config.max_data_to_route else {
        return false;
    };

    let handled = state
        .handled_per_channel
        .get(&event.channel_id)
        .copied()
        .unwrap_or(0);
    if handled < max_data_to_route {
        return false;
    }

    if config.batch_algorithm != BatchAlgorithm::Transactional {
        return true;
    }

    match (
        state.last_transaction_ids.get(&event.channel_id),
        &event.transaction_id,
    ) {
        (Some(Some(last)), Some(current)) => last != current,
        _ => true,
    }
}

/// Takes back the part of the failed event's transaction a transactional channel already
/// batched in this gap, so a later pass routes the whole transaction again.
fn withdraw_open_transaction<S>(
    config: &ChannelPolicyConfig,
    event: &CapturedEvent,
    state: &mut PassState<S>,
) -> EventOutcome
where
    S: BatchStore,
{
    let (BatchAlgorithm::Transactional, Some(transaction_id)) =
        (config.batch_algorithm, event.transaction_id.as_deref())
    else {
        return EventOutcome::Deferred { from_id: event.id };
    };

    let withdrawn =
        state
            .accumulator
            .withdraw_transaction(&event.channel_id, transaction_id, state.scan_start);
    state.summary.events_routed = state.summary.events_routed.saturating_sub(withdrawn.len());
    state.summary.events_deferred += withdrawn.len();

    let from_id = withdrawn.first().map_or(event.id, |first| (*first).min(event.id));
    EventOutcome::Deferred { from_id }
}

fn fail_channel<S>(state: &mut PassState<S>, channel_id: &ChannelId, err: &SyncError) {
    warn!(
        channel_id = %channel_id,
        error = %err,
        "channel failed, its remaining events are left for a later pass"
    );
    counter!(
        SYNC_CHANNEL_FAILURES_TOTAL,
        CHANNEL_ID_LABEL => channel_id.to_string(),
        ERROR_KIND_LABEL => format!("{:?}", err.kind())
    )
    .increment(1);

    state.deferred_channels.insert(channel_id.clone());
    state.failed_channels.push(channel_id.clone());
}
