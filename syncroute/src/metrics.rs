//! Metric and label names recorded through the `metrics` facade.

pub const CHANNEL_ID_LABEL: &str = "channel_id";

pub const POOL_ID_LABEL: &str = "pool_id";

pub const RESERVATION_KIND_LABEL: &str = "kind";

pub const STATUS_LABEL: &str = "status";

pub const ERROR_KIND_LABEL: &str = "error_kind";

// Routing pass

/// Counter of completed routing passes.
pub const SYNC_ROUTING_PASSES_TOTAL: &str = "sync_routing_passes_total";

/// Counter of routing passes that ended in an error.
pub const SYNC_ROUTING_PASS_FAILURES_TOTAL: &str = "sync_routing_pass_failures_total";

/// Histogram of routing pass duration in seconds.
pub const SYNC_ROUTING_PASS_DURATION_SECONDS: &str = "sync_routing_pass_duration_seconds";

/// Counter of events routed to at least one node.
pub const SYNC_EVENTS_ROUTED_TOTAL: &str = "sync_events_routed_total";

/// Counter of events whose route was empty.
pub const SYNC_EVENTS_UNROUTED_TOTAL: &str = "sync_events_unrouted_total";

/// Counter of channels aborted for the rest of a pass.
pub const SYNC_CHANNEL_FAILURES_TOTAL: &str = "sync_channel_failures_total";

// Batches

/// Counter of finalized batches.
pub const SYNC_BATCHES_FINALIZED_TOTAL: &str = "sync_batches_finalized_total";

/// Counter of batch status transitions reported by delivery.
pub const SYNC_BATCH_TRANSITIONS_TOTAL: &str = "sync_batch_transitions_total";

// Gaps

/// Gauge of tracked gaps by status.
pub const SYNC_GAPS: &str = "sync_gaps";

/// Counter of `IN_USE` claims returned to `OPEN` after the liveness timeout.
pub const SYNC_GAP_STALE_CLAIMS_TOTAL: &str = "sync_gap_stale_claims_total";

// Reservations

/// Counter of admitted reservations.
pub const SYNC_RESERVATIONS_ADMITTED_TOTAL: &str = "sync_reservations_admitted_total";

/// Counter of rejected reservations.
pub const SYNC_RESERVATIONS_REJECTED_TOTAL: &str = "sync_reservations_rejected_total";

/// Gauge of hard reservations currently held per pool.
pub const SYNC_RESERVATIONS_ACTIVE: &str = "sync_reservations_active";
