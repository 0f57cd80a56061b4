use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Settings of the routing pass and of the gap table it maintains.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RoutingConfig {
    /// Id of the node running the router. Events are never routed to it.
    pub node_id: String,
    /// Delay between two scheduled routing passes.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Maximum number of non-tail gaps claimed by one pass.
    #[serde(default = "default_max_gaps_per_pass")]
    pub max_gaps_per_pass: usize,
    /// Age after which an `IN_USE` claim is considered abandoned and reopened.
    #[serde(default = "default_gap_liveness_timeout_ms")]
    pub gap_liveness_timeout_ms: u64,
    /// Age after which a hole that never received an event is treated as empty.
    #[serde(default = "default_stale_gap_timeout_ms")]
    pub stale_gap_timeout_ms: u64,
    /// Age after which resolved gaps expire.
    #[serde(default = "default_gap_retention_ms")]
    pub gap_retention_ms: u64,
    /// Number of events buffered to regroup interleaved transactions.
    #[serde(default = "default_peek_ahead_window")]
    pub peek_ahead_window: usize,
    /// Expiry of the routing lease. Must outlast a pass.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// Age after which acknowledged batches are purged.
    #[serde(default = "default_batch_retention_ms")]
    pub batch_retention_ms: u64,
    #[serde(default = "default_purge_interval_ms")]
    pub purge_interval_ms: u64,
}

impl RoutingConfig {
    pub const DEFAULT_INTERVAL_MS: u64 = 10_000;

    pub const DEFAULT_MAX_GAPS_PER_PASS: usize = 100;

    pub const DEFAULT_GAP_LIVENESS_TIMEOUT_MS: u64 = 60_000;

    pub const DEFAULT_STALE_GAP_TIMEOUT_MS: u64 = 20 * 60 * 1000;

    pub const DEFAULT_GAP_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

    pub const DEFAULT_PEEK_AHEAD_WINDOW: usize = 1000;

    pub const DEFAULT_LEASE_TTL_MS: u64 = 5 * 60 * 1000;

    pub const DEFAULT_BATCH_RETENTION_MS: u64 = 24 * 60 * 60 * 1000;

    pub const DEFAULT_PURGE_INTERVAL_MS: u64 = 60 * 60 * 1000;

    /// Creates a configuration with default timings for the router identified by `node_id`.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            interval_ms: default_interval_ms(),
            max_gaps_per_pass: default_max_gaps_per_pass(),
            gap_liveness_timeout_ms: default_gap_liveness_timeout_ms(),
            stale_gap_timeout_ms: default_stale_gap_timeout_ms(),
            gap_retention_ms: default_gap_retention_ms(),
            peek_ahead_window: default_peek_ahead_window(),
            lease_ttl_ms: default_lease_ttl_ms(),
            batch_retention_ms: default_batch_retention_ms(),
            purge_interval_ms: default_purge_interval_ms(),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn gap_liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_liveness_timeout_ms)
    }

    pub fn stale_gap_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_gap_timeout_ms)
    }

    pub fn gap_retention(&self) -> Duration {
        Duration::from_millis(self.gap_retention_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    /// How often a running pass renews its lease and gap claims: a third of the shorter of
    /// the lease ttl and the gap liveness timeout.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_ttl().min(self.gap_liveness_timeout()) / 3
    }

    pub fn batch_retention(&self) -> Duration {
        Duration::from_millis(self.batch_retention_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.node_id.trim().is_empty() {
            return Err(ValidationError::invalid("routing.node_id", "must not be empty"));
        }

        let positive = [
            ("routing.interval_ms", self.interval_ms),
            ("routing.gap_liveness_timeout_ms", self.gap_liveness_timeout_ms),
            ("routing.lease_ttl_ms", self.lease_ttl_ms),
            ("routing.purge_interval_ms", self.purge_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ValidationError::invalid(field, "must be greater than 0"));
            }
        }

        if self.max_gaps_per_pass == 0 {
            return Err(ValidationError::invalid(
                "routing.max_gaps_per_pass",
                "must be greater than 0",
            ));
        }

        if self.peek_ahead_window == 0 {
            return Err(ValidationError::invalid(
                "routing.peek_ahead_window",
                "must be greater than 0",
            ));
        }

        if self.lease_ttl_ms <= self.interval_ms {
            return Err(ValidationError::invalid(
                "routing.lease_ttl_ms",
                "must be greater than `routing.interval_ms`",
            ));
        }

        Ok(())
    }
}

fn default_interval_ms() -> u64 {
    RoutingConfig::DEFAULT_INTERVAL_MS
}

fn default_max_gaps_per_pass() -> usize {
    RoutingConfig::DEFAULT_MAX_GAPS_PER_PASS
}

fn default_gap_liveness_timeout_ms() -> u64 {
    RoutingConfig::DEFAULT_GAP_LIVENESS_TIMEOUT_MS
}

fn default_stale_gap_timeout_ms() -> u64 {
    RoutingConfig::DEFAULT_STALE_GAP_TIMEOUT_MS
}

fn default_gap_retention_ms() -> u64 {
    RoutingConfig::DEFAULT_GAP_RETENTION_MS
}

fn default_peek_ahead_window() -> usize {
    RoutingConfig::DEFAULT_PEEK_AHEAD_WINDOW
}

fn default_lease_ttl_ms() -> u64 {
    RoutingConfig::DEFAULT_LEASE_TTL_MS
}

fn default_batch_retention_ms() -> u64 {
    RoutingConfig::DEFAULT_BATCH_RETENTION_MS
}

fn default_purge_interval_ms() -> u64 {
    RoutingConfig::DEFAULT_PURGE_INTERVAL_MS
}
