use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use config::shared::{ReservationConfig, ReservationPoolConfig};
use metrics::{counter, gauge};
use tracing::{debug, warn};

use crate::metrics::{
    POOL_ID_LABEL, RESERVATION_KIND_LABEL, SYNC_RESERVATIONS_ACTIVE,
    SYNC_RESERVATIONS_ADMITTED_TOTAL, SYNC_RESERVATIONS_REJECTED_TOTAL,
};
use crate::types::NodeId;

/// Kind of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReservationKind {
    /// Holds a slot for a whole pull or push.
    Hard,
    /// Liveness check that never takes a slot but is refused once the hard ceilings are
    /// reached.
    Soft,
}

impl ReservationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationKind::Hard => "hard",
            ReservationKind::Soft => "soft",
        }
    }
}

impl fmt::Display for ReservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Held {
    hard: u32,
    soft: u32,
}

#[derive(Debug, Default)]
struct PoolUsage {
    hard: u32,
    per_node: HashMap<NodeId, u32>,
    per_queue: HashMap<(NodeId, String), Held>,
}

#[derive(Debug)]
struct Inner {
    config: ReservationConfig,
    pools: HashMap<String, PoolUsage>,
}

/// Table of reservations held by in-flight delivery requests.
///
/// Shared by every delivery request. Admission and release only touch in-memory counters
/// under one short-lived lock. Cloning shares the same table.
#[derive(Clone)]
pub struct ReservationManager {
    inner: Arc<Mutex<Inner>>,
}

impl ReservationManager {
    pub fn new(config: ReservationConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                config,
                pools: HashMap::new(),
            })),
        }
    }

    /// Tries to admit one delivery attempt of `node_id` on `channel_queue` in `pool_id`.
    ///
    /// A request is admitted only when the pool, the node and, when a limit is configured, the
    /// channel queue all have headroom. Unknown pools admit nothing.
    pub fn reserve(
        &self,
        node_id: &NodeId,
        channel_queue: &str,
        pool_id: &str,
        kind: ReservationKind,
    ) -> bool {
        let mut inner = self.lock();

        let Some(pool_config) = inner.config.pool(pool_id).cloned() else {
            warn!(%pool_id, "reservation requested for an unknown pool");
            record_rejection(pool_id, kind);
            return false;
        };

        let usage = inner.pools.entry(pool_id.to_string()).or_default();
        if is_saturated(usage, &pool_config, node_id, channel_queue) {
            drop(inner);

            debug!(%node_id, %channel_queue, %pool_id, %kind, "reservation rejected");
            record_rejection(pool_id, kind);

            return false;
        }

        let held = usage
            .per_queue
            .entry((node_id.clone(), channel_queue.to_string()))
            .or_default();
        match kind {
            ReservationKind::Hard => {
                held.hard += 1;
                *usage.per_node.entry(node_id.clone()).or_insert(0) += 1;
                usage.hard += 1;
            }
            ReservationKind::Soft => held.soft += 1,
        }
        let active = usage.hard;
        drop(inner);

        counter!(
            SYNC_RESERVATIONS_ADMITTED_TOTAL,
            POOL_ID_LABEL => pool_id.to_string(),
            RESERVATION_KIND_LABEL => kind.as_str()
        )
        .increment(1);
        gauge!(SYNC_RESERVATIONS_ACTIVE, POOL_ID_LABEL => pool_id.to_string()).set(active as f64);

        true
    }

    /// Reserves like [`ReservationManager::reserve`] and returns a guard releasing the
    /// reservation when dropped.
    pub fn try_reserve(
        &self,
        node_id: &NodeId,
        channel_queue: &str,
        pool_id: &str,
        kind: ReservationKind,
    ) -> Option<ReservationGuard> {
        if !self.reserve(node_id, channel_queue, pool_id, kind) {
            return None;
        }

        Some(ReservationGuard {
            manager: self.clone(),
            node_id: node_id.clone(),
            channel_queue: channel_queue.to_string(),
            pool_id: pool_id.to_string(),
            kind,
        })
    }

    /// Returns the number of hard reservations `node_id` holds in `pool_id`.
    pub fn hard_reservations(&self, node_id: &NodeId, pool_id: &str) -> u32 {
        let inner = self.lock();

        inner
            .pools
            .get(pool_id)
            .and_then(|usage| usage.per_node.get(node_id))
            .copied()
            .unwrap_or(0)
    }

    /// Returns the number of hard reservations held in `pool_id` across all nodes.
    pub fn active_reservations(&self, pool_id: &str) -> u32 {
        let inner = self.lock();

        inner.pools.get(pool_id).map(|usage| usage.hard).unwrap_or(0)
    }

    /// Releases one `kind` reservation of `node_id` on `channel_queue` in `pool_id`.
    ///
    /// Releasing a kind that is not held has no effect and never touches reservations of the
    /// other kind.
    pub fn release(
        &self,
        node_id: &NodeId,
        channel_queue: &str,
        pool_id: &str,
        kind: ReservationKind,
    ) {
        let mut inner = self.lock();

        let Some(usage) = inner.pools.get_mut(pool_id) else {
            warn!(%node_id, %channel_queue, %pool_id, "released a reservation that was not held");
            return;
        };

        let key = (node_id.clone(), channel_queue.to_string());
        let Some(held) = usage.per_queue.get_mut(&key) else {
            warn!(%node_id, %channel_queue, %pool_id, "released a reservation that was not held");
            return;
        };

        match kind {
            ReservationKind::Soft if held.soft > 0 => held.soft -= 1,
            ReservationKind::Hard if held.hard > 0 => {
                held.hard -= 1;
                usage.hard = usage.hard.saturating_sub(1);
                if let Some(per_node) = usage.per_node.get_mut(node_id) {
                    *per_node = per_node.saturating_sub(1);
                    if *per_node == 0 {
                        usage.per_node.remove(node_id);
                    }
                }
            }
            _ => {
                warn!(%node_id, %channel_queue, %pool_id, %kind, "released a reservation that was not held");
                return;
            }
        }

        if held.hard == 0 && held.soft == 0 {
            usage.per_queue.remove(&key);
        }
        let active = usage.hard;
        drop(inner);

        gauge!(SYNC_RESERVATIONS_ACTIVE, POOL_ID_LABEL => pool_id.to_string()).set(active as f64);
    }

    /// Locks the table. A panic while holding the lock leaves consistent counters, so a
    /// poisoned lock is recovered.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ReservationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReservationManager").finish_non_exhaustive()
    }
}

fn is_saturated(
    usage: &PoolUsage,
    config: &ReservationPoolConfig,
    node_id: &NodeId,
    channel_queue: &str,
) -> bool {
    if usage.hard >= config.max_connections {
        return true;
    }

    if usage.per_node.get(node_id).copied().unwrap_or(0) >= config.max_per_node {
        return true;
    }

    match config.channel_queue_limits.get(channel_queue) {
        Some(limit) => {
            let held = usage
                .per_queue
                .get(&(node_id.clone(), channel_queue.to_string()))
                .map(|held| held.hard)
                .unwrap_or(0);
            held >= *limit
        }
        None => false,
    }
}

fn record_rejection(pool_id: &str, kind: ReservationKind) {
    counter!(
        SYNC_RESERVATIONS_REJECTED_TOTAL,
        POOL_ID_LABEL => pool_id.to_string(),
        RESERVATION_KIND_LABEL => kind.as_str()
    )
    .increment(1);
}

/// Reservation released when dropped, including on early return and unwinding.
#[derive(Debug)]
pub struct ReservationGuard {
    manager: ReservationManager,
    node_id: NodeId,
    channel_queue: String,
    pool_id: String,
    kind: ReservationKind,
}

impl ReservationGuard {
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn kind(&self) -> ReservationKind {
        self.kind
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        debug!(
            node_id = %self.node_id,
            pool_id = %self.pool_id,
            kind = %self.kind,
            "reservation released"
        );

        self.manager
            .release(&self.node_id, &self.channel_queue, &self.pool_id, self.kind);
    }
}
