use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::NodeCatalog;
use crate::error::SyncResult;
use crate::reservation::{ReservationGuard, ReservationKind, ReservationManager};
use crate::types::NodeId;

/// Outcome of admission reported to a syncing node.
///
/// Each rejection has its own code so clients can back off differently: a busy node retries
/// as is, an unregistered node registers first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Ok,
    Forbidden,
    Busy,
    RegistrationRequired,
}

impl SyncStatus {
    pub fn code(&self) -> u16 {
        match self {
            SyncStatus::Ok => 200,
            SyncStatus::Forbidden => 403,
            SyncStatus::Busy => 503,
            SyncStatus::RegistrationRequired => 657,
        }
    }

    /// Returns `true` when the same request may simply be retried later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncStatus::Busy)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Result of [`SyncGate::admit`].
#[derive(Debug)]
pub enum Admission {
    /// The request may proceed for as long as it holds the guard.
    Admitted(ReservationGuard),
    Rejected(SyncStatus),
}

impl Admission {
    pub fn status(&self) -> SyncStatus {
        match self {
            Admission::Admitted(_) => SyncStatus::Ok,
            Admission::Rejected(status) => *status,
        }
    }
}

/// Admission check run before any batch is streamed to or from a node.
#[derive(Debug, Clone)]
pub struct SyncGate<C> {
    catalog: C,
    reservations: ReservationManager,
}

impl<C> SyncGate<C>
where
    C: NodeCatalog,
{
    pub fn new(catalog: C, reservations: ReservationManager) -> Self {
        Self {
            catalog,
            reservations,
        }
    }

    pub fn reservations(&self) -> &ReservationManager {
        &self.reservations
    }

    /// Checks that `node_id` is registered and allowed to sync, then reserves a slot.
    pub async fn admit(
        &self,
        node_id: &NodeId,
        channel_queue: &str,
        pool_id: &str,
        kind: ReservationKind,
    ) -> SyncResult<Admission> {
        let Some(node) = self.catalog.find_node(node_id).await? else {
            debug!(%node_id, "sync refused, node is not registered");
            return Ok(Admission::Rejected(SyncStatus::RegistrationRequired));
        };

        if !node.sync_enabled {
            debug!(%node_id, "sync refused, node has sync disabled");
            return Ok(Admission::Rejected(SyncStatus::Forbidden));
        }

        match self
            .reservations
            .try_reserve(node_id, channel_queue, pool_id, kind)
        {
            Some(guard) => Ok(Admission::Admitted(guard)),
            None => Ok(Admission::Rejected(SyncStatus::Busy)),
        }
    }
}
