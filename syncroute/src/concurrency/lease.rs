//! Lease serializing routing passes across processes.
//!
//! At most one routing pass may run at a time because open batches live in the memory of the
//! pass. The lease is a row with an owner and an expiry, so a crashed owner stops blocking
//! others once its lease expires.

use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};
use crate::store::lease::LeaseStore;

/// Name of the lease taken by routing passes.
pub const ROUTING_LEASE_NAME: &str = "routing";

/// Handle on the routing lease for one process.
#[derive(Debug, Clone)]
pub struct RoutingLease<S> {
    store: S,
    owner: String,
    ttl: Duration,
}

impl<S> RoutingLease<S>
where
    S: LeaseStore,
{
    /// Creates a handle whose owner id is unique to this process instance of `node_id`.
    pub fn new(store: S, node_id: &str, ttl: Duration) -> Self {
        Self {
            store,
            owner: format!("{node_id}:{}", Uuid::new_v4()),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Takes the lease, or extends it when already held. Returns `false` when another owner
    /// holds an unexpired lease.
    pub async fn acquire(&self) -> SyncResult<bool> {
        let acquired = self
            .store
            .try_acquire_lease(ROUTING_LEASE_NAME, &self.owner, self.ttl)
            .await?;

        debug!(owner = %self.owner, acquired, "routing lease acquisition attempted");

        Ok(acquired)
    }

    /// Extends a lease this handle holds.
    pub async fn renew(&self) -> SyncResult<()> {
        if !self.acquire().await? {
            bail!(
                ErrorKind::LeaseNotHeld,
                "Routing lease was taken by another owner",
                format!("owner `{}` no longer holds the routing lease", self.owner)
            );
        }

        Ok(())
    }

    pub async fn release(&self) -> SyncResult<()> {
        if !self
            .store
            .release_lease(ROUTING_LEASE_NAME, &self.owner)
            .await?
        {
            warn!(owner = %self.owner, "routing lease was not held at release");
        }

        Ok(())
    }
}
