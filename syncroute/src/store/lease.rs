use std::future::Future;
use std::time::Duration;

use crate::error::SyncResult;

/// Persistence of named leases with an owner and an expiry.
pub trait LeaseStore {
    /// Grants the lease to `owner` when it is free, expired or already held by `owner`, and
    /// sets its expiry to now plus `ttl`. Returns whether the lease is held by `owner`.
    fn try_acquire_lease(
        &self,
        name: &str,
        owner: &str,
        ttl: Duration,
    ) -> impl Future<Output = SyncResult<bool>> + Send;

    /// Releases the lease if `owner` holds it. Returns whether it was held.
    fn release_lease(&self, name: &str, owner: &str)
    -> impl Future<Output = SyncResult<bool>> + Send;
}
