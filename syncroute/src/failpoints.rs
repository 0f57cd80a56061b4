use fail::fail_point;

use crate::error::SyncResult;
#[cfg(feature = "failpoints")]
use crate::{bail, error::ErrorKind};

/// Fires after a pass finalized its batches and before it released its gaps.
pub const ROUTING_PASS__AFTER_BATCHES_FINALIZED: &str = "routing_pass.after_batches_finalized";

/// Fires before a pass streams a claimed range from the capture source.
pub const ROUTING_PASS__BEFORE_RANGE_SCAN: &str = "routing_pass.before_range_scan";

/// Fires after each scanned event of a claimed range.
pub const ROUTING_PASS__AFTER_EVENT_SCANNED: &str = "routing_pass.after_event_scanned";

/// Returns an error when the named failpoint is configured with `return`.
///
/// The optional parameter selects the kind: `no_retry` or `timed_retry`.
#[cfg_attr(not(feature = "failpoints"), allow(unused_variables))]
pub fn sync_fail_point(name: &str) -> SyncResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("timed_retry") => ErrorKind::WithTimedRetry,
            _ => ErrorKind::WithNoRetry,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
