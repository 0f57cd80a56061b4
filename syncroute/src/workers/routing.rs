use std::time::Duration;

use metrics::counter;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info};

use crate::bail;
use crate::capture::CaptureSource;
use crate::catalog::NodeCatalog;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, SyncResult};
use crate::metrics::{ERROR_KIND_LABEL, SYNC_ROUTING_PASS_FAILURES_TOTAL};
use crate::routing::{PassOutcome, RoutingService};
use crate::store::batch::BatchStore;
use crate::store::gap::GapStore;
use crate::store::lease::LeaseStore;

/// Highest power of two applied to the interval after consecutive failures.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Handle to a running routing worker.
#[derive(Debug)]
pub struct RoutingWorkerHandle {
    join_handle: JoinHandle<SyncResult<()>>,
}

impl RoutingWorkerHandle {
    /// Waits for the worker to stop after shutdown was signalled.
    pub async fn wait(self) -> SyncResult<()> {
        match self.join_handle.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "routing worker task panicked");
                bail!(
                    ErrorKind::RoutingWorkerPanic,
                    "Routing worker panicked",
                    err.to_string()
                );
            }
        }
    }
}

/// Worker running a routing pass every `interval_ms` until shutdown.
///
/// A failed pass is logged and counted. The next attempt is delayed by an exponential,
/// jittered backoff based on the interval.
#[derive(Debug)]
pub struct RoutingWorker<S, C, N> {
    service: RoutingService<S, C, N>,
    shutdown_rx: ShutdownRx,
    consecutive_failures: u32,
}

impl<S, C, N> RoutingWorker<S, C, N>
where
    S: GapStore + BatchStore + LeaseStore + Clone + Send + Sync + 'static,
    C: CaptureSource + Send + Sync + 'static,
    N: NodeCatalog + Send + Sync + 'static,
{
    pub fn new(service: RoutingService<S, C, N>, shutdown_rx: ShutdownRx) -> Self {
        Self {
            service,
            shutdown_rx,
            consecutive_failures: 0,
        }
    }

    pub fn start(self) -> RoutingWorkerHandle {
        let join_handle = tokio::spawn(self.run());
        RoutingWorkerHandle { join_handle }
    }

    async fn run(mut self) -> SyncResult<()> {
        let pass_interval = self.service.config().interval();
        info!(
            node_id = %self.service.config().node_id,
            interval_ms = self.service.config().interval_ms,
            "starting routing worker"
        );

        let mut ticker = interval(pass_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("routing worker shutting down");
                    return Ok(());
                }
            }

            match self.service.run_pass().await {
                Ok(PassOutcome::Completed(summary)) => {
                    self.consecutive_failures = 0;
                    debug!(pass_id = %summary.pass_id, "routing pass completed");
                }
                Ok(PassOutcome::LeaseUnavailable) => {
                    self.consecutive_failures = 0;
                }
                Err(err) => {
                    self.consecutive_failures += 1;

                    counter!(
                        SYNC_ROUTING_PASS_FAILURES_TOTAL,
                        ERROR_KIND_LABEL => format!("{:?}", err.kind())
                    )
                    .increment(1);

                    let backoff = self.backoff(pass_interval);
                    error!(
                        error = %err,
                        consecutive_failures = self.consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "routing pass failed, will retry after backoff"
                    );

                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = self.shutdown_rx.wait_for_shutdown() => {
                            info!("routing worker shutting down during backoff");
                            return Ok(());
                        }
                    }
                    ticker.reset();
                }
            }
        }
    }

    /// Returns the delay before the next attempt, with up to 25% of jitter.
    fn backoff(&self, pass_interval: Duration) -> Duration {
        let exponent = self
            .consecutive_failures
            .saturating_sub(1)
            .min(MAX_BACKOFF_EXPONENT);
        let base = pass_interval.saturating_mul(1 << exponent);

        let max_jitter_ms = (base.as_millis() / 4) as u64;
        let jitter_ms = if max_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=max_jitter_ms)
        } else {
            0
        };

        base + Duration::from_millis(jitter_ms)
    }
}
