use chrono::{DateTime, Utc};
use config::shared::RoutingConfig;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{error, info};

use crate::bail;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, SyncResult};
use crate::gap::GapTracker;
use crate::store::batch::BatchStore;
use crate::store::gap::GapStore;

/// What one purge run removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub gaps_purged: usize,
    pub batches_purged: u64,
}

#[derive(Debug)]
pub struct PurgeWorkerHandle {
    join_handle: JoinHandle<SyncResult<()>>,
}

impl PurgeWorkerHandle {
    pub async fn wait(self) -> SyncResult<()> {
        match self.join_handle.await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "purge worker task panicked");
                bail!(ErrorKind::PurgeWorkerPanic, "Purge worker panicked", err.to_string());
            }
        }
    }
}

/// Worker deleting expired gaps and acknowledged batches past their retention.
#[derive(Debug)]
pub struct PurgeWorker<S> {
    config: RoutingConfig,
    store: S,
    gaps: GapTracker<S>,
    shutdown_rx: ShutdownRx,
}

impl<S> PurgeWorker<S>
where
    S: GapStore + BatchStore + Clone + Send + Sync + 'static,
{
    pub fn new(config: RoutingConfig, store: S, shutdown_rx: ShutdownRx) -> Self {
        let gaps = GapTracker::new(
            store.clone(),
            config.gap_liveness_timeout(),
            config.stale_gap_timeout(),
        );

        Self {
            config,
            store,
            gaps,
            shutdown_rx,
        }
    }

    pub fn start(self) -> PurgeWorkerHandle {
        let join_handle = tokio::spawn(self.run());
        PurgeWorkerHandle { join_handle }
    }

    /// Purges once, as of `now`.
    pub async fn purge_once(&mut self, now: DateTime<Utc>) -> SyncResult<PurgeSummary> {
        self.gaps.load(now).await?;
        let gaps_purged = self.gaps.purge_expired().await?;

        let older_than = chrono::Duration::from_std(self.config.batch_retention())
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let batches_purged = self
            .store
            .purge_acknowledged_batches(older_than, self.gaps.lowest_unresolved_id())
            .await?;

        Ok(PurgeSummary {
            gaps_purged,
            batches_purged,
        })
    }

    async fn run(mut self) -> SyncResult<()> {
        info!(
            purge_interval_ms = self.config.purge_interval_ms,
            "starting purge worker"
        );

        let mut ticker = interval(self.config.purge_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown_rx.wait_for_shutdown() => {
                    info!("purge worker shutting down");
                    return Ok(());
                }
            }

            match self.purge_once(Utc::now()).await {
                Ok(summary) => info!(
                    gaps_purged = summary.gaps_purged,
                    batches_purged = summary.batches_purged,
                    "purge finished"
                ),
                Err(err) => error!(error = %err, "purge failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::store::both::memory::MemoryStore;
    use crate::store::gap::GapChange;
    use crate::types::{
        BatchStatus, ChannelId, DataGap, EventTypeCounts, GapStatus, NewOutgoingBatch, NodeId,
        OPEN_END_ID,
    };

    #[tokio::test]
    async fn purges_expired_prefix_and_old_acknowledged_batches() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .apply_gap_changes(vec![
                GapChange::Upsert(DataGap::new(0, 9, now).with_status(GapStatus::Expired)),
                GapChange::Upsert(DataGap::new(10, 19, now).with_status(GapStatus::Ok)),
                GapChange::Upsert(DataGap::new(20, OPEN_END_ID, now)),
            ])
            .await
            .unwrap();

        let node_id = NodeId::new("n1");
        // Batch 2 holds an event of the open tail, which a later pass scans again.
        for event_id in [1, 25] {
            let batch = store
                .insert_outgoing_batch(NewOutgoingBatch {
                    node_id: node_id.clone(),
                    channel_id: ChannelId::new("item"),
                    event_ids: vec![event_id],
                    event_counts: EventTypeCounts::default(),
                    created_at: now,
                })
                .await
                .unwrap();
            for status in [BatchStatus::Sent, BatchStatus::Acked] {
                store
                    .update_batch_status(&node_id, batch.batch_id, status)
                    .await
                    .unwrap();
            }
        }

        let mut config = RoutingConfig::new("server");
        config.batch_retention_ms = 0;
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut worker = PurgeWorker::new(config, store.clone(), shutdown_rx);

        let summary = worker
            .purge_once(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        assert_eq!(
            summary,
            PurgeSummary {
                gaps_purged: 1,
                batches_purged: 1
            }
        );
        assert_eq!(store.data_gaps().await.len(), 2);

        let remaining = store.outgoing_batches().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].batch_id, 2);
        assert!(
            store
                .get_routed_targets(20, 30)
                .await
                .unwrap()
                .contains(&(25, node_id))
        );
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let worker = PurgeWorker::new(RoutingConfig::new("server"), MemoryStore::new(), shutdown_rx);

        let handle = worker.start();
        shutdown_tx.shutdown();

        assert!(handle.wait().await.is_ok());
    }
}
