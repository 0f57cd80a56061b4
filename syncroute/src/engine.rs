use std::path::Path;

use config::shared::EngineConfig;
use config::{load_config, load_config_from};
use tracing::info;

use crate::capture::CaptureSource;
use crate::catalog::NodeCatalog;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::delivery::DeliveryService;
use crate::error::SyncResult;
use crate::reservation::{ReservationManager, SyncGate};
use crate::router::{ChannelPolicies, PolicyBackends};
use crate::routing::RoutingService;
use crate::store::both::configured::ConfiguredStore;
use crate::workers::purge::PurgeWorker;
use crate::workers::routing::RoutingWorker;
use crate::workers::{PurgeWorkerHandle, RoutingWorkerHandle};

/// A running engine: the routing and purge workers plus the delivery intake serving the
/// batches they produce.
#[derive(Debug)]
pub struct SyncEngine<N> {
    shutdown_tx: ShutdownTx,
    routing: RoutingWorkerHandle,
    purge: PurgeWorkerHandle,
    delivery: DeliveryService<ConfiguredStore, N>,
}

impl<N> SyncEngine<N>
where
    N: NodeCatalog + Clone + Send + Sync + 'static,
{
    /// Validates `config`, connects the configured store and starts the workers.
    pub async fn start<C>(
        config: EngineConfig,
        capture: C,
        catalog: N,
        backends: PolicyBackends,
    ) -> SyncResult<Self>
    where
        C: CaptureSource + Send + Sync + 'static,
    {
        config.validate()?;

        let store = ConfiguredStore::connect(&config.store).await?;
        info!(
            node_id = %config.routing.node_id,
            store = store.kind(),
            channels = config.channels.len(),
            "starting sync engine"
        );

        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

        let service = RoutingService::new(
            config.routing.clone(),
            store.clone(),
            capture,
            catalog.clone(),
            ChannelPolicies::new(config.channels.clone()),
            backends,
        );
        let routing = RoutingWorker::new(service, shutdown_rx.clone()).start();
        let purge = PurgeWorker::new(config.routing, store.clone(), shutdown_rx).start();

        let gate = SyncGate::new(catalog, ReservationManager::new(config.reservation));
        let delivery = DeliveryService::new(store, gate, ChannelPolicies::new(config.channels));

        Ok(Self {
            shutdown_tx,
            routing,
            purge,
            delivery,
        })
    }

    /// Loads [`EngineConfig`] from `configuration/` under the current directory, with
    /// `APP_`-prefixed environment overrides, and starts the engine with it.
    pub async fn start_from_configuration<C>(
        capture: C,
        catalog: N,
        backends: PolicyBackends,
    ) -> SyncResult<Self>
    where
        C: CaptureSource + Send + Sync + 'static,
    {
        let config = load_config::<EngineConfig>()?;
        Self::start(config, capture, catalog, backends).await
    }

    /// Like [`SyncEngine::start_from_configuration`], reading `base_path/configuration`.
    pub async fn start_from_configuration_in<C>(
        base_path: &Path,
        capture: C,
        catalog: N,
        backends: PolicyBackends,
    ) -> SyncResult<Self>
    where
        C: CaptureSource + Send + Sync + 'static,
    {
        let config = load_config_from::<EngineConfig>(base_path)?;
        info!(base_path = %base_path.display(), "loaded engine configuration");
        Self::start(config, capture, catalog, backends).await
    }

    pub fn delivery(&self) -> &DeliveryService<ConfiguredStore, N> {
        &self.delivery
    }

    /// Returns a sender that stops the workers, for signal handlers.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Waits for both workers to stop. The routing worker's error wins when both fail.
    pub async fn wait(self) -> SyncResult<()> {
        let routing = self.routing.wait().await;
        let purge = self.purge.wait().await;

        routing?;
        purge?;

        info!("sync engine stopped");

        Ok(())
    }

    pub async fn shutdown_and_wait(self) -> SyncResult<()> {
        self.shutdown_tx.shutdown();
        self.wait().await
    }
}
