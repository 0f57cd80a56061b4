//! Shutdown signalling between the owner of the workers and the workers themselves.

use tokio::sync::watch;

/// Sender half, held by whoever starts the workers.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<bool>);

impl ShutdownTx {
    /// Signals shutdown to every receiver. Later calls have no further effect.
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        ShutdownRx(self.0.subscribe())
    }
}

/// Receiver half, cloned into each worker.
#[derive(Debug, Clone)]
pub struct ShutdownRx(watch::Receiver<bool>);

impl ShutdownRx {
    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once shutdown was signalled or the sender was dropped.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.0.clone();
        let _ = rx.wait_for(|shutdown| *shutdown).await;
    }
}

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(tx), ShutdownRx(rx))
}
