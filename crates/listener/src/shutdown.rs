//! Worker shutdown coordination
//!
//! The host process owns a [`ShutdownManager`] and calls
//! [`terminate`](ShutdownManager::terminate) when the worker must stop. The
//! listener reacts by pausing its subscriber and aborting every running run
//! with [`WORKER_SHUTDOWN`], then reports back through
//! [`mark_drained`](ShutdownManager::mark_drained).

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Abort reason used for runs given up during shutdown
pub const WORKER_SHUTDOWN: &str = "worker-shutdown";

/// One-shot termination signal plus a drained acknowledgement
#[derive(Debug)]
pub struct ShutdownManager {
    terminate: CancellationToken,
    drained_tx: watch::Sender<bool>,
    drained_rx: watch::Receiver<bool>,
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (drained_tx, drained_rx) = watch::channel(false);
        Self {
            terminate: CancellationToken::new(),
            drained_tx,
            drained_rx,
        }
    }

    /// Signal termination; later calls have no effect
    pub fn terminate(&self) {
        if !self.terminate.is_cancelled() {
            info!("Worker termination requested");
            self.terminate.cancel();
        }
    }

    pub fn is_terminating(&self) -> bool {
        self.terminate.is_cancelled()
    }

    /// Resolves once termination is requested
    pub async fn terminated(&self) {
        self.terminate.cancelled().await
    }

    /// Token firing on termination
    pub fn token(&self) -> CancellationToken {
        self.terminate.clone()
    }

    /// Record that every running task was aborted and cleaned up
    pub fn mark_drained(&self) {
        self.drained_tx.send_replace(true);
    }

    pub fn is_drained(&self) -> bool {
        *self.drained_rx.borrow()
    }

    /// Resolves once the listener has drained
    pub async fn wait_drained(&self) {
        let mut rx = self.drained_rx.clone();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|drained| *drained).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_terminate_is_one_shot() {
        let manager = ShutdownManager::new();
        assert!(!manager.is_terminating());

        manager.terminate();
        manager.terminate();

        assert!(manager.is_terminating());
        manager.terminated().await;
    }

    #[tokio::test]
    async fn test_wait_drained() {
        let manager = Arc::new(ShutdownManager::new());

        let waiter = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.wait_drained().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        manager.mark_drained();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(manager.is_drained());
    }
}
