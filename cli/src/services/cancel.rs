//! Cooperative cancellation for pipeline runs

use std::sync::Arc;
use tokio::sync::watch;

/// Shared cancellation flag.
///
/// Checked at action boundaries only, so an in-flight backend call always
/// completes before the stage is marked failed.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Completes once cancellation has been requested
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    pub(crate) fn reset(&self) {
        self.tx.send_replace(false);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}
