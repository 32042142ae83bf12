//! Approval signals for gated stages
//!
//! Operators acknowledge a named gate (e.g. `PromoteToProduction`); the
//! orchestrator waits on the label without polling or timing out.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Set of recorded approvals, shared between operators and the orchestrator
#[derive(Debug, Clone)]
pub struct Approvals {
    tx: Arc<watch::Sender<BTreeSet<String>>>,
}

impl Approvals {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(BTreeSet::new());
        Self { tx: Arc::new(tx) }
    }

    /// Record an approval. Returns `false` if it was already recorded.
    ///
    /// Approving before the pipeline reaches the gate is allowed; the
    /// approval is held until a run consumes it.
    pub fn approve(&self, label: &str) -> bool {
        let mut inserted = false;
        self.tx.send_modify(|approved| {
            inserted = approved.insert(label.to_string());
        });
        if inserted {
            info!(gate = label, "Approval recorded");
        }
        inserted
    }

    pub fn is_approved(&self, label: &str) -> bool {
        self.tx.borrow().contains(label)
    }

    pub fn pending(&self) -> Vec<String> {
        self.tx.borrow().iter().cloned().collect()
    }

    /// Wait until `label` is approved. Never times out.
    pub async fn wait_for(&self, label: &str) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|approved| approved.contains(label)).await;
    }

    /// Remove an approval once a run has passed its gate, so the next run
    /// needs a fresh one.
    pub(crate) fn consume(&self, label: &str) {
        self.tx.send_modify(|approved| {
            approved.remove(label);
        });
    }
}

impl Default for Approvals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_approve_is_idempotent() {
        let approvals = Approvals::new();
        assert!(approvals.approve("PromoteToProduction"));
        assert!(!approvals.approve("PromoteToProduction"));
        assert!(approvals.is_approved("PromoteToProduction"));
        assert_eq!(approvals.pending(), vec!["PromoteToProduction".to_string()]);
    }

    #[test]
    fn test_consume_clears_approval() {
        let approvals = Approvals::new();
        approvals.approve("PromoteToProduction");
        approvals.consume("PromoteToProduction");
        assert!(!approvals.is_approved("PromoteToProduction"));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_pre_approved() {
        let approvals = Approvals::new();
        approvals.approve("PromoteToProduction");
        tokio::time::timeout(Duration::from_secs(1), approvals.wait_for("PromoteToProduction"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_matching_label() {
        let approvals = Approvals::new();
        let waiter = {
            let approvals = approvals.clone();
            tokio::spawn(async move { approvals.wait_for("PromoteToProduction").await })
        };

        approvals.approve("SomethingElse");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        approvals.approve("PromoteToProduction");
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
