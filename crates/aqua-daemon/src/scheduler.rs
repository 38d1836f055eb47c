// crates/aqua-daemon/src/scheduler.rs
//
// Reconciliation scheduler for the Aqua daemon.
//
// Sweeps every active unit on a fixed interval: units without periods are
// bootstrapped and due periods are closed and rolled. A failed unit is
// retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use aqua_ledger::ReconciliationService;

pub struct ReconcileScheduler {
    reconciler: Arc<ReconciliationService>,
    tick: Duration,
}

impl ReconcileScheduler {
    pub fn new(reconciler: Arc<ReconciliationService>, tick_interval_secs: u64) -> Self {
        Self {
            reconciler,
            tick: Duration::from_secs(tick_interval_secs.max(1)),
        }
    }

    /// Run sweeps until Ctrl-C. The first sweep starts immediately.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        tracing::info!("Reconciliation scheduler started (tick={:?})", self.tick);
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Reconciliation scheduler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }

        Ok(())
    }

    async fn sweep(&self) {
        match self.reconciler.reconcile_all().await {
            Ok(report) => {
                for (unit_id, err) in &report.failed {
                    if err.is_transient() {
                        tracing::warn!("Unit {} will be retried next tick: {}", unit_id, err);
                    } else {
                        tracing::error!("Unit {} needs attention: {}", unit_id, err);
                    }
                }
            }
            Err(e) => tracing::error!("Reconciliation sweep aborted: {}", e),
        }
    }
}
