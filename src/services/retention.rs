use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::store::{JobStore, RetentionPolicy, StoreError};

/// Periodically delete terminal jobs that fall outside the retention policy.
pub struct RetentionSweeper {
    store: Arc<dyn JobStore>,
    policy: RetentionPolicy,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn JobStore>, policy: RetentionPolicy, interval: Duration) -> Self {
        Self {
            store,
            policy,
            interval,
        }
    }

    pub async fn sweep_once(&self) -> Result<u64, StoreError> {
        let removed = self.store.sweep(&self.policy).await?;
        if removed > 0 {
            metrics::counter!("jobs_swept_total").increment(removed);
            tracing::info!(removed, "Retention sweep deleted expired jobs");
        }

        let depth = self.store.queue_depth().await?;
        metrics::gauge!("job_queue_depth").set(depth as f64);
        Ok(removed)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "Retention sweep failed");
                    }
                }
            }
        }

        tracing::info!("Retention sweeper stopped");
    }
}
