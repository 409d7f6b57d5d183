use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use xchat_jobs::JobStore;

/// Purge expired terminal jobs every `interval`. Runs forever.
pub async fn run_janitor(jobs: Arc<dyn JobStore>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let purged = jobs.purge_expired().await;
        if purged > 0 {
            tracing::info!(purged, "retention janitor purged jobs");
        }
    }
}
