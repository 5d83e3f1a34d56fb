use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::Facility;
use crate::reconciler::{PassOutcome, Reconciler};
use crate::store::TimeslotStore;

const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Periodic trigger. A pass that is still running when cancellation arrives
/// is allowed to finish.
pub async fn run_scheduler(
    reconciler: Arc<Reconciler>,
    facilities: Vec<Facility>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        match reconciler.run_pass(&facilities).await {
            PassOutcome::Skipped => debug!("previous pass still holds the lock"),
            PassOutcome::Ran(summary) if !summary.failures.is_empty() => warn!(
                "pass finished with {} failed facilities",
                summary.failures.len()
            ),
            PassOutcome::Ran(_) => {}
        }
    }
    info!("scheduler stopped");
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<TimeslotStore>, threshold: u64, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends ({} rows)", store.len()),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
