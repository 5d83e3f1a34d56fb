use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, error, info};

use crate::diff::diff;
use crate::error::ReconcileError;
use crate::extract::{ExtractOptions, extract_timeslots};
use crate::lock::ExecutionLock;
use crate::model::*;
use crate::observability::{FACILITY_FAILURES_TOTAL, PASS_DURATION_SECONDS, PASSES_TOTAL};
use crate::orchestrator::Orchestrator;
use crate::source::AvailabilitySource;
use crate::store::StateStore;

/// Resource key guarding the whole reconciliation job.
pub const PASS_LOCK_KEY: &str = "courtwatch:reconcile";

pub const DEFAULT_LEASE: Duration = Duration::from_secs(600);

/// Result of one locked pass over every facility.
#[derive(Debug)]
pub enum PassOutcome {
    /// Another pass held the lock.
    Skipped,
    Ran(PassSummary),
}

#[derive(Debug, Default)]
pub struct PassSummary {
    pub reports: Vec<ReconcileReport>,
    pub failures: Vec<(String, ReconcileError)>,
    /// False when a failure left the lease to expire on its own.
    pub lock_released: bool,
}

impl PassSummary {
    pub fn opened(&self) -> usize {
        self.reports.iter().map(|r| r.opened.len()).sum()
    }

    pub fn closed(&self) -> usize {
        self.reports.iter().map(|r| r.closed.len()).sum()
    }
}

/// fetch → extract → diff → apply, per facility.
pub struct Reconciler {
    source: Arc<dyn AvailabilitySource>,
    store: Arc<dyn StateStore>,
    orchestrator: Orchestrator,
    lock: ExecutionLock,
    options: ExtractOptions,
    lease: Duration,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn AvailabilitySource>,
        store: Arc<dyn StateStore>,
        orchestrator: Orchestrator,
        lock: ExecutionLock,
    ) -> Self {
        Self {
            source,
            store,
            orchestrator,
            lock,
            options: ExtractOptions::default(),
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_options(mut self, options: ExtractOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Reconcile one facility. Running it twice without upstream change is a no-op.
    pub async fn reconcile(&self, facility: &Facility) -> Result<ReconcileReport, ReconcileError> {
        let feed = self.source.fetch_facility(facility).await?;
        let canonical = extract_timeslots(&feed, &self.options);
        let persisted = self.store.find_active(&facility.id).await?;
        let changes = diff(&canonical, persisted);
        debug!(
            "{}: {} available, {} changes",
            facility.display_name(),
            canonical.len(),
            changes.len()
        );
        if changes.is_empty() {
            return Ok(ReconcileReport::new(&facility.id));
        }
        Ok(self.orchestrator.apply(facility, changes).await?)
    }

    /// Reconcile facilities concurrently. Results keep the input order.
    pub async fn reconcile_all(
        &self,
        facilities: &[Facility],
    ) -> Vec<(String, Result<ReconcileReport, ReconcileError>)> {
        let results = join_all(facilities.iter().map(|f| self.reconcile(f))).await;
        facilities
            .iter()
            .map(|f| f.id.clone())
            .zip(results)
            .collect()
    }

    /// One locked pass. The lock is released only if every facility succeeded.
    pub async fn run_pass(&self, facilities: &[Facility]) -> PassOutcome {
        let Some(lease) = self.lock.acquire(PASS_LOCK_KEY, self.lease).await else {
            debug!("reconciliation already running, skipping pass");
            metrics::counter!(PASSES_TOTAL, "outcome" => "skipped").increment(1);
            return PassOutcome::Skipped;
        };

        let start = Instant::now();
        let mut summary = PassSummary::default();
        for (facility_id, result) in self.reconcile_all(facilities).await {
            match result {
                Ok(report) => {
                    if !report.is_noop() {
                        info!(
                            "{facility_id}: {} opened, {} closed, {} failed to announce",
                            report.opened.len(),
                            report.closed.len(),
                            report.failed_opens.len()
                        );
                    }
                    summary.reports.push(report);
                }
                Err(e) => {
                    error!("{facility_id}: reconciliation failed: {e}");
                    metrics::counter!(FACILITY_FAILURES_TOTAL, "kind" => e.kind_label()).increment(1);
                    summary.failures.push((facility_id, e));
                }
            }
        }
        metrics::histogram!(PASS_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

        if summary.failures.is_empty() {
            self.lock.release(lease).await;
            summary.lock_released = true;
            metrics::counter!(PASSES_TOTAL, "outcome" => "completed").increment(1);
        } else {
            debug!("holding lease {} until it expires", lease.token);
            metrics::counter!(PASSES_TOTAL, "outcome" => "failed").increment(1);
        }
        PassOutcome::Ran(summary)
    }
}
