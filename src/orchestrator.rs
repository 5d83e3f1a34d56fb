use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::channel::{CloseNotice, NotificationChannel, OpenNotice};
use crate::diff::{Diff, DiffEvent};
use crate::error::StoreError;
use crate::model::*;
use crate::observability::{NOTIFICATION_FAILURES_TOTAL, TIMESLOTS_CLOSED_TOTAL, TIMESLOTS_OPENED_TOTAL};
use crate::retraction::RetractionQueue;
use crate::store::{CreateOutcome, StateStore};

/// Default grace period before a stale notification is deleted.
pub const DEFAULT_RETRACT_AFTER: Duration = Duration::from_secs(600);

/// Applies diff events against the channel and the store.
///
/// Channel failures never abort a facility; store failures do.
pub struct Orchestrator {
    store: Arc<dyn StateStore>,
    channel: Arc<dyn NotificationChannel>,
    retractions: RetractionQueue,
    retract_after: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn StateStore>,
        channel: Arc<dyn NotificationChannel>,
        retractions: RetractionQueue,
    ) -> Self {
        Self {
            store,
            channel,
            retractions,
            retract_after: DEFAULT_RETRACT_AFTER,
        }
    }

    pub fn with_retract_after(mut self, retract_after: Duration) -> Self {
        self.retract_after = retract_after;
        self
    }

    /// Apply a facility's diff, closes first. Stops at the first store error.
    pub async fn apply(&self, facility: &Facility, diff: Diff) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport::new(&facility.id);
        for event in diff.into_events() {
            match event {
                DiffEvent::Close(row) => self.close(row, &mut report).await?,
                DiffEvent::Open(slot) => self.open(facility, slot, &mut report).await?,
            }
        }
        Ok(report)
    }

    async fn open(
        &self,
        facility: &Facility,
        slot: CanonicalTimeslot,
        report: &mut ReconcileReport,
    ) -> Result<(), StoreError> {
        let notice = OpenNotice {
            slot: slot.clone(),
            facility_name: facility.name.clone(),
        };
        let handle = match self.channel.post(&notice).await {
            Ok(handle) => handle,
            Err(e) => {
                // Nothing persisted, so the next pass sees it as new again.
                warn!("failed to announce {slot}: {e}");
                metrics::counter!(NOTIFICATION_FAILURES_TOTAL, "op" => "post").increment(1);
                report.failed_opens.push(FailedOpen {
                    slot,
                    reason: e.to_string(),
                });
                return Ok(());
            }
        };

        let now = Utc::now();
        let record = PersistedTimeslot::opened(slot.clone(), facility.name.clone(), handle.clone(), now);
        match self.store.create(record).await {
            Ok(CreateOutcome::Created) => {}
            Ok(CreateOutcome::AlreadyExists(existing)) => {
                warn!("{slot} already tracked as {existing}; retracting duplicate {handle}");
                self.schedule(RetractionTask::after(handle, now, self.retract_after), report);
                return Ok(());
            }
            Err(e) => {
                self.schedule(RetractionTask::after(handle, now, self.retract_after), report);
                return Err(e);
            }
        }

        info!("opened {slot}");
        metrics::counter!(TIMESLOTS_OPENED_TOTAL).increment(1);
        report.opened.push(slot);
        Ok(())
    }

    async fn close(&self, row: PersistedTimeslot, report: &mut ReconcileReport) -> Result<(), StoreError> {
        let now = Utc::now();
        if let Some(handle) = &row.notification {
            let notice = CloseNotice {
                slot: row.slot.clone(),
                facility_name: row.facility_name.clone(),
                available_at: row.available_at,
                unavailable_at: now,
            };
            match self.channel.retract(handle, &notice).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    warn!("failed to mark {handle} closed: {e}");
                    metrics::counter!(NOTIFICATION_FAILURES_TOTAL, "op" => "retract").increment(1);
                }
            }
        }

        let updated = self.store.mark_unavailable(row.id, now).await?;
        self.store.soft_delete(row.id, now).await?;

        if let Some(handle) = row.notification {
            let task = RetractionTask::after(handle, now, self.retract_after).for_record(row.id);
            self.schedule(task, report);
        }

        let available_for = updated.available_for();
        info!(
            "closed {} after {} minutes",
            row.slot,
            available_for.map_or(0, |d| d.num_minutes())
        );
        metrics::counter!(TIMESLOTS_CLOSED_TOTAL).increment(1);
        report.closed.push(row.slot);
        Ok(())
    }

    fn schedule(&self, task: RetractionTask, report: &mut ReconcileReport) {
        if !self.retractions.schedule(task.clone()) {
            warn!("retraction worker stopped; {} will not be deleted", task.handle);
        }
        report.retractions.push(task);
    }
}
