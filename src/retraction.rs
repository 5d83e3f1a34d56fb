use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, info, warn};

use crate::channel::NotificationChannel;
use crate::model::RetractionTask;
use crate::observability::{self, RETRACTIONS_PENDING, RETRACTIONS_TOTAL};
use crate::store::StateStore;

/// Sending side of the delayed retraction queue. Cheap to clone.
#[derive(Clone)]
pub struct RetractionQueue {
    tx: mpsc::UnboundedSender<RetractionTask>,
}

/// Owns the worker task; dropping it leaves the worker running.
pub struct RetractionWorker {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetractionOutcome {
    Deleted,
    /// The notification was already gone.
    Absent,
    Failed,
}

impl RetractionOutcome {
    fn label(self) -> &'static str {
        match self {
            RetractionOutcome::Deleted => "deleted",
            RetractionOutcome::Absent => "absent",
            RetractionOutcome::Failed => "failed",
        }
    }
}

impl RetractionQueue {
    /// Spawn the worker that deletes notifications once their task is due.
    pub fn start(channel: Arc<dyn NotificationChannel>) -> (RetractionQueue, RetractionWorker) {
        Self::spawn(channel, None)
    }

    /// Like `start`, and records each completed deletion in `store` so a
    /// restart does not repeat it.
    pub fn start_recording(
        channel: Arc<dyn NotificationChannel>,
        store: Arc<dyn StateStore>,
    ) -> (RetractionQueue, RetractionWorker) {
        Self::spawn(channel, Some(store))
    }

    fn spawn(
        channel: Arc<dyn NotificationChannel>,
        store: Option<Arc<dyn StateStore>>,
    ) -> (RetractionQueue, RetractionWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_worker(channel, store, rx, cancel.clone()));
        (RetractionQueue { tx }, RetractionWorker { cancel, join })
    }

    /// Re-arm deletions left over from a previous run. Returns how many
    /// were queued.
    pub fn resume(&self, tasks: Vec<RetractionTask>) -> usize {
        let count = tasks.into_iter().filter(|t| self.schedule(t.clone())).count();
        if count > 0 {
            info!("resumed {count} pending retractions");
        }
        count
    }

    /// Enqueue a task. Returns false if the worker has stopped.
    pub fn schedule(&self, task: RetractionTask) -> bool {
        debug!(
            "scheduling retraction of {} at {}",
            task.handle, task.not_ready_before
        );
        self.tx.send(task).is_ok()
    }
}

impl RetractionWorker {
    /// Stop the worker. Tasks not yet due are dropped here; rows they
    /// belong to still await retraction in the store.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            warn!("retraction worker ended abnormally: {e}");
        }
    }
}

/// Delete one notification, treating an absent target as done.
pub async fn retract(channel: &dyn NotificationChannel, task: &RetractionTask) -> RetractionOutcome {
    let outcome = match channel.delete(&task.handle).await {
        Ok(()) => {
            info!("retracted notification {}", task.handle);
            RetractionOutcome::Deleted
        }
        Err(e) if e.is_not_found() => {
            debug!("notification {} already gone", task.handle);
            RetractionOutcome::Absent
        }
        Err(e) => {
            warn!("failed to retract notification {}: {e}", task.handle);
            RetractionOutcome::Failed
        }
    };
    metrics::counter!(RETRACTIONS_TOTAL, "outcome" => outcome.label()).increment(1);
    outcome
}

/// Note a finished deletion on the task's row, if it has one.
async fn record(store: &dyn StateStore, task: &RetractionTask) {
    let Some(id) = task.record else {
        return;
    };
    if let Err(e) = store.mark_retracted(id, Utc::now()).await {
        warn!("could not record retraction of {}: {e}", task.handle);
    }
}

async fn run_worker(
    channel: Arc<dyn NotificationChannel>,
    store: Option<Arc<dyn StateStore>>,
    mut rx: mpsc::UnboundedReceiver<RetractionTask>,
    cancel: CancellationToken,
) {
    let mut due: DelayQueue<RetractionTask> = DelayQueue::new();
    let mut accepting = true;

    loop {
        if !accepting && due.is_empty() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            task = rx.recv(), if accepting => match task {
                Some(task) => {
                    let wait = task.remaining(Utc::now());
                    due.insert(task, wait);
                    observability::set_gauge(RETRACTIONS_PENDING, due.len());
                }
                None => accepting = false,
            },
            Some(expired) = due.next(), if !due.is_empty() => {
                let task = expired.into_inner();
                observability::set_gauge(RETRACTIONS_PENDING, due.len());
                let outcome = retract(channel.as_ref(), &task).await;
                if let (Some(store), RetractionOutcome::Deleted | RetractionOutcome::Absent) = (&store, outcome) {
                    record(store.as_ref(), &task).await;
                }
            }
        }
    }

    if !due.is_empty() {
        warn!("retraction worker stopping with {} pending tasks", due.len());
    }
}
