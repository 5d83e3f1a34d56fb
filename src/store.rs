use std::io;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};
use ulid::Ulid;

use crate::error::StoreError;
use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// An active row already holds this key; nothing was written.
    AlreadyExists(Ulid),
}

/// Keyed persistence for timeslot records.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// All non-deleted rows for a facility, in key order.
    async fn find_active(&self, facility_id: &str) -> Result<Vec<PersistedTimeslot>, StoreError>;

    /// Insert unless an active row already holds the same key.
    async fn create(&self, record: PersistedTimeslot) -> Result<CreateOutcome, StoreError>;

    async fn mark_unavailable(
        &self,
        id: Ulid,
        at: DateTime<Utc>,
    ) -> Result<PersistedTimeslot, StoreError>;

    async fn soft_delete(&self, id: Ulid, at: DateTime<Utc>) -> Result<(), StoreError>;

    /// Record that the row's notification is gone from the channel.
    async fn mark_retracted(&self, id: Ulid, at: DateTime<Utc>) -> Result<(), StoreError>;
}

// ── WAL writer task ──────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, String>>;

enum WalRequest {
    Append(StoreEvent, Reply<()>),
    Rewrite(Vec<StoreEvent>, Reply<()>),
    Appends(oneshot::Sender<u64>),
}

/// Owns the log. Appends that queue up while a commit is in flight are
/// committed together with a single fsync.
struct WalWriter {
    wal: Wal,
    rx: mpsc::Receiver<WalRequest>,
}

impl WalWriter {
    async fn run(mut self) {
        while let Some(request) = self.rx.recv().await {
            let mut next = Some(request);
            while let Some(request) = next.take() {
                next = match request {
                    WalRequest::Append(event, reply) => self.commit_group(event, reply),
                    WalRequest::Rewrite(events, reply) => {
                        let _ = reply.send(self.wal.rewrite(&events).map_err(|e| e.to_string()));
                        None
                    }
                    WalRequest::Appends(reply) => {
                        let _ = reply.send(self.wal.appends_since_compact());
                        None
                    }
                };
            }
        }
    }

    /// Stage `first` plus every append already queued, commit once, and
    /// answer each caller. Returns the non-append request that ended the
    /// group, if any.
    fn commit_group(&mut self, first: StoreEvent, reply: Reply<()>) -> Option<WalRequest> {
        let mut group = vec![(reply, self.wal.stage(&first).err())];
        let mut leftover = None;
        while let Ok(request) = self.rx.try_recv() {
            match request {
                WalRequest::Append(event, reply) => group.push((reply, self.wal.stage(&event).err())),
                other => {
                    leftover = Some(other);
                    break;
                }
            }
        }

        metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(group.len() as f64);
        let started = Instant::now();
        let committed = self.wal.commit().map_err(|e| e.to_string());
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        if let Err(e) = &committed {
            error!("WAL commit of {} events failed: {e}", group.len());
        }

        for (reply, stage_err) in group {
            let result = match stage_err {
                Some(e) => Err(e.to_string()),
                None => committed.clone(),
            };
            let _ = reply.send(result);
        }
        leftover
    }
}

/// Send a request to the writer and wait for its answer.
async fn ask<T>(
    wal_tx: &mpsc::Sender<WalRequest>,
    request: impl FnOnce(Reply<T>) -> WalRequest,
) -> Result<T, StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(request(tx))
        .await
        .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
        .map_err(StoreError::Wal)
}

// ── Timeslot store ───────────────────────────────────────

/// DashMap-backed timeslot store, optionally made durable by a WAL.
///
/// `rows` holds every record ever created (soft-deleted included);
/// `active` maps each live key to its row id and is the per-key guard for
/// conditional creates.
pub struct TimeslotStore {
    rows: DashMap<Ulid, PersistedTimeslot>,
    active: DashMap<CanonicalTimeslot, Ulid>,
    wal_tx: Option<mpsc::Sender<WalRequest>>,
}

impl Default for TimeslotStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl TimeslotStore {
    /// Volatile store; state is lost on restart.
    pub fn in_memory() -> Self {
        Self {
            rows: DashMap::new(),
            active: DashMap::new(),
            wal_tx: None,
        }
    }

    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::open(&wal_path)?;
        let (wal_tx, rx) = mpsc::channel(4096);
        tokio::spawn(WalWriter { wal, rx }.run());

        let store = Self {
            rows: DashMap::new(),
            active: DashMap::new(),
            wal_tx: Some(wal_tx),
        };
        for event in &events {
            store.apply(event);
        }
        debug!(
            "replayed {} store events ({} rows)",
            events.len(),
            store.rows.len()
        );
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<PersistedTimeslot> {
        self.rows.get(id).map(|r| r.value().clone())
    }

    /// Every row, soft-deleted included, in key order.
    pub fn all(&self) -> Vec<PersistedTimeslot> {
        let mut rows: Vec<_> = self.rows.iter().map(|r| r.value().clone()).collect();
        rows.sort_by(|a, b| a.slot.cmp(&b.slot).then(a.id.cmp(&b.id)));
        rows
    }

    fn apply(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Created { record } => {
                if record.is_active() {
                    self.active.insert(record.slot.clone(), record.id);
                }
                self.rows.insert(record.id, record.clone());
            }
            StoreEvent::MarkedUnavailable { id, at } => {
                if let Some(mut row) = self.rows.get_mut(id) {
                    row.available = false;
                    row.unavailable_at = Some(*at);
                }
            }
            StoreEvent::SoftDeleted { id, at } => {
                if let Some(mut row) = self.rows.get_mut(id) {
                    row.deleted_at = Some(*at);
                    self.active.remove_if(&row.slot, |_, active_id| active_id == id);
                }
            }
            StoreEvent::Retracted { id, at } => {
                if let Some(mut row) = self.rows.get_mut(id) {
                    row.retracted_at = Some(*at);
                }
            }
        }
    }

    /// Deletions still owed for closed rows, each due `retract_after` after
    /// its row closed. Used to re-arm the retraction queue on startup.
    pub fn pending_retractions(&self, retract_after: Duration) -> Vec<RetractionTask> {
        let mut tasks: Vec<RetractionTask> = self
            .rows
            .iter()
            .filter(|r| r.awaits_retraction())
            .filter_map(|r| RetractionTask::for_closed(r.value(), retract_after))
            .collect();
        tasks.sort_by_key(|t| t.not_ready_before);
        tasks
    }

    /// Commit `event` to the WAL. No-op in memory.
    async fn wal_append(&self, event: &StoreEvent) -> Result<(), StoreError> {
        match &self.wal_tx {
            Some(wal_tx) => ask(wal_tx, |reply| WalRequest::Append(event.clone(), reply)).await,
            None => Ok(()),
        }
    }

    async fn persist_and_apply(&self, event: StoreEvent) -> Result<(), StoreError> {
        self.wal_append(&event).await?;
        self.apply(&event);
        Ok(())
    }

    /// Appends since the last compaction; zero for an in-memory store.
    pub async fn appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx.send(WalRequest::Appends(tx)).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the WAL as one `Created` record per row.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let events: Vec<StoreEvent> = self
            .all()
            .into_iter()
            .map(|record| StoreEvent::Created { record })
            .collect();
        ask(wal_tx, |reply| WalRequest::Rewrite(events, reply)).await
    }
}

#[async_trait]
impl StateStore for TimeslotStore {
    async fn find_active(&self, facility_id: &str) -> Result<Vec<PersistedTimeslot>, StoreError> {
        let mut rows: Vec<PersistedTimeslot> = self
            .active
            .iter()
            .filter(|e| e.key().facility_id == facility_id)
            .filter_map(|e| self.rows.get(e.value()).map(|r| r.value().clone()))
            .collect();
        rows.sort_by(|a, b| a.slot.cmp(&b.slot));
        Ok(rows)
    }

    async fn create(&self, record: PersistedTimeslot) -> Result<CreateOutcome, StoreError> {
        let id = record.id;
        let key = record.slot.clone();
        // Reserve the key first; the shard guard must not be held across the WAL await.
        match self.active.entry(key.clone()) {
            Entry::Occupied(e) => return Ok(CreateOutcome::AlreadyExists(*e.get())),
            Entry::Vacant(e) => {
                e.insert(id);
            }
        }

        let event = StoreEvent::Created {
            record: record.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.active.remove_if(&key, |_, reserved| *reserved == id);
            return Err(e);
        }
        self.rows.insert(id, record);
        Ok(CreateOutcome::Created)
    }

    async fn mark_unavailable(
        &self,
        id: Ulid,
        at: DateTime<Utc>,
    ) -> Result<PersistedTimeslot, StoreError> {
        if !self.rows.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.persist_and_apply(StoreEvent::MarkedUnavailable { id, at })
            .await?;
        self.get(&id).ok_or(StoreError::NotFound(id))
    }

    async fn soft_delete(&self, id: Ulid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.rows.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.persist_and_apply(StoreEvent::SoftDeleted { id, at }).await
    }

    async fn mark_retracted(&self, id: Ulid, at: DateTime<Utc>) -> Result<(), StoreError> {
        if !self.rows.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.persist_and_apply(StoreEvent::Retracted { id, at }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::Arc;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("courtwatch_test_store");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn slot(facility: &str, hour: u16) -> CanonicalTimeslot {
        CanonicalTimeslot::new(
            facility,
            NaiveDate::from_ymd_opt(2025, 6, 2).unwrap(),
            LocalTime::from_hm(hour, 0).unwrap(),
            LocalTime::from_hm(hour + 1, 0).unwrap(),
        )
    }

    fn record(facility: &str, hour: u16) -> PersistedTimeslot {
        PersistedTimeslot::opened(
            slot(facility, hour),
            None,
            NotificationHandle(format!("{facility}-{hour}")),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn create_and_find_active_by_facility() {
        let store = TimeslotStore::in_memory();
        store.create(record("a", 9)).await.unwrap();
        store.create(record("a", 10)).await.unwrap();
        store.create(record("b", 9)).await.unwrap();

        let rows = store.find_active("a").await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].slot, slot("a", 9));
        assert_eq!(rows[1].slot, slot("a", 10));
    }

    #[tokio::test]
    async fn create_is_conditional_on_key() {
        let store = TimeslotStore::in_memory();
        let first = record("a", 9);
        let first_id = first.id;
        assert_eq!(store.create(first).await.unwrap(), CreateOutcome::Created);
        assert_eq!(
            store.create(record("a", 9)).await.unwrap(),
            CreateOutcome::AlreadyExists(first_id)
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creates_for_same_key_admit_one() {
        let store = Arc::new(TimeslotStore::in_memory());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.create(record("a", 9)).await.unwrap() }));
        }
        let mut created = 0;
        for h in handles {
            if h.await.unwrap() == CreateOutcome::Created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.find_active("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_unavailable_then_soft_delete() {
        let store = TimeslotStore::in_memory();
        let r = record("a", 9);
        let id = r.id;
        store.create(r).await.unwrap();

        let at = Utc::now();
        let updated = store.mark_unavailable(id, at).await.unwrap();
        assert!(!updated.available);
        assert_eq!(updated.unavailable_at, Some(at));
        // Still active until soft-deleted.
        assert_eq!(store.find_active("a").await.unwrap().len(), 1);

        store.soft_delete(id, at).await.unwrap();
        assert!(store.find_active("a").await.unwrap().is_empty());
        // Never hard-deleted.
        assert_eq!(store.get(&id).unwrap().deleted_at, Some(at));
    }

    #[tokio::test]
    async fn key_can_reopen_after_soft_delete() {
        let store = TimeslotStore::in_memory();
        let r = record("a", 9);
        let id = r.id;
        store.create(r).await.unwrap();
        store.soft_delete(id, Utc::now()).await.unwrap();

        assert_eq!(store.create(record("a", 9)).await.unwrap(), CreateOutcome::Created);
        assert_eq!(store.len(), 2);
        assert_eq!(store.find_active("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = TimeslotStore::in_memory();
        let id = Ulid::new();
        assert!(matches!(
            store.mark_unavailable(id, Utc::now()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.soft_delete(id, Utc::now()).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.mark_retracted(id, Utc::now()).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn wal_replay_restores_state() {
        let path = test_wal_path("replay.wal");
        let closed_id;
        {
            let store = TimeslotStore::open(path.clone()).unwrap();
            store.create(record("a", 9)).await.unwrap();
            let r = record("a", 10);
            closed_id = r.id;
            store.create(r).await.unwrap();
            store.mark_unavailable(closed_id, Utc::now()).await.unwrap();
            store.soft_delete(closed_id, Utc::now()).await.unwrap();
        }

        let store = TimeslotStore::open(path).unwrap();
        let active = store.find_active("a").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].slot, slot("a", 9));
        let closed = store.get(&closed_id).unwrap();
        assert!(!closed.available);
        assert!(closed.deleted_at.is_some());
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let path = test_wal_path("compact.wal");
        {
            let store = TimeslotStore::open(path.clone()).unwrap();
            for hour in 6..12 {
                let r = record("a", hour);
                let id = r.id;
                store.create(r).await.unwrap();
                if hour % 2 == 0 {
                    store.mark_unavailable(id, Utc::now()).await.unwrap();
                    store.soft_delete(id, Utc::now()).await.unwrap();
                }
            }
            assert_eq!(store.appends_since_compact().await, 12);
            store.compact().await.unwrap();
            assert_eq!(store.appends_since_compact().await, 0);
        }

        let store = TimeslotStore::open(path).unwrap();
        assert_eq!(store.len(), 6);
        assert_eq!(store.find_active("a").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn closed_rows_owe_a_retraction_until_marked() {
        let store = TimeslotStore::in_memory();
        let open = record("a", 9);
        let closed = record("a", 10);
        let closed_id = closed.id;
        store.create(open).await.unwrap();
        store.create(closed).await.unwrap();

        let closed_at = Utc::now();
        store.mark_unavailable(closed_id, closed_at).await.unwrap();
        store.soft_delete(closed_id, closed_at).await.unwrap();

        let grace = Duration::from_secs(600);
        let pending = store.pending_retractions(grace);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record, Some(closed_id));
        assert_eq!(pending[0].handle, NotificationHandle("a-10".into()));
        assert_eq!(pending[0].not_ready_before, closed_at + chrono::Duration::minutes(10));

        store.mark_retracted(closed_id, Utc::now()).await.unwrap();
        assert!(store.pending_retractions(grace).is_empty());
        assert!(store.get(&closed_id).unwrap().retracted_at.is_some());
    }

    #[tokio::test]
    async fn pending_retractions_survive_reopen() {
        let path = test_wal_path("pending_retractions.wal");
        let (owed, done) = (record("a", 9), record("a", 10));
        let (owed_id, done_id) = (owed.id, done.id);
        {
            let store = TimeslotStore::open(path.clone()).unwrap();
            for r in [owed, done] {
                let id = r.id;
                store.create(r).await.unwrap();
                store.soft_delete(id, Utc::now()).await.unwrap();
            }
            store.mark_retracted(done_id, Utc::now()).await.unwrap();
        }

        let store = TimeslotStore::open(path).unwrap();
        let pending = store.pending_retractions(Duration::from_secs(600));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record, Some(owed_id));
    }

    #[tokio::test]
    async fn appends_queued_together_all_land() {
        let path = test_wal_path("grouped.wal");
        {
            let store = Arc::new(TimeslotStore::open(path.clone()).unwrap());
            let creates = (0..12).map(|hour| {
                let s = store.clone();
                async move { s.create(record("a", hour)).await.unwrap() }
            });
            futures::future::join_all(creates).await;
            assert_eq!(store.appends_since_compact().await, 12);
        }
        let store = TimeslotStore::open(path).unwrap();
        assert_eq!(store.find_active("a").await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn in_memory_store_has_no_wal() {
        let store = TimeslotStore::in_memory();
        store.create(record("a", 9)).await.unwrap();
        assert_eq!(store.appends_since_compact().await, 0);
        store.compact().await.unwrap();
    }
}
