use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::model::*;
use crate::wal::Wal;

use super::{IntervalStore, Ledgers, ReservationScope, StoreError};

const WAL_CHANNEL_CAPACITY: usize = 4096;

// ── Group-commit WAL channel ─────────────────────────────

struct AppendRequest {
    events: Vec<Event>,
    response: oneshot::Sender<io::Result<()>>,
}

/// Cheap handle to the background WAL writer.
#[derive(Clone)]
pub(crate) struct WalHandle {
    tx: mpsc::Sender<AppendRequest>,
}

impl WalHandle {
    /// Returns once `events` are fsynced.
    pub(crate) async fn append(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let (response, rx) = oneshot::channel();
        self.tx
            .send(AppendRequest { events, response })
            .await
            .map_err(|_| StoreError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Unavailable(format!("WAL write failed: {e}")))
    }
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first request arrives.
/// 2. Drain all immediately available requests (the batch window).
/// 3. Buffer every event, then a single flush_sync for the whole batch.
/// 4. Respond to all senders with the shared result.
///
/// A failed batch is rolled back off the file before anyone hears about it.
/// If the rollback fails too, the writer refuses every later batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<AppendRequest>) {
    let mut poisoned = false;
    while let Some(first) = rx.recv().await {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }

        let result = if poisoned {
            Err(io::Error::other("WAL writer disabled after failed rollback"))
        } else {
            let event_count: usize = batch.iter().map(|r| r.events.len()).sum();
            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(event_count as f64);
            let flush_start = std::time::Instant::now();
            let result = flush_batch(&mut wal, &batch);
            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                .record(flush_start.elapsed().as_secs_f64());
            if let Err(e) = &result {
                tracing::error!(path = %wal.path().display(), "WAL flush failed: {e}");
                if let Err(e) = wal.rollback() {
                    tracing::error!(path = %wal.path().display(), "WAL rollback failed, refusing further writes: {e}");
                    poisoned = true;
                }
            }
            result
        };

        for req in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = req.response.send(r);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[AppendRequest]) -> io::Result<()> {
    for req in batch {
        for event in &req.events {
            wal.append_buffered(event)?;
        }
    }
    wal.flush_sync()
}

/// Durable store: ledgers rebuilt from the WAL on open, every commit
/// group-committed to the WAL before it becomes visible.
pub struct WalStore {
    ledgers: Ledgers,
    wal: WalHandle,
    path: PathBuf,
}

impl WalStore {
    /// Replay `path` and start the writer task. Must run inside a tokio
    /// runtime. Fails with `InvariantViolation` if the log holds two
    /// overlapping reservations for one resource.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let events = Wal::replay(path)?;
        let ledgers = Ledgers::default();

        // Sole owner of these locks during replay, so try_write never contends.
        // Never use blocking_write: this runs inside an async context.
        for event in &events {
            match event {
                Event::Reserved(r) => {
                    let ledger = ledgers.get_or_create(&r.resource)?;
                    let mut guard = ledger.try_write().map_err(|_| {
                        StoreError::InvariantViolation("replay: contended ledger".into())
                    })?;
                    if let Some(existing) = guard.first_overlap(&r.span) {
                        return Err(StoreError::InvariantViolation(format!(
                            "replay: {} {} overlaps {} {} on {}",
                            r.id, r.span, existing.id, existing.span, r.resource
                        )));
                    }
                    guard.insert(r.clone());
                }
            }
        }

        let wal = Wal::open(path)?;
        let (tx, rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
        tokio::spawn(wal_writer_loop(wal, rx));

        info!(
            path = %path.display(),
            reservations = events.len(),
            resources = ledgers.len(),
            "WAL replayed"
        );

        Ok(Self {
            ledgers,
            wal: WalHandle { tx },
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl IntervalStore for WalStore {
    async fn begin(&self, resource: &str) -> Result<Box<dyn ReservationScope>, StoreError> {
        self.ledgers.begin(resource, Some(self.wal.clone())).await
    }

    async fn list(&self, resource: Option<&str>) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.ledgers.list(resource).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("reservd_test_store");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn reservation(resource: &str, start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            resource: resource.into(),
            span: Span::new(start, end),
            owner: "alice".into(),
            created_at: 0,
        }
    }

    async fn commit_one(store: &WalStore, r: Reservation) {
        let mut scope = store.begin(&r.resource).await.unwrap();
        scope.insert(r).await.unwrap();
        scope.commit().await.unwrap();
    }

    #[tokio::test]
    async fn survives_reopen() {
        let path = test_wal_path("survives_reopen.wal");
        let a = reservation("RoomA", 0, 10);
        let b = reservation("RoomB", 0, 10);
        {
            let store = WalStore::open(&path).unwrap();
            assert_eq!(store.path(), path.as_path());
            commit_one(&store, a.clone()).await;
            commit_one(&store, b.clone()).await;
        }

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.list(None).await.unwrap(), vec![a.clone(), b]);

        // Replayed state still enforces exclusion.
        let mut scope = store.begin("RoomA").await.unwrap();
        let err = scope.insert(reservation("RoomA", 5, 6)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(id) if id == a.id));
    }

    #[tokio::test]
    async fn rolled_back_scope_not_persisted() {
        let path = test_wal_path("rolled_back.wal");
        {
            let store = WalStore::open(&path).unwrap();
            let mut scope = store.begin("RoomA").await.unwrap();
            scope.insert(reservation("RoomA", 0, 10)).await.unwrap();
            drop(scope);
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_rejects_overlapping_log() {
        let path = test_wal_path("overlapping_log.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&Event::Reserved(reservation("RoomA", 0, 10))).unwrap();
            wal.append_buffered(&Event::Reserved(reservation("RoomA", 5, 15))).unwrap();
            wal.flush_sync().unwrap();
        }
        let result = WalStore::open(&path);
        assert!(matches!(result, Err(StoreError::InvariantViolation(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_group_and_persist() {
        let path = test_wal_path("group_commit.wal");
        let store = Arc::new(WalStore::open(&path).unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let resource = format!("Room{}", i % 4);
                let start = (i / 4) * 100;
                commit_one(&store, reservation(&resource, start, start + 100)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(Wal::replay(&path).unwrap().len(), 32);
        assert_eq!(store.list(None).await.unwrap().len(), 32);
    }

    #[tokio::test]
    async fn failed_flush_never_becomes_durable() {
        let path = test_wal_path("failed_flush.wal");
        let kept = reservation("RoomA", 0, 100);
        let failed = reservation("RoomA", 100, 110);
        let rebooked = reservation("RoomA", 100, 110);
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append_buffered(&Event::Reserved(kept.clone())).unwrap();
            wal.flush_sync().unwrap();
            wal.fail_next_flush();

            let (tx, rx) = mpsc::channel(WAL_CHANNEL_CAPACITY);
            let writer = tokio::spawn(wal_writer_loop(wal, rx));
            let handle = WalHandle { tx };

            let err = handle.append(vec![Event::Reserved(failed.clone())]).await.unwrap_err();
            assert!(matches!(err, StoreError::Unavailable(_)));

            // The slot was never booked, so someone else may take it.
            handle.append(vec![Event::Reserved(rebooked.clone())]).await.unwrap();

            drop(handle);
            writer.await.unwrap();
        }

        let replayed = Wal::replay(&path).unwrap();
        assert!(!replayed.contains(&Event::Reserved(failed)));

        let store = WalStore::open(&path).unwrap();
        assert_eq!(store.list(Some("RoomA")).await.unwrap(), vec![kept, rebooked]);
    }
}
