//! Shared state store
//!
//! One serialized record per Run and per Worker, keyed by id. Every record
//! has exactly one writer (the owning Coordinator or worker task) and any
//! number of readers, so no lock manager is involved. The store itself only
//! guards the record invariants:
//!
//! - a terminal Worker Record never changes again
//! - `last_update` never moves backwards
//! - no new Worker Record appears under a terminal Run

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::{ArborError, Result, RunId, RunRecord, WorkerId, WorkerRecord};

/// Read access to run and worker records
#[async_trait]
pub trait StateReader: Send + Sync {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>>;

    async fn list_runs(&self) -> Result<Vec<RunRecord>>;

    async fn get_worker(&self, run_id: &RunId, worker_id: &WorkerId)
        -> Result<Option<WorkerRecord>>;

    /// All workers of a run, oldest first
    async fn list_workers(&self, run_id: &RunId) -> Result<Vec<WorkerRecord>>;
}

/// Read-write access, handed only to record owners
#[async_trait]
pub trait StateStore: StateReader {
    async fn put_run(&self, record: &RunRecord) -> Result<()>;

    async fn put_worker(&self, record: &WorkerRecord) -> Result<()>;
}

/// Read-only view over a store (what the Monitor gets)
#[derive(Clone)]
pub struct ReadOnlyStore(Arc<dyn StateStore>);

impl ReadOnlyStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self(store)
    }
}

#[async_trait]
impl StateReader for ReadOnlyStore {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        self.0.get_run(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        self.0.list_runs().await
    }

    async fn get_worker(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
    ) -> Result<Option<WorkerRecord>> {
        self.0.get_worker(run_id, worker_id).await
    }

    async fn list_workers(&self, run_id: &RunId) -> Result<Vec<WorkerRecord>> {
        self.0.list_workers(run_id).await
    }
}

/// Check a worker write against what is already stored
fn check_worker_write(
    existing: Option<&WorkerRecord>,
    run: Option<&RunRecord>,
    incoming: &WorkerRecord,
) -> Result<()> {
    match existing {
        Some(current) => {
            if current.is_terminal() && current != incoming {
                return Err(ArborError::TerminalRecord(current.worker_id.to_string()));
            }
            if incoming.last_update < current.last_update {
                return Err(ArborError::Other(format!(
                    "last_update of {} would move backwards",
                    incoming.worker_id
                )));
            }
        }
        None => {
            if let Some(run) = run {
                if run.status.is_terminal() {
                    return Err(ArborError::RunClosed(run.run_id.to_string()));
                }
            }
        }
    }
    Ok(())
}

fn sort_workers(workers: &mut [WorkerRecord]) {
    workers.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.worker_id.cmp(&b.worker_id))
    });
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStateStore {
    runs: RwLock<HashMap<RunId, RunRecord>>,
    workers: RwLock<HashMap<RunId, HashMap<WorkerId, WorkerRecord>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateReader for MemoryStateStore {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn get_worker(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
    ) -> Result<Option<WorkerRecord>> {
        Ok(self
            .workers
            .read()
            .await
            .get(run_id)
            .and_then(|w| w.get(worker_id))
            .cloned())
    }

    async fn list_workers(&self, run_id: &RunId) -> Result<Vec<WorkerRecord>> {
        let mut workers: Vec<WorkerRecord> = self
            .workers
            .read()
            .await
            .get(run_id)
            .map(|w| w.values().cloned().collect())
            .unwrap_or_default();
        sort_workers(&mut workers);
        Ok(workers)
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn put_run(&self, record: &RunRecord) -> Result<()> {
        self.runs
            .write()
            .await
            .insert(record.run_id.clone(), record.clone());
        Ok(())
    }

    async fn put_worker(&self, record: &WorkerRecord) -> Result<()> {
        let run = self.runs.read().await.get(&record.run_id).cloned();
        let mut workers = self.workers.write().await;
        let by_run = workers.entry(record.run_id.clone()).or_default();
        check_worker_write(by_run.get(&record.worker_id), run.as_ref(), record)?;
        by_run.insert(record.worker_id.clone(), record.clone());
        Ok(())
    }
}

/// Directory-backed store
///
/// Layout:
/// ```text
/// <root>/runs/<run_id>.json
/// <root>/workers/<run_id>/<worker_id>.json
/// ```
///
/// Writes land in a temp file that is renamed into place, so a reader in
/// another process sees either the old or the new record, never a torn one.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Open (and create) a store rooted at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("runs")).await?;
        tokio::fs::create_dir_all(root.join("workers")).await?;
        debug!("Opened state store at {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, run_id: &RunId) -> PathBuf {
        self.root.join("runs").join(format!("{}.json", run_id))
    }

    fn worker_dir(&self, run_id: &RunId) -> PathBuf {
        self.root.join("workers").join(run_id.as_str())
    }

    fn worker_path(&self, run_id: &RunId, worker_id: &WorkerId) -> PathBuf {
        self.worker_dir(run_id).join(format!("{}.json", worker_id))
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read every `*.json` record in a directory, skipping unreadable files
    async fn read_dir_json<T: serde::de::DeserializeOwned>(dir: &Path) -> Result<Vec<T>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_json::<T>(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => warn!("Skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl StateReader for FileStateStore {
    async fn get_run(&self, run_id: &RunId) -> Result<Option<RunRecord>> {
        Self::read_json(&self.run_path(run_id)).await
    }

    async fn list_runs(&self) -> Result<Vec<RunRecord>> {
        let mut runs: Vec<RunRecord> = Self::read_dir_json(&self.root.join("runs")).await?;
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(runs)
    }

    async fn get_worker(
        &self,
        run_id: &RunId,
        worker_id: &WorkerId,
    ) -> Result<Option<WorkerRecord>> {
        Self::read_json(&self.worker_path(run_id, worker_id)).await
    }

    async fn list_workers(&self, run_id: &RunId) -> Result<Vec<WorkerRecord>> {
        let mut workers: Vec<WorkerRecord> =
            Self::read_dir_json(&self.worker_dir(run_id)).await?;
        sort_workers(&mut workers);
        Ok(workers)
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn put_run(&self, record: &RunRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record)?;
        Self::write_atomic(&self.run_path(&record.run_id), &bytes).await
    }

    async fn put_worker(&self, record: &WorkerRecord) -> Result<()> {
        let existing = self.get_worker(&record.run_id, &record.worker_id).await?;
        let run = self.get_run(&record.run_id).await?;
        check_worker_write(existing.as_ref(), run.as_ref(), record)?;

        let bytes = serde_json::to_vec_pretty(record)?;
        Self::write_atomic(&self.worker_path(&record.run_id, &record.worker_id), &bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RunStatus, WorkerStatus};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    async fn exercise_store(store: Arc<dyn StateStore>) {
        let now = Utc::now();
        let run = RunRecord::new(RunId::new(), 0, 2, now);
        store.put_run(&run).await.unwrap();

        let mut worker = WorkerRecord::new(WorkerId::new(), run.run_id.clone(), "build", now);
        store.put_worker(&worker).await.unwrap();

        worker
            .transition(WorkerStatus::Running, now + Duration::seconds(1))
            .unwrap();
        store.put_worker(&worker).await.unwrap();

        let fetched = store
            .get_worker(&run.run_id, &worker.worker_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched, worker);

        // A stale write must not roll the heartbeat back
        let mut stale = worker.clone();
        stale.last_update = now;
        assert!(store.put_worker(&stale).await.is_err());

        // Terminal records are frozen
        worker
            .transition(WorkerStatus::Completed, now + Duration::seconds(2))
            .unwrap();
        store.put_worker(&worker).await.unwrap();
        let mut revived = worker.clone();
        revived.status = WorkerStatus::Running;
        revived.last_update = now + Duration::seconds(3);
        assert!(matches!(
            store.put_worker(&revived).await,
            Err(ArborError::TerminalRecord(_))
        ));

        // Closed runs accept no new workers
        let mut closed = run.clone();
        closed
            .set_status(RunStatus::Completed, now + Duration::seconds(4))
            .unwrap();
        store.put_run(&closed).await.unwrap();
        let late = WorkerRecord::new(WorkerId::new(), run.run_id.clone(), "late", now);
        assert!(matches!(
            store.put_worker(&late).await,
            Err(ArborError::RunClosed(_))
        ));

        let workers = store.list_workers(&run.run_id).await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(store.list_runs().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_invariants() {
        exercise_store(Arc::new(MemoryStateStore::new())).await;
    }

    #[tokio::test]
    async fn test_file_store_invariants() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        exercise_store(Arc::new(store)).await;
    }

    #[tokio::test]
    async fn test_file_store_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::open(dir.path()).await.unwrap();
        let run = RunRecord::new(RunId::new(), 1, 2, Utc::now());
        store.put_run(&run).await.unwrap();
        tokio::fs::write(dir.path().join("runs/broken.json"), b"{not json")
            .await
            .unwrap();

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs, vec![run]);
    }

    #[tokio::test]
    async fn test_read_only_view() {
        let inner: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let run = RunRecord::new(RunId::new(), 0, 2, Utc::now());
        inner.put_run(&run).await.unwrap();

        let view = ReadOnlyStore::new(inner);
        assert_eq!(view.get_run(&run.run_id).await.unwrap(), Some(run));
    }
}
