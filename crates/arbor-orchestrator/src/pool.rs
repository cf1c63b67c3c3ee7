//! Worker Pool
//!
//! Runs subtasks through the [`TaskExecutor`], at most `max_concurrency` at a
//! time, dequeuing in FIFO order as slots free up. Each worker's slot task is
//! the only writer of that worker's record: `spawning → running` on start,
//! a fresh `last_update` after every chunk of output, and exactly one
//! terminal write at the end.
//!
//! The pool never retries. A retry is a fresh [`WorkerPool::resubmit`] from
//! the Coordinator.
//!
//! Transition writes are retried a few times. A worker whose record still
//! cannot be written is reported as failed and listed by
//! [`WorkerPool::take_unrecorded`], since the store no longer tells the
//! truth about it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use arbor_agent::{ProgressSink, TaskExecutor};
use arbor_core::fail_open::{fail_open, fail_open_with_retries};
use arbor_core::{
    ArborError, Clock, Result, RunId, StateStore, Subtask, TaskOutcome, WorkerId, WorkerRecord,
    WorkerStatus,
};

const RECORD_WRITE_ATTEMPTS: usize = 3;
const RECORD_WRITE_PAUSE: Duration = Duration::from_millis(20);

/// Final outcome of one worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_id: WorkerId,
    pub title: String,
    pub lineage: String,
    pub attempt: u32,
    pub status: WorkerStatus,
    #[serde(default)]
    pub outcome: Option<TaskOutcome>,
    #[serde(default)]
    pub error: Option<String>,
}

struct TaskMeta {
    subtask: Subtask,
    lineage: String,
    attempt: u32,
}

struct Job {
    record: WorkerRecord,
    subtask: Subtask,
    cancel: CancellationToken,
}

struct PoolState {
    max_concurrency: usize,
    live: usize,
    peak: usize,
    queue: VecDeque<Job>,
    running: HashMap<WorkerId, CancellationToken>,
    tasks: HashMap<WorkerId, TaskMeta>,
    order: Vec<WorkerId>,
    results: HashMap<WorkerId, WorkerResult>,
    /// Finished, but the store never saw it happen
    unrecorded: HashSet<WorkerId>,
    closed: bool,
}

struct PoolInner {
    run_id: RunId,
    store: Arc<dyn StateStore>,
    executor: Arc<dyn TaskExecutor>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    state: Mutex<PoolState>,
    changed: Notify,
}

/// Bounded pool of workers for one run
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(
        run_id: RunId,
        store: Arc<dyn StateStore>,
        executor: Arc<dyn TaskExecutor>,
        clock: Arc<dyn Clock>,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                run_id,
                store,
                executor,
                clock,
                cancel,
                state: Mutex::new(PoolState {
                    max_concurrency: max_concurrency.max(1),
                    live: 0,
                    peak: 0,
                    queue: VecDeque::new(),
                    running: HashMap::new(),
                    tasks: HashMap::new(),
                    order: Vec::new(),
                    results: HashMap::new(),
                    unrecorded: HashSet::new(),
                    closed: false,
                }),
                changed: Notify::new(),
            }),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    /// Queue a new subtask (first attempt of a new lineage)
    pub async fn submit(&self, subtask: Subtask) -> Result<WorkerId> {
        let worker_id = WorkerId::new();
        let lineage = worker_id.to_string();
        self.enqueue(worker_id, subtask, lineage, 1).await
    }

    /// Queue another attempt of `previous`'s subtask
    pub async fn resubmit<F>(&self, previous: &WorkerId, adjust: F) -> Result<WorkerId>
    where
        F: FnOnce(&mut Subtask),
    {
        let (mut subtask, lineage, attempt) = {
            let state = self.inner.state();
            let meta = state
                .tasks
                .get(previous)
                .ok_or_else(|| ArborError::RecordNotFound(previous.to_string()))?;
            (meta.subtask.clone(), meta.lineage.clone(), meta.attempt)
        };
        adjust(&mut subtask);
        self.enqueue(WorkerId::new(), subtask, lineage, attempt + 1)
            .await
    }

    async fn enqueue(
        &self,
        worker_id: WorkerId,
        subtask: Subtask,
        lineage: String,
        attempt: u32,
    ) -> Result<WorkerId> {
        if self.inner.state().closed {
            return Err(ArborError::RunClosed(self.inner.run_id.to_string()));
        }

        let record = WorkerRecord::new(
            worker_id.clone(),
            self.inner.run_id.clone(),
            subtask.title.clone(),
            self.inner.clock.now(),
        )
        .with_lineage(lineage.clone(), attempt);
        self.inner.store.put_worker(&record).await?;

        {
            let mut state = self.inner.state();
            state.tasks.insert(
                worker_id.clone(),
                TaskMeta {
                    subtask: subtask.clone(),
                    lineage,
                    attempt,
                },
            );
            state.order.push(worker_id.clone());
            state.queue.push_back(Job {
                record,
                subtask,
                cancel: self.inner.cancel.child_token(),
            });
        }
        debug!(run_id = %self.inner.run_id, worker_id = %worker_id, attempt, "Queued worker");

        self.inner.dispatch();
        Ok(worker_id)
    }

    /// Stop a worker; queued workers are dropped, running ones cancelled
    ///
    /// Returns `false` when the worker had already finished.
    pub async fn terminate(&self, worker_id: &WorkerId) -> Result<bool> {
        let queued = {
            let mut state = self.inner.state();
            match state
                .queue
                .iter()
                .position(|job| &job.record.worker_id == worker_id)
            {
                Some(pos) => state.queue.remove(pos),
                None => match state.running.get(worker_id) {
                    Some(token) => {
                        token.cancel();
                        return Ok(true);
                    }
                    None => return Ok(false),
                },
            }
        };
        if let Some(job) = queued {
            self.inner.abandon(job).await;
        }
        Ok(true)
    }

    /// Cancel everything, queued and running
    pub async fn terminate_all(&self) {
        let (queued, tokens) = {
            let mut state = self.inner.state();
            let queued: Vec<Job> = state.queue.drain(..).collect();
            let tokens: Vec<CancellationToken> = state.running.values().cloned().collect();
            (queued, tokens)
        };
        for token in tokens {
            token.cancel();
        }
        for job in queued {
            self.inner.abandon(job).await;
        }
    }

    /// Lower the concurrency cap (never below 1, never raised)
    ///
    /// Workers already running above the new cap are left to finish.
    pub fn set_max_concurrency(&self, new_max: usize) -> usize {
        let mut state = self.inner.state();
        state.max_concurrency = state.max_concurrency.min(new_max.max(1));
        state.max_concurrency
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.state().max_concurrency
    }

    pub fn live(&self) -> usize {
        self.inner.state().live
    }

    /// Most workers ever running at once
    pub fn peak_live(&self) -> usize {
        self.inner.state().peak
    }

    pub fn queued(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Refuse further submissions
    pub fn close(&self) {
        self.inner.state().closed = true;
    }

    /// Resolve once nothing is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state();
                if state.live == 0 && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Finished workers in submission order
    pub fn outcomes(&self) -> Vec<WorkerResult> {
        let state = self.inner.state();
        state
            .order
            .iter()
            .filter_map(|id| state.results.get(id))
            .cloned()
            .collect()
    }

    pub fn result(&self, worker_id: &WorkerId) -> Option<WorkerResult> {
        self.inner.state().results.get(worker_id).cloned()
    }

    /// Finished workers whose records could not be written, each returned once
    pub fn take_unrecorded(&self) -> Vec<WorkerId> {
        let mut state = self.inner.state();
        let mut taken: Vec<WorkerId> = state.unrecorded.drain().collect();
        taken.sort();
        taken
    }

    /// Number of workers ever submitted
    pub fn submitted(&self) -> usize {
        self.inner.state().order.len()
    }
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start queued jobs while there is room
    fn dispatch(self: &Arc<Self>) {
        let ready: Vec<Job> = {
            let mut state = self.state();
            let mut ready = Vec::new();
            while state.live < state.max_concurrency {
                let Some(job) = state.queue.pop_front() else {
                    break;
                };
                state.live += 1;
                state.peak = state.peak.max(state.live);
                state
                    .running
                    .insert(job.record.worker_id.clone(), job.cancel.clone());
                ready.push(job);
            }
            ready
        };
        for job in ready {
            tokio::spawn(run_slot(Arc::clone(self), job));
        }
    }

    /// Terminal write for a job that never started
    async fn abandon(&self, job: Job) {
        let mut record = job.record;
        let worker_id = record.worker_id.clone();
        if let Err(e) = record.transition(WorkerStatus::Terminated, self.clock.now()) {
            error!(worker_id = %worker_id, "Cannot terminate queued worker: {}", e);
            return;
        }
        if let Err(e) = self.store.put_worker(&record).await {
            error!(worker_id = %worker_id, "Failed to write worker record: {}", e);
        }
        self.state().results.insert(
            worker_id.clone(),
            WorkerResult {
                worker_id,
                title: job.subtask.title,
                lineage: record.lineage.clone(),
                attempt: record.attempt,
                status: WorkerStatus::Terminated,
                outcome: None,
                error: None,
            },
        );
        self.changed.notify_waiters();
    }
}

/// One running worker: owns its record for the duration of the attempt
struct Slot {
    inner: Arc<PoolInner>,
    record: AsyncMutex<WorkerRecord>,
}

impl Slot {
    async fn write(&self, record: &WorkerRecord) -> Result<()> {
        fail_open_with_retries(
            "worker transition",
            || self.inner.store.put_worker(record),
            RECORD_WRITE_ATTEMPTS,
            RECORD_WRITE_PAUSE,
        )
        .await
        .ok_or_else(|| {
            ArborError::Other(format!(
                "worker record not written ({})",
                record.status
            ))
        })
    }

    async fn advance(&self, status: WorkerStatus) -> Result<()> {
        let mut record = self.record.lock().await;
        match record.transition(status, self.inner.clock.now()) {
            Ok(()) => self.write(&record).await,
            Err(e) => {
                error!(worker_id = %record.worker_id, "Bad worker transition: {}", e);
                Ok(())
            }
        }
    }

    /// Terminal write; `Err` carries the record write failure
    async fn finish(
        &self,
        status: WorkerStatus,
        error: Option<String>,
    ) -> (WorkerRecord, Option<ArborError>) {
        let mut record = self.record.lock().await;
        let now = self.inner.clock.now();
        let moved = match (&status, error) {
            (WorkerStatus::Failed, Some(message)) => record.fail(message, now),
            _ => record.transition(status, now),
        };
        let unwritten = match moved {
            Ok(()) => self.write(&record).await.err(),
            Err(e) => {
                error!(worker_id = %record.worker_id, "Bad worker transition: {}", e);
                None
            }
        };
        (record.clone(), unwritten)
    }
}

#[async_trait]
impl ProgressSink for Slot {
    async fn output(&self, _chunk: &[u8]) {
        let mut record = self.record.lock().await;
        if record.is_terminal() {
            return;
        }
        record.touch(self.inner.clock.now());
        if record.status == WorkerStatus::Waiting {
            record.status = WorkerStatus::Running;
        }
        fail_open("worker heartbeat", || self.inner.store.put_worker(&record)).await;
    }

    async fn waiting(&self) {
        let mut record = self.record.lock().await;
        if record.status != WorkerStatus::Running {
            return;
        }
        // Quiet is not progress: status changes, the heartbeat does not
        record.status = WorkerStatus::Waiting;
        fail_open("worker waiting", || self.inner.store.put_worker(&record)).await;
    }
}

async fn run_slot(inner: Arc<PoolInner>, job: Job) {
    let Job {
        record,
        subtask,
        cancel,
    } = job;
    let worker_id = record.worker_id.clone();
    let slot = Slot {
        inner: Arc::clone(&inner),
        record: AsyncMutex::new(record),
    };

    let started = match slot.advance(WorkerStatus::Spawning).await {
        Ok(()) => slot.advance(WorkerStatus::Running).await,
        Err(e) => Err(e),
    };

    let result = match started {
        // Never run a worker nobody can see
        Err(e) => Some(Err(e)),
        Ok(()) => {
            let work = inner.executor.execute(&subtask, &slot);
            let bounded = async {
                match subtask.timeout() {
                    Some(limit) => tokio::time::timeout(limit, work)
                        .await
                        .unwrap_or(Err(ArborError::Timeout(limit))),
                    None => work.await,
                }
            };
            tokio::select! {
                r = bounded => Some(r),
                _ = cancel.cancelled() => None,
            }
        }
    };

    let (status, error, outcome) = match result {
        None => (WorkerStatus::Terminated, None, None),
        Some(Ok(outcome)) if outcome.success => (WorkerStatus::Completed, None, Some(outcome)),
        Some(Ok(outcome)) => {
            let message = outcome
                .error
                .clone()
                .unwrap_or_else(|| "task reported failure".to_string());
            (WorkerStatus::Failed, Some(message), Some(outcome))
        }
        Some(Err(e)) => (WorkerStatus::Failed, Some(e.to_string()), None),
    };

    let (record, unwritten) = slot.finish(status, error.clone()).await;
    let (status, error) = match &unwritten {
        Some(e) => {
            error!(run_id = %inner.run_id, worker_id = %worker_id, "{}", e);
            (WorkerStatus::Failed, Some(e.to_string()))
        }
        None => (record.status, error),
    };
    info!(
        run_id = %inner.run_id,
        worker_id = %worker_id,
        status = %status,
        "Worker finished"
    );

    {
        let mut state = inner.state();
        state.results.insert(
            worker_id.clone(),
            WorkerResult {
                worker_id: worker_id.clone(),
                title: subtask.title.clone(),
                lineage: record.lineage.clone(),
                attempt: record.attempt,
                status,
                outcome,
                error,
            },
        );
        if unwritten.is_some() {
            state.unrecorded.insert(worker_id.clone());
        }
        state.running.remove(&worker_id);
        state.live -= 1;
    }
    inner.changed.notify_waiters();
    inner.dispatch();
}
