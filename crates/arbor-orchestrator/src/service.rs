//! Run service - asynchronous entry point to the supervisor tree
//!
//! `submit` answers immediately with the new run's id; the run itself
//! proceeds in the background. Status and progress are read back from the
//! Shared State Store, so any reader of the store sees the same picture.
//!
//! Finished runs stay waitable for a while; beyond the history limit the
//! oldest are forgotten and only their records remain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use arbor_core::{
    ArborError, EventLine, Result, RunId, RunRecord, RunStatus, StateReader, WorkerStatus,
};

use crate::coordinator::{Coordinator, RunContext, RunResult};
use crate::event_log::EventLog;

/// Request accepted by [`RunService::submit`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub request: String,
    #[serde(default)]
    pub depth: u32,
    /// Can only lower the configured ceiling
    #[serde(default)]
    pub max_depth: Option<u32>,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
}

impl RunRequest {
    pub fn new(request: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            depth: 0,
            max_depth: None,
            parent_run_id: None,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = Some(max_depth);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAccepted {
    pub run_id: RunId,
    pub status: RunStatus,
}

/// Worker counts by status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: usize,
    pub pending: usize,
    /// Spawning, running, or waiting
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub terminated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatusReport {
    pub run_id: RunId,
    pub depth: u32,
    pub status: RunStatus,
    pub degraded: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub progress: Progress,
}

type Outcome = Option<std::result::Result<RunResult, String>>;

/// Finished runs kept waitable by default
const FINISHED_HISTORY: usize = 64;

struct ActiveRun {
    seq: u64,
    depth: u32,
    cancel: CancellationToken,
    done: watch::Receiver<Outcome>,
}

pub struct RunService {
    coordinator: Coordinator,
    event_log: Option<Arc<EventLog>>,
    runs: Mutex<HashMap<RunId, ActiveRun>>,
    next_seq: AtomicU64,
    history: usize,
}

impl RunService {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            coordinator,
            event_log: None,
            runs: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            history: FINISHED_HISTORY,
        }
    }

    /// How many finished runs stay waitable
    pub fn with_history(mut self, history: usize) -> Self {
        self.history = history;
        self
    }

    /// Log that `events` replays from (normally the Coordinator's own)
    pub fn with_event_log(mut self, log: Arc<EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, ActiveRun>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start a run in the background
    pub fn submit(&self, req: RunRequest) -> Result<RunAccepted> {
        self.coordinator.config().validate()?;
        let ceiling = self.coordinator.config().limits.max_depth;
        let max_depth = req.max_depth.map_or(ceiling, |m| m.min(ceiling));
        if req.depth > max_depth {
            return Err(ArborError::Config(format!(
                "depth {} exceeds max_depth {}",
                req.depth, max_depth
            )));
        }
        if req.request.trim().is_empty() {
            return Err(ArborError::Config("empty request".into()));
        }

        let ctx = RunContext {
            run_id: RunId::new(),
            request: req.request,
            depth: req.depth,
            max_depth,
            parent_run_id: req.parent_run_id,
        };
        let run_id = ctx.run_id.clone();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(None);

        let run = self.coordinator.run_context(ctx, cancel.clone());
        tokio::spawn(async move {
            let outcome = run.await.map_err(|e| e.to_string());
            tx.send_replace(Some(outcome));
        });

        let mut runs = self.runs();
        forget_finished(&mut runs, self.history);
        runs.insert(
            run_id.clone(),
            ActiveRun {
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                depth: req.depth,
                cancel,
                done: rx,
            },
        );
        drop(runs);
        info!(run_id = %run_id, depth = req.depth, max_depth, "Run submitted");

        Ok(RunAccepted {
            run_id,
            status: RunStatus::Planning,
        })
    }

    /// Current status and worker counts
    pub async fn status(&self, run_id: &RunId) -> Result<RunStatusReport> {
        let store = self.coordinator.store();
        let Some(record) = store.get_run(run_id).await? else {
            // Accepted but the Coordinator has not written its record yet
            let depth = self
                .runs()
                .get(run_id)
                .map(|run| run.depth)
                .ok_or_else(|| ArborError::RecordNotFound(run_id.to_string()))?;
            return Ok(RunStatusReport {
                run_id: run_id.clone(),
                depth,
                status: RunStatus::Planning,
                degraded: false,
                error: None,
                progress: Progress::default(),
            });
        };

        let mut progress = Progress::default();
        for worker in store.list_workers(run_id).await? {
            progress.total += 1;
            match worker.status {
                WorkerStatus::Pending => progress.pending += 1,
                WorkerStatus::Spawning | WorkerStatus::Running | WorkerStatus::Waiting => {
                    progress.running += 1
                }
                WorkerStatus::Completed => progress.completed += 1,
                WorkerStatus::Failed => progress.failed += 1,
                WorkerStatus::Terminated => progress.terminated += 1,
            }
        }

        Ok(RunStatusReport {
            run_id: record.run_id,
            depth: record.depth,
            status: record.status,
            degraded: record.degraded,
            error: record.error,
            progress,
        })
    }

    /// Audit log of a run's Monitor events
    pub async fn events(&self, run_id: &RunId) -> Result<Vec<EventLine>> {
        match &self.event_log {
            Some(log) => log.replay(run_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Resolve once the run has finished
    pub async fn wait(&self, run_id: &RunId) -> Result<RunResult> {
        let mut done = self
            .runs()
            .get(run_id)
            .map(|run| run.done.clone())
            .ok_or_else(|| ArborError::RecordNotFound(run_id.to_string()))?;

        let outcome = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ArborError::Other(format!("run {} ended without a result", run_id)))?
            .clone();
        match outcome {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(ArborError::Other(message)),
            None => Err(ArborError::Other(format!("run {} has no result", run_id))),
        }
    }

    /// Cancel a run and its whole subtree; `false` if unknown
    pub fn cancel(&self, run_id: &RunId) -> bool {
        match self.runs().get(run_id) {
            Some(run) => {
                info!(run_id = %run_id, "Cancelling run");
                run.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Every Run Record in the store
    pub async fn list(&self) -> Result<Vec<RunRecord>> {
        self.coordinator.store().list_runs().await
    }
}

/// Drop the oldest finished runs beyond `keep`; running ones always stay
fn forget_finished(runs: &mut HashMap<RunId, ActiveRun>, keep: usize) {
    let mut finished: Vec<(u64, RunId)> = runs
        .iter()
        .filter(|(_, run)| run.done.borrow().is_some())
        .map(|(id, run)| (run.seq, id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, run_id) in finished.into_iter().take(excess) {
        runs.remove(&run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::LineSplit;
    use crate::resources::FixedProbe;
    use arbor_agent::{Script, ScriptedExecutor};
    use arbor_core::{ArborConfig, MemoryStateStore};
    use std::time::Duration;

    fn service(executor: ScriptedExecutor) -> RunService {
        let mut config = ArborConfig::default();
        config.timing.status_check_interval_ms = 10;
        config.timing.monitor_heartbeat_interval_ms = 20;
        let coordinator = Coordinator::new(
            config,
            Arc::new(MemoryStateStore::new()),
            Arc::new(executor),
        )
        .with_decomposer(Arc::new(LineSplit))
        .with_probe(Arc::new(FixedProbe::default()));
        RunService::new(coordinator)
    }

    #[tokio::test]
    async fn test_submit_then_wait() {
        let service = service(ScriptedExecutor::new());
        let accepted = service.submit(RunRequest::new("a\nb")).unwrap();
        assert_eq!(accepted.status, RunStatus::Planning);

        let result = service.wait(&accepted.run_id).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);

        let report = service.status(&accepted.run_id).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.progress.total, 2);
        assert_eq!(report.progress.completed, 2);
    }

    #[tokio::test]
    async fn test_request_cannot_raise_ceiling() {
        let service = service(ScriptedExecutor::new());
        let err = service
            .submit(RunRequest {
                request: "x".into(),
                depth: 3,
                max_depth: Some(10),
                parent_run_id: None,
            })
            .unwrap_err();
        assert!(matches!(err, ArborError::Config(_)));
        assert!(service.submit(RunRequest::new("   ")).is_err());
    }

    #[tokio::test]
    async fn test_cancel_fails_run() {
        let service = service(ScriptedExecutor::new().with_script("stuck", Script::Hang));
        let accepted = service.submit(RunRequest::new("stuck")).unwrap();

        let mut running = false;
        for _ in 0..200 {
            let report = service.status(&accepted.run_id).await.unwrap();
            if report.progress.running > 0 {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(running);

        assert!(service.cancel(&accepted.run_id));
        let result = service.wait(&accepted.run_id).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.workers[0].status, WorkerStatus::Terminated);
    }

    #[tokio::test]
    async fn test_old_finished_runs_forgotten() {
        let service = service(ScriptedExecutor::new()).with_history(1);
        let first = service.submit(RunRequest::new("a")).unwrap().run_id;
        service.wait(&first).await.unwrap();
        let second = service.submit(RunRequest::new("b")).unwrap().run_id;
        service.wait(&second).await.unwrap();

        let third = service.submit(RunRequest::new("c")).unwrap().run_id;
        assert!(matches!(
            service.wait(&first).await,
            Err(ArborError::RecordNotFound(_))
        ));
        assert!(service.wait(&second).await.is_ok());
        assert!(service.wait(&third).await.is_ok());

        // The record outlives the in-memory entry
        let report = service.status(&first).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_submit() {
        let mut config = ArborConfig::default();
        config.timing.status_check_interval_ms = 0;
        let coordinator = Coordinator::new(
            config,
            Arc::new(MemoryStateStore::new()),
            Arc::new(ScriptedExecutor::new()),
        );
        let service = RunService::new(coordinator);
        assert!(matches!(
            service.submit(RunRequest::new("a")),
            Err(ArborError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let service = service(ScriptedExecutor::new());
        let id = RunId::new();
        assert!(service.status(&id).await.is_err());
        assert!(!service.cancel(&id));
        assert!(service.wait(&id).await.is_err());
    }
}
