//! Coordinator - one node of the supervisor tree
//!
//! ## Algorithm
//!
//! 1. Write the Run Record (`planning`) and decompose the request.
//! 2. Per subtask, decide locally between direct execution and a nested
//!    Coordinator at `depth + 1`. Recursion is refused once
//!    `depth == max_depth`, and when the recursion bulkhead or breaker says
//!    no; both fall back to direct execution.
//! 3. Start a Monitor (only if something runs directly), then submit the
//!    direct subtasks to this run's Worker Pool.
//! 4. Consume Monitor events in order, applying each suggestion at most once.
//!    A silent or closed Monitor is restarted up to `max_monitor_restarts`
//!    consecutive times; after that the run continues unmonitored.
//! 5. Wait for the pool and the children, aggregate, and write the terminal
//!    status.
//!
//! A cancelled token stops the whole subtree: children receive child tokens.
//!
//! A suggestion that fails to apply, or a worker whose final record never
//! reached the store, settles that worker and marks the run degraded; the
//! run still finishes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use arbor_agent::{ResilienceLayer, TaskExecutor, COORDINATOR_RECURSE};
use arbor_core::fail_open::fail_open_with_retries;
use arbor_core::{
    ArborConfig, ArborError, Clock, MonitorEvent, Result, RunId, RunRecord, RunStatus, StateStore,
    Subtask, SystemClock, WarningKind,
};

use crate::capability::{Aggregator, ComplexityJudge, Decomposer, NeverRecurse, RequireAll, SingleTask};
use crate::event_log::EventLog;
use crate::monitor::{InProcessLauncher, MonitorHandle, MonitorLauncher};
use crate::pool::{WorkerPool, WorkerResult};
use crate::recovery::{Applied, RecoveryLedger};
use crate::resources::{ResourceProbe, SystemProbe};

/// Where one subtask goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nested Coordinator at `depth + 1`
    Recurse,
    /// This run's Worker Pool
    Direct,
}

/// Recursion only below the ceiling, when wanted, and when admitted
pub fn dispatch_decision(depth: u32, max_depth: u32, wants_recursion: bool, admitted: bool) -> Dispatch {
    if depth < max_depth && wants_recursion && admitted {
        Dispatch::Recurse
    } else {
        Dispatch::Direct
    }
}

/// Final report of one run (and, recursively, its children)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub depth: u32,
    pub status: RunStatus,
    /// Monitoring or recovery was partially unavailable somewhere in the tree
    pub degraded: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub workers: Vec<WorkerResult>,
    #[serde(default)]
    pub children: Vec<RunResult>,
    #[serde(default)]
    pub summary: String,
}

impl RunResult {
    fn failed(run_id: RunId, depth: u32, reason: String) -> Self {
        Self {
            run_id,
            depth,
            status: RunStatus::Failed,
            degraded: false,
            warnings: vec![reason.clone()],
            workers: Vec::new(),
            children: Vec::new(),
            summary: reason,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// This run and every descendant, depth first
    pub fn walk(&self) -> Vec<&RunResult> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

/// Identity and placement of one run in the tree
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub request: String,
    pub depth: u32,
    pub max_depth: u32,
    pub parent_run_id: Option<RunId>,
}

impl RunContext {
    pub fn root(request: impl Into<String>, max_depth: u32) -> Self {
        Self {
            run_id: RunId::new(),
            request: request.into(),
            depth: 0,
            max_depth,
            parent_run_id: None,
        }
    }

    fn child(&self, subtask: &Subtask) -> Self {
        Self {
            run_id: RunId::new(),
            request: subtask.body.clone(),
            depth: self.depth + 1,
            max_depth: self.max_depth,
            parent_run_id: Some(self.run_id.clone()),
        }
    }
}

const FAILURE_WRITE_ATTEMPTS: usize = 3;
const FAILURE_WRITE_PAUSE: Duration = Duration::from_millis(50);

pub type RunFuture = Pin<Box<dyn Future<Output = Result<RunResult>> + Send + 'static>>;

/// Shared, cheaply cloned supervisor; one instance drives a whole tree
#[derive(Clone)]
pub struct Coordinator {
    config: Arc<ArborConfig>,
    store: Arc<dyn StateStore>,
    executor: Arc<dyn TaskExecutor>,
    decomposer: Arc<dyn Decomposer>,
    judge: Arc<dyn ComplexityJudge>,
    aggregator: Arc<dyn Aggregator>,
    launcher: Option<Arc<dyn MonitorLauncher>>,
    probe: Arc<dyn ResourceProbe>,
    resilience: Arc<ResilienceLayer>,
    clock: Arc<dyn Clock>,
    event_log: Option<Arc<EventLog>>,
}

impl Coordinator {
    pub fn new(
        config: ArborConfig,
        store: Arc<dyn StateStore>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let probe = Arc::new(SystemProbe::new(config.state_dir.clone()));
        let resilience = Arc::new(ResilienceLayer::new(config.resilience.clone()));
        Self {
            config: Arc::new(config),
            store,
            executor,
            decomposer: Arc::new(SingleTask),
            judge: Arc::new(NeverRecurse),
            aggregator: Arc::new(RequireAll),
            launcher: None,
            probe,
            resilience,
            clock: Arc::new(SystemClock),
            event_log: None,
        }
    }

    pub fn with_decomposer(mut self, decomposer: Arc<dyn Decomposer>) -> Self {
        self.decomposer = decomposer;
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn ComplexityJudge>) -> Self {
        self.judge = judge;
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Replace the in-process Monitor (tests, out-of-process monitors)
    pub fn with_launcher(mut self, launcher: Arc<dyn MonitorLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_resilience(mut self, resilience: Arc<ResilienceLayer>) -> Self {
        self.resilience = resilience;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_event_log(mut self, log: Arc<EventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn config(&self) -> &ArborConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    fn launcher(&self) -> Arc<dyn MonitorLauncher> {
        match &self.launcher {
            Some(launcher) => Arc::clone(launcher),
            None => Arc::new(InProcessLauncher::new(
                Arc::clone(&self.store),
                Arc::clone(&self.config),
                Arc::clone(&self.clock),
                Arc::clone(&self.probe),
            )),
        }
    }

    /// Run a top-level request under the configured `max_depth`
    pub async fn run(&self, request: &str, cancel: CancellationToken) -> Result<RunResult> {
        let ctx = RunContext::root(request, self.config.limits.max_depth);
        self.run_context(ctx, cancel).await
    }

    /// Run one node of the tree; boxed so runs can nest
    pub fn run_context(&self, ctx: RunContext, cancel: CancellationToken) -> RunFuture {
        let this = self.clone();
        let span = info_span!("run", run_id = %ctx.run_id, depth = ctx.depth);
        Box::pin(async move { this.execute(ctx, cancel).await }.instrument(span))
    }

    async fn execute(self, ctx: RunContext, cancel: CancellationToken) -> Result<RunResult> {
        self.config.validate()?;
        if ctx.depth > ctx.max_depth {
            return Err(ArborError::Config(format!(
                "depth {} exceeds max_depth {}",
                ctx.depth, ctx.max_depth
            )));
        }

        let mut record = RunRecord::new(ctx.run_id.clone(), ctx.depth, ctx.max_depth, self.clock.now())
            .with_request(&ctx.request);
        if let Some(parent) = &ctx.parent_run_id {
            record = record.with_parent(parent.clone());
        }
        self.store.put_run(&record).await?;
        info!(run_id = %ctx.run_id, depth = ctx.depth, max_depth = ctx.max_depth, "Run started");

        match self.supervise(&ctx, &mut record, &cancel).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(run_id = %ctx.run_id, "Run failed: {}", e);
                if let Err(status_err) = record.set_status(RunStatus::Failed, self.clock.now()) {
                    warn!(run_id = %ctx.run_id, "{}", status_err);
                }
                record.error = Some(e.to_string());
                fail_open_with_retries(
                    "coordinator::record_failure",
                    || self.store.put_run(&record),
                    FAILURE_WRITE_ATTEMPTS,
                    FAILURE_WRITE_PAUSE,
                )
                .await;
                Err(e)
            }
        }
    }

    async fn supervise(
        &self,
        ctx: &RunContext,
        record: &mut RunRecord,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        let subtasks = self.decomposer.decompose(&ctx.request).await?;
        debug!(run_id = %ctx.run_id, subtasks = subtasks.len(), "Decomposed request");

        let mut warnings = Vec::new();
        let mut direct = Vec::new();
        let mut children: Vec<(RunId, JoinHandle<Result<RunResult>>)> = Vec::new();

        for subtask in subtasks {
            let wants = self.judge.wants_recursion(&subtask, ctx.depth);
            let admission = if wants && ctx.depth < ctx.max_depth {
                match self.resilience.try_enter(COORDINATOR_RECURSE) {
                    Ok(admission) => Some(admission),
                    Err(e) => {
                        warn!(run_id = %ctx.run_id, "Recursion refused, running directly: {}", e);
                        warnings.push(format!("{}: ran directly ({})", subtask.title, e));
                        None
                    }
                }
            } else {
                None
            };

            match (dispatch_decision(ctx.depth, ctx.max_depth, wants, admission.is_some()), admission) {
                (Dispatch::Recurse, Some(admission)) => {
                    let child = ctx.child(&subtask);
                    let child_id = child.run_id.clone();
                    info!(run_id = %ctx.run_id, child = %child_id, title = %subtask.title, "Recursing");
                    let run = self.run_context(child, cancel.child_token());
                    let handle = tokio::spawn(async move {
                        let result = run.await;
                        match &result {
                            Ok(r) if r.is_success() => admission.succeed(),
                            _ => admission.fail(),
                        }
                        result
                    });
                    children.push((child_id, handle));
                }
                _ => direct.push(subtask),
            }
        }

        record.set_status(RunStatus::Executing, self.clock.now())?;
        self.store.put_run(record).await?;

        let pool = WorkerPool::new(
            ctx.run_id.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.executor),
            Arc::clone(&self.clock),
            self.config.limits.max_concurrency,
            cancel.child_token(),
        );

        let mut degraded = false;
        if !direct.is_empty() {
            // The Monitor must be watching before the first worker exists
            let launcher = self.launcher();
            let handle = launcher.launch(&ctx.run_id, 0, pool.max_concurrency());
            for subtask in direct {
                pool.submit(subtask).await?;
            }
            degraded = self
                .consume_events(ctx, record, &pool, launcher, handle, &mut warnings, cancel)
                .await?;
        }

        tokio::select! {
            _ = pool.wait_idle() => {}
            _ = cancel.cancelled() => {
                pool.terminate_all().await;
                pool.wait_idle().await;
            }
        }
        pool.close();

        let mut child_results = Vec::with_capacity(children.len());
        for (child_id, handle) in children {
            let result = match handle.await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => RunResult::failed(child_id, ctx.depth + 1, e.to_string()),
                Err(e) => RunResult::failed(child_id, ctx.depth + 1, format!("child task panicked: {}", e)),
            };
            degraded |= result.degraded;
            child_results.push(result);
        }

        let workers = pool.outcomes();
        let verdict = self.aggregator.aggregate(&workers, &child_results).await?;
        let (status, error) = if cancel.is_cancelled() {
            (RunStatus::Failed, Some("cancelled".to_string()))
        } else if verdict.success {
            (RunStatus::Completed, None)
        } else {
            (RunStatus::Failed, Some(verdict.summary.clone()))
        };

        record.degraded = degraded;
        record.error = error;
        record.set_status(status, self.clock.now())?;
        self.store.put_run(record).await?;
        info!(
            run_id = %ctx.run_id,
            status = %status,
            degraded,
            workers = workers.len(),
            children = child_results.len(),
            "Run finished"
        );

        Ok(RunResult {
            run_id: ctx.run_id.clone(),
            depth: ctx.depth,
            status,
            degraded,
            warnings,
            workers,
            children: child_results,
            summary: verdict.summary,
        })
    }

    /// Drain the Monitor's stream until it reports completion, the run is
    /// cancelled, or monitoring is given up; returns whether the run is
    /// degraded
    #[allow(clippy::too_many_arguments)]
    async fn consume_events(
        &self,
        ctx: &RunContext,
        record: &mut RunRecord,
        pool: &WorkerPool,
        launcher: Arc<dyn MonitorLauncher>,
        handle: MonitorHandle,
        warnings: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let silence_limit = self.config.timing.monitor_silence_limit();
        let grace = self.config.timing.monitor_shutdown_grace();
        let max_restarts = self.config.limits.max_monitor_restarts;
        let max_attempts = self.config.limits.max_task_attempts;

        let mut ledger = RecoveryLedger::new();
        let mut handle = Some(handle);
        let mut restarts = 0u32;
        let mut next_seq = 0u64;
        let mut degraded = false;

        while let Some(active) = handle.as_mut() {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(silence_limit, active.events.recv()) => r,
            };

            let line = match received {
                Ok(Some(line)) => line,
                failure => {
                    let reason = match failure {
                        Ok(None) => "event stream closed",
                        _ => "silent",
                    };
                    if let Some(dead) = handle.take() {
                        dead.shutdown(grace).await;
                    }
                    if restarts >= max_restarts {
                        let failure = ArborError::MonitorFailure(format!(
                            "{} after {} restarts",
                            reason, restarts
                        ));
                        warn!(run_id = %ctx.run_id, "{}; continuing unmonitored", failure);
                        warnings.push(format!("{}; continuing unmonitored", failure));
                        degraded = true;
                        break;
                    }
                    restarts += 1;
                    warn!(run_id = %ctx.run_id, restarts, "Monitor {}; restarting", reason);
                    handle = Some(launcher.launch(&ctx.run_id, next_seq, pool.max_concurrency()));
                    continue;
                }
            };

            restarts = 0;
            next_seq = line.seq + 1;
            if let Some(log) = &self.event_log {
                log.append(&line).await;
            }

            let lost = pool.take_unrecorded();
            if !lost.is_empty() {
                for worker_id in lost {
                    warn!(run_id = %ctx.run_id, worker_id = %worker_id, "Worker record lost; settling");
                    warnings.push(format!("{}: finished but its record was not written", worker_id));
                    ledger.settle(worker_id);
                }
                degraded = true;
                record.settled = ledger.settled().clone();
                self.store.put_run(record).await?;
            }

            match line.event {
                MonitorEvent::Heartbeat { .. } => {}
                MonitorEvent::Warning {
                    warning: WarningKind::StartupGrace,
                    detail,
                    ..
                } => {
                    warn!(run_id = %ctx.run_id, "{}; continuing unmonitored", detail);
                    warnings.push(format!("monitor startup: {}", detail));
                    degraded = true;
                    break;
                }
                MonitorEvent::Warning {
                    warning: WarningKind::Resource,
                    detail,
                    ..
                } => {
                    warnings.push(ArborError::ResourceExhaustion(detail).to_string());
                }
                MonitorEvent::Warning { worker_id, detail, .. } => {
                    debug!(run_id = %ctx.run_id, worker_id = ?worker_id, "{}", detail);
                }
                MonitorEvent::ErrorDetected { worker_id, detail } => {
                    warn!(run_id = %ctx.run_id, worker_id = ?worker_id, "Error detected: {}", detail);
                }
                MonitorEvent::SuggestRecovery { action_id, action } => {
                    record.set_status(RunStatus::Recovering, self.clock.now())?;
                    self.store.put_run(record).await?;

                    match ledger
                        .apply(&action_id, &action, pool, self.store.as_ref(), max_attempts)
                        .await
                    {
                        Ok(Applied::Escalated { reason, .. }) => {
                            warnings.push(format!("escalated: {}", reason));
                        }
                        Ok(applied) => {
                            debug!(run_id = %ctx.run_id, ?applied, "Recovery result");
                        }
                        Err(e) => {
                            // Nothing else will resolve this worker; stop waiting on it
                            warn!(run_id = %ctx.run_id, %action, "Recovery failed: {}", e);
                            if let Some(worker_id) = action.worker_id() {
                                if let Err(stop) = pool.terminate(worker_id).await {
                                    warn!(run_id = %ctx.run_id, worker_id = %worker_id, "{}", stop);
                                }
                                ledger.settle(worker_id.clone());
                            }
                            warnings.push(format!("recovery {} failed: {}", action, e));
                            degraded = true;
                        }
                    }

                    record.settled = ledger.settled().clone();
                    record.set_status(RunStatus::Executing, self.clock.now())?;
                    self.store.put_run(record).await?;
                }
                MonitorEvent::NoIssuesDetected => {
                    info!(run_id = %ctx.run_id, "Monitor reports no open issues");
                    break;
                }
            }
        }

        if let Some(active) = handle.take() {
            active.shutdown(grace).await;
        }
        Ok(degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{AlwaysRecurse, LineSplit};
    use crate::resources::FixedProbe;
    use arbor_agent::ScriptedExecutor;
    use arbor_core::{MemoryStateStore, StateReader};

    #[test]
    fn test_never_recurses_at_or_past_ceiling() {
        for max_depth in 0..8 {
            for depth in 0..10 {
                for wants in [false, true] {
                    for admitted in [false, true] {
                        let decision = dispatch_decision(depth, max_depth, wants, admitted);
                        if depth >= max_depth || !wants || !admitted {
                            assert_eq!(decision, Dispatch::Direct, "{depth}/{max_depth}");
                        } else {
                            assert_eq!(decision, Dispatch::Recurse);
                        }
                    }
                }
            }
        }
    }

    fn fast_config() -> ArborConfig {
        let mut config = ArborConfig::default();
        config.timing.status_check_interval_ms = 10;
        config.timing.monitor_heartbeat_interval_ms = 20;
        config.timing.worker_timeout_ms = 5_000;
        config.timing.startup_grace_ms = 5_000;
        config
    }

    #[tokio::test]
    async fn test_simple_run_completes() {
        let store = Arc::new(MemoryStateStore::new());
        let coordinator = Coordinator::new(fast_config(), store.clone(), Arc::new(ScriptedExecutor::new()))
            .with_decomposer(Arc::new(LineSplit))
            .with_probe(Arc::new(FixedProbe::default()));

        let result = coordinator
            .run("one\ntwo\nthree", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(!result.degraded);
        assert_eq!(result.workers.len(), 3);

        let record = store.get_run(&result.run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_depth_past_ceiling_rejected() {
        let store = Arc::new(MemoryStateStore::new());
        let coordinator = Coordinator::new(fast_config(), store, Arc::new(ScriptedExecutor::new()));
        let mut ctx = RunContext::root("x", 1);
        ctx.depth = 2;
        let err = coordinator
            .run_context(ctx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArborError::Config(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_start() {
        let mut config = fast_config();
        config.timing.status_check_interval_ms = 0;
        let store = Arc::new(MemoryStateStore::new());
        let coordinator = Coordinator::new(config, store.clone(), Arc::new(ScriptedExecutor::new()));

        let err = coordinator
            .run("a", CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ArborError::Config(_)));
        assert!(store.list_runs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resource_pressure_surfaces_as_warning() {
        let probe = FixedProbe::new(crate::resources::ResourceSample {
            cpu_percent: Some(99.0),
            memory_percent: None,
            disk_percent: None,
        });
        let executor = ScriptedExecutor::new().with_delay(std::time::Duration::from_millis(50));
        let coordinator = Coordinator::new(fast_config(), Arc::new(MemoryStateStore::new()), Arc::new(executor))
            .with_decomposer(Arc::new(LineSplit))
            .with_probe(Arc::new(probe));

        let result = coordinator.run("a\nb", CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.starts_with("Resource exhaustion")));
    }

    #[tokio::test]
    async fn test_zero_depth_never_recurses() {
        let mut config = fast_config();
        config.limits.max_depth = 0;
        let store = Arc::new(MemoryStateStore::new());
        let coordinator = Coordinator::new(config, store.clone(), Arc::new(ScriptedExecutor::new()))
            .with_decomposer(Arc::new(LineSplit))
            .with_judge(Arc::new(AlwaysRecurse))
            .with_probe(Arc::new(FixedProbe::default()));

        let result = coordinator.run("a\nb", CancellationToken::new()).await.unwrap();
        assert!(result.children.is_empty());
        assert_eq!(store.list_runs().await.unwrap().len(), 1);
    }
}
