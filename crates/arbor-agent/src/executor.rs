//! Task execution capability
//!
//! The supervisor never looks inside a subtask. It hands the subtask to a
//! [`TaskExecutor`] and gets back success, raw output, and an optional error.
//! Progress flows back through a [`ProgressSink`] so the Worker Pool can keep
//! the worker's heartbeat fresh while output is arriving.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, instrument};

use arbor_core::{ArborError, Result, Subtask, TaskOutcome};

use crate::handle::{
    find_earliest, ExitInfo, ExpectOutcome, Pattern, ProcessHandle, ProcessSpec, ReadOutcome,
};
use crate::resilience::{ResilienceLayer, PROCESS_SPAWN};

/// Receives progress from a running subtask
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// A chunk of output arrived
    async fn output(&self, chunk: &[u8]);

    /// The process is alive but quiet (blocked on input or thinking)
    async fn waiting(&self);
}

/// Discards all progress
pub struct NullProgress;

#[async_trait]
impl ProgressSink for NullProgress {
    async fn output(&self, _chunk: &[u8]) {}

    async fn waiting(&self) {}
}

/// Runs one subtask to completion
///
/// `Err` means the process itself misbehaved (could not spawn, crashed,
/// blew its deadline). `Ok` with `success == false` means it ran and
/// reported failure.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, subtask: &Subtask, progress: &dyn ProgressSink) -> Result<TaskOutcome>;
}

/// Drives an external interactive program through a PTY
///
/// One process per subtask. Optionally waits for a ready prompt, then types
/// the subtask body and watches the output for success/failure patterns.
/// Without patterns the exit status decides.
pub struct PtyExecutor {
    spec: ProcessSpec,
    ready: Option<Pattern>,
    success: Vec<Pattern>,
    failure: Vec<Pattern>,
    close_input: bool,
    poll: Duration,
    resilience: Arc<ResilienceLayer>,
}

impl PtyExecutor {
    pub fn new(spec: ProcessSpec, resilience: Arc<ResilienceLayer>) -> Self {
        Self {
            spec,
            ready: None,
            success: Vec::new(),
            failure: Vec::new(),
            close_input: false,
            poll: Duration::from_millis(500),
            resilience,
        }
    }

    pub fn with_ready(mut self, pattern: Pattern) -> Self {
        self.ready = Some(pattern);
        self
    }

    pub fn with_success(mut self, pattern: Pattern) -> Self {
        self.success.push(pattern);
        self
    }

    pub fn with_failure(mut self, pattern: Pattern) -> Self {
        self.failure.push(pattern);
        self
    }

    /// Send end-of-input (Ctrl-D) after the body
    pub fn with_close_input(mut self) -> Self {
        self.close_input = true;
        self
    }

    /// How long a single read waits before reporting the process as quiet
    pub fn with_poll(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn spec_for(&self, subtask: &Subtask) -> ProcessSpec {
        let mut spec = self
            .spec
            .clone()
            .with_env("ARBOR_TASK_TITLE", subtask.title.as_str());
        if subtask.clean_state {
            spec = spec.with_env("ARBOR_CLEAN_STATE", "1");
        }
        if let Some(timeout) = subtask.timeout() {
            spec = spec.with_timeout(timeout);
        }
        spec
    }

    async fn wait_ready(
        &self,
        handle: &mut ProcessHandle,
        ready: &Pattern,
        deadline: Duration,
        progress: &dyn ProgressSink,
    ) -> Result<Option<TaskOutcome>> {
        loop {
            match handle
                .await_pattern(std::slice::from_ref(ready), self.poll)
                .await
            {
                ExpectOutcome::Matched {
                    before, matched, ..
                } => {
                    progress
                        .output(format!("{}{}", before, matched).as_bytes())
                        .await;
                    return Ok(None);
                }
                ExpectOutcome::Timeout if handle.is_expired() => {
                    handle.terminate();
                    return Err(ArborError::Timeout(deadline));
                }
                ExpectOutcome::Timeout => progress.waiting().await,
                ExpectOutcome::Eof { exit } => {
                    return Ok(Some(TaskOutcome::failed(
                        handle.transcript(),
                        format!("exited before ready prompt ({})", describe_exit(exit)),
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for PtyExecutor {
    #[instrument(skip(self, subtask, progress), fields(task = %subtask.title))]
    async fn execute(&self, subtask: &Subtask, progress: &dyn ProgressSink) -> Result<TaskOutcome> {
        let spec = self.spec_for(subtask);
        let deadline = spec.timeout;
        // The slot is held for the life of the process, not just the spawn
        let (mut handle, _slot) = self
            .resilience
            .call_held(PROCESS_SPAWN, || {
                let spec = spec.clone();
                async move { ProcessHandle::spawn(&spec) }
            })
            .await?;

        if let Some(ready) = &self.ready {
            if let Some(outcome) = self.wait_ready(&mut handle, ready, deadline, progress).await? {
                return Ok(outcome);
            }
        }

        for line in subtask.body.lines() {
            handle.send_line(line)?;
        }
        if self.close_input {
            handle.send("\x04")?;
        }

        let patterns: Vec<Pattern> = self.success.iter().chain(&self.failure).cloned().collect();
        let mut seen = Vec::new();
        loop {
            match handle.read_chunk(self.poll).await {
                ReadOutcome::Data(chunk) => {
                    progress.output(&chunk).await;
                    seen.extend_from_slice(&chunk);
                    if let Some(found) = find_earliest(&patterns, &seen) {
                        handle.terminate();
                        let output = handle.transcript().to_vec();
                        if found.index < self.success.len() {
                            return Ok(TaskOutcome::succeeded(output));
                        }
                        let hit = String::from_utf8_lossy(&seen[found.start..found.end]);
                        return Ok(TaskOutcome::failed(
                            output,
                            format!("failure pattern matched: {}", hit.trim()),
                        ));
                    }
                }
                ReadOutcome::Timeout if handle.is_expired() => {
                    debug!("{} exceeded its deadline", spec.program);
                    handle.terminate();
                    return Err(ArborError::Timeout(deadline));
                }
                ReadOutcome::Timeout => progress.waiting().await,
                ReadOutcome::Eof(exit) => {
                    let output = handle.transcript().to_vec();
                    return Ok(match exit {
                        Some(info) if info.success => TaskOutcome::succeeded(output),
                        other => TaskOutcome::failed(output, describe_exit(other)),
                    });
                }
            }
        }
    }
}

fn describe_exit(exit: Option<ExitInfo>) -> String {
    match exit {
        Some(info) => format!("exited with code {}", info.code),
        None => "exit status unavailable".to_string(),
    }
}

/// What a [`ScriptedExecutor`] does for one attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Script {
    /// Report progress, then succeed with this output
    Succeed(String),
    /// Report progress, then return an unsuccessful outcome
    Fail(String),
    /// Report progress, then error out as a crashed process
    Crash(String),
    /// Refuse to start
    SpawnError(String),
    /// Go quiet for this long without any progress, then succeed
    Silent(Duration),
    /// Never finish
    Hang,
}

/// Start/finish marks recorded by a [`ScriptedExecutor`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Started(String),
    Finished(String),
}

/// Deterministic executor for tests
///
/// Each subtask title has a queue of [`Script`]s consumed one per attempt;
/// once the queue is empty the subtask succeeds.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    delay: Duration,
    chunks: u32,
    live: AtomicUsize,
    peak: AtomicUsize,
    events: Mutex<Vec<ExecEvent>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            chunks: 1,
            ..Self::default()
        }
    }

    pub fn with_script(self, title: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(title.to_string())
            .or_default()
            .push_back(script);
        self
    }

    /// Total running time of every non-silent attempt
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Progress chunks reported over the delay
    pub fn with_chunks(mut self, chunks: u32) -> Self {
        self.chunks = chunks;
        self
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous executions seen
    pub fn peak_live(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls(&self, title: &str) -> u32 {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(title)
            .copied()
            .unwrap_or(0)
    }

    fn next_script(&self, title: &str) -> Script {
        *self
            .calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(title.to_string())
            .or_default() += 1;
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(title)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Script::Succeed(format!("{} done", title)))
    }

    fn record(&self, event: ExecEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    async fn report(&self, title: &str, progress: &dyn ProgressSink) {
        let steps = self.chunks.max(1);
        let step = self.delay / steps;
        for i in 0..steps {
            tokio::time::sleep(step).await;
            progress
                .output(format!("{} step {}/{}\n", title, i + 1, steps).as_bytes())
                .await;
        }
    }
}

/// Tracks one live execution; dropping it (including on cancellation)
/// records the finish
struct LiveGuard<'a> {
    executor: &'a ScriptedExecutor,
    title: String,
}

impl<'a> LiveGuard<'a> {
    fn enter(executor: &'a ScriptedExecutor, title: &str) -> Self {
        executor.record(ExecEvent::Started(title.to_string()));
        let now = executor.live.fetch_add(1, Ordering::SeqCst) + 1;
        executor.peak.fetch_max(now, Ordering::SeqCst);
        Self {
            executor,
            title: title.to_string(),
        }
    }
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.executor.live.fetch_sub(1, Ordering::SeqCst);
        self.executor
            .record(ExecEvent::Finished(std::mem::take(&mut self.title)));
    }
}

#[async_trait]
impl TaskExecutor for ScriptedExecutor {
    async fn execute(&self, subtask: &Subtask, progress: &dyn ProgressSink) -> Result<TaskOutcome> {
        let script = self.next_script(&subtask.title);
        if let Script::SpawnError(msg) = &script {
            return Err(ArborError::Spawn(msg.clone()));
        }

        let _live = LiveGuard::enter(self, &subtask.title);
        match script {
            Script::Hang => std::future::pending::<Result<TaskOutcome>>().await,
            Script::Silent(quiet) => {
                tokio::time::sleep(quiet).await;
                Ok(TaskOutcome::succeeded(format!("{} done", subtask.title)))
            }
            Script::Succeed(output) => {
                self.report(&subtask.title, progress).await;
                Ok(TaskOutcome::succeeded(output))
            }
            Script::Fail(error) => {
                self.report(&subtask.title, progress).await;
                Ok(TaskOutcome::failed(Vec::new(), error))
            }
            Script::Crash(error) => {
                self.report(&subtask.title, progress).await;
                Err(ArborError::ProcessCrash(error))
            }
            Script::SpawnError(msg) => Err(ArborError::Spawn(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use arbor_core::ResilienceConfig;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct RecordingSink {
        output: Mutex<Vec<u8>>,
        waits: AtomicU32,
    }

    #[async_trait]
    impl ProgressSink for RecordingSink {
        async fn output(&self, chunk: &[u8]) {
            self.output.lock().unwrap().extend_from_slice(chunk);
        }

        async fn waiting(&self) {
            self.waits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_scripted_sequence_per_title() {
        let executor = ScriptedExecutor::new()
            .with_script("build", Script::Crash("segfault".into()))
            .with_script("build", Script::Fail("tests red".into()));
        let task = Subtask::new("build", "make");

        assert!(matches!(
            executor.execute(&task, &NullProgress).await,
            Err(ArborError::ProcessCrash(_))
        ));
        let second = executor.execute(&task, &NullProgress).await.unwrap();
        assert!(!second.success);
        let third = executor.execute(&task, &NullProgress).await.unwrap();
        assert!(third.success);
        assert_eq!(executor.calls("build"), 3);
        assert_eq!(executor.live(), 0);
    }

    #[tokio::test]
    async fn test_scripted_reports_progress() {
        let executor = ScriptedExecutor::new()
            .with_delay(Duration::from_millis(20))
            .with_chunks(4);
        let sink = RecordingSink::default();
        executor
            .execute(&Subtask::new("lint", ""), &sink)
            .await
            .unwrap();
        let text = String::from_utf8(sink.output.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_hang_is_released() {
        let executor = ScriptedExecutor::new().with_script("stuck", Script::Hang);
        let task = Subtask::new("stuck", "");
        let result = tokio::time::timeout(
            Duration::from_millis(20),
            executor.execute(&task, &NullProgress),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(executor.live(), 0);
        assert_eq!(
            executor.events(),
            vec![
                ExecEvent::Started("stuck".into()),
                ExecEvent::Finished("stuck".into())
            ]
        );
    }

    fn resilience() -> Arc<ResilienceLayer> {
        Arc::new(ResilienceLayer::new(ResilienceConfig::default()).with_retry(RetryPolicy::none()))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_success_pattern() {
        let spec = ProcessSpec::new("/bin/sh").with_args(["-c", "printf 'ready> '; read x; echo done:$x"]);
        let executor = PtyExecutor::new(spec, resilience())
            .with_ready(Pattern::literal("ready>"))
            .with_success(Pattern::regex(r"done:\w+").unwrap())
            .with_poll(Duration::from_millis(100));
        let sink = RecordingSink::default();

        let outcome = executor
            .execute(&Subtask::new("echo", "hello"), &sink)
            .await
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.output_lossy().contains("done:hello"));
        assert!(!sink.output.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_failure_pattern() {
        let spec = ProcessSpec::new("/bin/sh").with_args(["-c", "echo 'FATAL: disk'; sleep 30"]);
        let executor = PtyExecutor::new(spec, resilience())
            .with_success(Pattern::literal("OK"))
            .with_failure(Pattern::literal("FATAL"));

        let outcome = executor
            .execute(&Subtask::new("disk", ""), &NullProgress)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("FATAL"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_exit_code_decides() {
        let spec = ProcessSpec::new("/bin/sh").with_args(["-c", "exit 2"]);
        let executor = PtyExecutor::new(spec, resilience());
        let outcome = executor
            .execute(&Subtask::new("x", ""), &NullProgress)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("exited with code 2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pty_deadline() {
        let spec = ProcessSpec::new("sleep").with_arg("30");
        let executor = PtyExecutor::new(spec, resilience()).with_poll(Duration::from_millis(50));
        let task = Subtask::new("slow", "").with_timeout(Duration::from_millis(200));
        let sink = RecordingSink::default();

        let result = executor.execute(&task, &sink).await;
        assert!(matches!(result, Err(ArborError::Timeout(_))));
        assert!(sink.waits.load(Ordering::SeqCst) > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_typed_body_does_not_decide_outcome() {
        let spec = ProcessSpec::new("/bin/sh").with_args(["-c", "read x; sleep 0.3; echo FATAL"]);
        let executor = PtyExecutor::new(spec, resilience())
            .with_success(Pattern::literal("proceed"))
            .with_failure(Pattern::literal("FATAL"))
            .with_poll(Duration::from_millis(100));

        let outcome = executor
            .execute(&Subtask::new("ask", "please proceed"), &NullProgress)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.error.as_ref().unwrap().contains("FATAL"));
        assert!(!outcome.output_lossy().contains("please proceed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_bulkhead_bounds_live_processes() {
        let config = ResilienceConfig {
            process_bulkhead: 1,
            ..ResilienceConfig::default()
        };
        let layer = Arc::new(ResilienceLayer::new(config).with_retry(RetryPolicy::none()));
        let spec = ProcessSpec::new("sleep").with_arg("0.4");
        let executor = PtyExecutor::new(spec, Arc::clone(&layer)).with_poll(Duration::from_millis(50));
        let (a, b) = (Subtask::new("a", ""), Subtask::new("b", ""));

        let started = std::time::Instant::now();
        let (first, second) = tokio::join!(
            executor.execute(&a, &NullProgress),
            executor.execute(&b, &NullProgress)
        );
        assert!(first.unwrap().success);
        assert!(second.unwrap().success);
        assert!(started.elapsed() >= Duration::from_millis(800));
        assert_eq!(layer.bulkhead(PROCESS_SPAWN).in_flight(), 0);
    }

    #[tokio::test]
    async fn test_pty_missing_binary() {
        let spec = ProcessSpec::new("/nonexistent/arbor-worker");
        let executor = PtyExecutor::new(spec, resilience());
        let result = executor
            .execute(&Subtask::new("x", ""), &NullProgress)
            .await;
        assert!(matches!(result, Err(ArborError::Spawn(_))));
    }
}
