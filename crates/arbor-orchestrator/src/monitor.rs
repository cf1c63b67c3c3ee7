//! Monitor (supervisor) for one run
//!
//! Polls the Shared State Store through a read-only view, classifies every
//! worker of its run with [`classify`], samples host resources, and emits an
//! ordered stream of [`EventLine`]s. It never touches the Worker Pool: it can
//! only suggest.
//!
//! Two timers drive the loop. The heartbeat timer emits `HEARTBEAT`
//! regardless of worker state; the status timer runs [`Monitor::tick`].
//! A Monitor that cannot read the store several ticks in a row stops, so its
//! Coordinator sees the stream close and restarts it instead of trusting
//! heartbeats from a blind Monitor.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use arbor_core::{
    ArborConfig, ArborError, Clock, EventLine, MonitorEvent, ReadOnlyStore, RecoveryAction, Result, RunId,
    StateReader, StateStore, WarningKind, WorkerId, WorkerRecord,
};

use crate::health::{classify, Signal, Tracked};
use crate::resources::{ResourceKind, ResourceProbe};

/// Events buffered between the Monitor and its Coordinator
const EVENT_BUFFER: usize = 256;
/// Consecutive failed ticks before the Monitor gives up
const MAX_FAILED_TICKS: u32 = 3;

pub struct Monitor {
    run_id: RunId,
    reader: Arc<dyn StateReader>,
    config: Arc<ArborConfig>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn ResourceProbe>,
    tracked: HashMap<WorkerId, Tracked>,
    attempts: HashMap<WorkerId, u32>,
    open_errors: HashSet<WorkerId>,
    alarms: BTreeSet<ResourceKind>,
    parallelism: usize,
    started_at: DateTime<Utc>,
    grace_warned: bool,
    finished: bool,
    next_seq: u64,
}

impl Monitor {
    pub fn new(
        run_id: RunId,
        reader: Arc<dyn StateReader>,
        config: Arc<ArborConfig>,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let started_at = clock.now();
        let parallelism = config.limits.max_concurrency;
        Self {
            run_id,
            reader,
            config,
            clock,
            probe,
            tracked: HashMap::new(),
            attempts: HashMap::new(),
            open_errors: HashSet::new(),
            alarms: BTreeSet::new(),
            parallelism,
            started_at,
            grace_warned: false,
            finished: false,
            next_seq: 0,
        }
    }

    /// Continue numbering after a previous Monitor instance
    pub fn with_first_seq(mut self, seq: u64) -> Self {
        self.next_seq = seq;
        self
    }

    /// Pool cap the resource suggestions are halved from
    pub fn with_parallelism(mut self, current: usize) -> Self {
        self.parallelism = current.max(1);
        self
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Workers with an unresolved `ERROR_DETECTED`
    pub fn open_errors(&self) -> usize {
        self.open_errors.len()
    }

    /// One polling pass over the run
    pub async fn tick(&mut self) -> Result<Vec<MonitorEvent>> {
        if self.finished {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let settled = match self.reader.get_run(&self.run_id).await? {
            Some(run) => run.settled,
            None => BTreeSet::new(),
        };
        let workers = self.reader.list_workers(&self.run_id).await?;
        let mut events = Vec::new();

        let present: HashSet<&WorkerId> = workers.iter().map(|w| &w.worker_id).collect();
        let missing: Vec<WorkerId> = self
            .tracked
            .keys()
            .filter(|id| !present.contains(id))
            .cloned()
            .collect();

        for record in &workers {
            self.observe(record.worker_id.clone(), Some(record), &settled, now, &mut events);
        }
        for worker_id in missing {
            self.observe(worker_id, None, &settled, now, &mut events);
        }

        self.check_resources(&mut events);

        if self.tracked.is_empty()
            && !self.grace_warned
            && (now - self.started_at).to_std().unwrap_or_default() > self.config.timing.startup_grace()
        {
            self.grace_warned = true;
            events.push(MonitorEvent::Warning {
                warning: WarningKind::StartupGrace,
                worker_id: None,
                detail: format!(
                    "no workers observed within {}ms",
                    self.config.timing.startup_grace_ms
                ),
            });
        }

        // A settled worker is done as far as its Coordinator is concerned,
        // even if its final record never landed
        if !workers.is_empty()
            && workers
                .iter()
                .all(|w| w.is_terminal() || settled.contains(&w.worker_id))
            && self.open_errors.is_empty()
        {
            info!(run_id = %self.run_id, workers = workers.len(), "All workers terminal");
            self.finished = true;
            events.push(MonitorEvent::NoIssuesDetected);
        }

        Ok(events)
    }

    fn observe(
        &mut self,
        worker_id: WorkerId,
        record: Option<&WorkerRecord>,
        settled: &BTreeSet<WorkerId>,
        now: DateTime<Utc>,
        events: &mut Vec<MonitorEvent>,
    ) {
        let timeout = self.config.timing.worker_timeout();
        let prev = self.tracked.get(&worker_id).copied().unwrap_or_default();
        let (next, signal) = classify(prev, record, now, timeout);
        self.tracked.insert(worker_id.clone(), next);
        if let Some(record) = record {
            self.attempts.insert(worker_id.clone(), record.attempt);
        }

        // Already acted on by the Coordinator
        if settled.contains(&worker_id) {
            self.open_errors.remove(&worker_id);
            return;
        }

        let attempt = self.attempts.get(&worker_id).copied().unwrap_or(1);
        let exhausted = attempt >= self.config.limits.max_task_attempts;

        match signal {
            None => {}
            Some(Signal::Slow) => {
                let quiet_ms = record
                    .map(|r| (now - r.last_update).num_milliseconds())
                    .unwrap_or_default();
                debug!(worker_id = %worker_id, quiet_ms, "Worker slow");
                events.push(MonitorEvent::Warning {
                    warning: WarningKind::SlowWorker,
                    worker_id: Some(worker_id),
                    detail: format!("no update for {}ms", quiet_ms),
                });
            }
            Some(Signal::Stalled) => {
                warn!(worker_id = %worker_id, attempt, "Worker stalled");
                self.open_errors.insert(worker_id.clone());
                events.push(MonitorEvent::ErrorDetected {
                    worker_id: Some(worker_id.clone()),
                    detail: format!("no update for over {}ms", timeout.as_millis()),
                });
                let action = if exhausted {
                    RecoveryAction::Skip { worker_id }
                } else {
                    RecoveryAction::retry(worker_id, timeout * 2)
                };
                events.push(MonitorEvent::suggest(action));
            }
            Some(Signal::Crashed(reason)) => {
                warn!(worker_id = %worker_id, attempt, "Worker crashed: {}", reason);
                self.open_errors.insert(worker_id.clone());
                events.push(MonitorEvent::ErrorDetected {
                    worker_id: Some(worker_id.clone()),
                    detail: reason.clone(),
                });
                let action = if exhausted {
                    RecoveryAction::Escalate {
                        worker_id: Some(worker_id),
                        reason: format!("failed after {} attempts: {}", attempt, reason),
                    }
                } else {
                    RecoveryAction::Restart {
                        worker_id,
                        clean_state: true,
                    }
                };
                events.push(MonitorEvent::suggest(action));
            }
            Some(Signal::Recovered) => {
                info!(worker_id = %worker_id, "Worker recovered");
                self.open_errors.remove(&worker_id);
            }
            Some(Signal::Finished) => {
                self.open_errors.remove(&worker_id);
            }
        }
    }

    fn check_resources(&mut self, events: &mut Vec<MonitorEvent>) {
        let sample = match self.probe.sample() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(run_id = %self.run_id, "Resource sample failed: {}", e);
                return;
            }
        };
        let over = sample.exceeded(&self.config.resources);
        let current: BTreeSet<ResourceKind> = over.iter().map(|(kind, _)| *kind).collect();

        for (kind, value) in over {
            // Once per excursion
            if !self.alarms.insert(kind) {
                continue;
            }
            let new_max = (self.parallelism / 2).max(1);
            self.parallelism = new_max;
            warn!(run_id = %self.run_id, %kind, value, new_max, "Resource threshold exceeded");
            events.push(MonitorEvent::Warning {
                warning: WarningKind::Resource,
                worker_id: None,
                detail: format!("{} at {:.1}%", kind, value),
            });
            events.push(MonitorEvent::suggest(RecoveryAction::ReduceParallelism {
                new_max,
            }));
        }
        self.alarms.retain(|kind| current.contains(kind));
    }

    fn wrap(&mut self, event: MonitorEvent) -> EventLine {
        let line = EventLine {
            seq: self.next_seq,
            run_id: self.run_id.clone(),
            emitted_at: self.clock.now(),
            event,
        };
        self.next_seq += 1;
        line
    }

    /// Run the poll loop until finished, cancelled, or the receiver is gone
    pub fn spawn(mut self, tx: mpsc::Sender<EventLine>, cancel: CancellationToken) -> JoinHandle<()> {
        let heartbeat_every = self.config.timing.monitor_heartbeat_interval();
        let poll_every = self.config.timing.status_check_interval();

        tokio::spawn(async move {
            let mut heartbeat = interval(heartbeat_every);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut poll = interval(poll_every);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(run_id = %self.run_id, "Monitor started");
            let mut failed_ticks = 0u32;

            loop {
                let events = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = heartbeat.tick() => vec![MonitorEvent::Heartbeat {
                        timestamp: self.clock.now(),
                    }],
                    _ = poll.tick() => match self.tick().await {
                        Ok(events) => {
                            failed_ticks = 0;
                            events
                        }
                        Err(e) => {
                            failed_ticks += 1;
                            let failure = ArborError::MonitorFailure(format!(
                                "tick {} of {} failed: {}",
                                failed_ticks, MAX_FAILED_TICKS, e
                            ));
                            warn!(run_id = %self.run_id, "{}", failure);
                            if failed_ticks >= MAX_FAILED_TICKS {
                                break;
                            }
                            continue;
                        }
                    },
                };
                for event in events {
                    let line = self.wrap(event);
                    if tx.send(line).await.is_err() {
                        debug!(run_id = %self.run_id, "Event receiver dropped");
                        return;
                    }
                }
                if self.finished {
                    break;
                }
            }
            info!(run_id = %self.run_id, "Monitor stopped");
        })
    }
}

/// A running Monitor as seen by its Coordinator
pub struct MonitorHandle {
    pub events: mpsc::Receiver<EventLine>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub fn new(
        events: mpsc::Receiver<EventLine>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            events,
            cancel,
            task,
        }
    }

    /// Signal the Monitor, then abort it if it outlives `grace`
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            warn!("Monitor ignored cancellation; aborting");
            self.task.abort();
        }
    }
}

/// Starts Monitors for a Coordinator (restarts included)
pub trait MonitorLauncher: Send + Sync {
    /// `first_seq` continues the run's event numbering across restarts
    fn launch(&self, run_id: &RunId, first_seq: u64, parallelism: usize) -> MonitorHandle;
}

/// Runs the Monitor as a task in this process
pub struct InProcessLauncher {
    store: Arc<dyn StateStore>,
    config: Arc<ArborConfig>,
    clock: Arc<dyn Clock>,
    probe: Arc<dyn ResourceProbe>,
}

impl InProcessLauncher {
    pub fn new(
        store: Arc<dyn StateStore>,
        config: Arc<ArborConfig>,
        clock: Arc<dyn Clock>,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            probe,
        }
    }
}

impl MonitorLauncher for InProcessLauncher {
    fn launch(&self, run_id: &RunId, first_seq: u64, parallelism: usize) -> MonitorHandle {
        let reader: Arc<dyn StateReader> = Arc::new(ReadOnlyStore::new(Arc::clone(&self.store)));
        let monitor = Monitor::new(
            run_id.clone(),
            reader,
            Arc::clone(&self.config),
            Arc::clone(&self.clock),
            Arc::clone(&self.probe),
        )
        .with_first_seq(first_seq)
        .with_parallelism(parallelism);

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();
        let task = monitor.spawn(tx, cancel.clone());
        MonitorHandle::new(rx, cancel, task)
    }
}
