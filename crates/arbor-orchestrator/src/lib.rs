//! # arbor-orchestrator
//!
//! The supervisor tree itself.
//!
//! This crate provides:
//! - [`Coordinator`]: decompose, dispatch (direct or recursive), apply
//!   recovery, aggregate
//! - [`WorkerPool`]: bounded FIFO execution with per-worker records
//! - [`Monitor`]: polling health classification, resource checks, heartbeats
//! - [`RunService`]: asynchronous submit/status/wait/cancel over runs
//! - [`EventLog`]: JSONL audit trail of each run's Monitor events

mod capability;
mod coordinator;
mod event_log;
mod health;
mod monitor;
mod pool;
mod recovery;
mod resources;
mod service;

pub use capability::{
    Aggregate, Aggregator, AlwaysRecurse, ComplexityJudge, Decomposer, LineSplit, MultiLine,
    NeverRecurse, RequireAll, SingleTask,
};
pub use coordinator::{dispatch_decision, Coordinator, Dispatch, RunContext, RunFuture, RunResult};
pub use event_log::EventLog;
pub use health::{classify, Health, Signal, Tracked};
pub use monitor::{InProcessLauncher, Monitor, MonitorHandle, MonitorLauncher};
pub use pool::{WorkerPool, WorkerResult};
pub use recovery::{Applied, RecoveryLedger};
pub use resources::{
    parse_loadavg, parse_meminfo, FixedProbe, ResourceKind, ResourceProbe, ResourceSample,
    SystemProbe,
};
pub use service::{Progress, RunAccepted, RunRequest, RunService, RunStatusReport};
