//! # arbor-agent
//!
//! Everything that touches an external process.
//!
//! - [`ProcessHandle`]: one interactive program on a pseudo-terminal, with
//!   send / expect / read / terminate and a timeout on every blocking call
//! - [`TaskExecutor`]: the opaque "run this subtask" capability, driven
//!   through a PTY ([`PtyExecutor`]) or scripted for tests
//!   ([`ScriptedExecutor`])
//! - [`ResilienceLayer`]: retry with backoff, a circuit breaker and a
//!   bulkhead per operation class

mod bulkhead;
mod circuit_breaker;
mod executor;
mod handle;
mod resilience;
mod retry;

pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use executor::{
    ExecEvent, NullProgress, ProgressSink, PtyExecutor, Script, ScriptedExecutor, TaskExecutor,
};
pub use handle::{
    find_earliest, ExitInfo, ExpectOutcome, Pattern, PatternMatch, ProcessHandle, ProcessSpec,
    ReadOutcome,
};
pub use resilience::{Admission, ResilienceLayer, COORDINATOR_RECURSE, PROCESS_SPAWN};
pub use retry::{is_rejection, retry_with_backoff, RetryPolicy};
