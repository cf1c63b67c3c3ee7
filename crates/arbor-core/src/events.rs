//! Monitor events and recovery actions
//!
//! The Monitor emits an ordered, append-only stream of [`EventLine`]s for one
//! run. Each line is a self-contained JSON object so the stream can be written
//! to a log and replayed later.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ActionId, Result, RunId, WorkerId};

/// Recovery proposed by the Monitor and applied by the Coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Resubmit a stalled worker's subtask with a longer deadline
    Retry { worker_id: WorkerId, new_timeout_ms: u64 },
    /// Resubmit a crashed worker's subtask
    Restart { worker_id: WorkerId, clean_state: bool },
    /// Lower the pool's concurrency cap
    ReduceParallelism { new_max: usize },
    /// Give up on a worker and continue without it
    Skip { worker_id: WorkerId },
    /// Hand the problem to the caller
    Escalate {
        #[serde(default)]
        worker_id: Option<WorkerId>,
        reason: String,
    },
}

impl RecoveryAction {
    pub fn retry(worker_id: WorkerId, new_timeout: Duration) -> Self {
        Self::Retry {
            worker_id,
            new_timeout_ms: new_timeout.as_millis() as u64,
        }
    }

    /// The worker this action targets, if any
    pub fn worker_id(&self) -> Option<&WorkerId> {
        match self {
            Self::Retry { worker_id, .. }
            | Self::Restart { worker_id, .. }
            | Self::Skip { worker_id } => Some(worker_id),
            Self::Escalate { worker_id, .. } => worker_id.as_ref(),
            Self::ReduceParallelism { .. } => None,
        }
    }
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retry {
                worker_id,
                new_timeout_ms,
            } => write!(f, "retry({}, {}ms)", worker_id, new_timeout_ms),
            Self::Restart {
                worker_id,
                clean_state,
            } => write!(f, "restart({}, clean_state={})", worker_id, clean_state),
            Self::ReduceParallelism { new_max } => write!(f, "reduce_parallelism({})", new_max),
            Self::Skip { worker_id } => write!(f, "skip({})", worker_id),
            Self::Escalate { reason, .. } => write!(f, "escalate({})", reason),
        }
    }
}

/// What a WARNING is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    SlowWorker,
    Resource,
    StartupGrace,
}

/// The five kinds of Monitor output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MonitorEvent {
    ErrorDetected {
        #[serde(default)]
        worker_id: Option<WorkerId>,
        detail: String,
    },
    SuggestRecovery {
        action_id: ActionId,
        action: RecoveryAction,
    },
    Warning {
        warning: WarningKind,
        #[serde(default)]
        worker_id: Option<WorkerId>,
        detail: String,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    NoIssuesDetected,
}

impl MonitorEvent {
    pub fn suggest(action: RecoveryAction) -> Self {
        Self::SuggestRecovery {
            action_id: ActionId::new(),
            action,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ErrorDetected { .. } => "ERROR_DETECTED",
            Self::SuggestRecovery { .. } => "SUGGEST_RECOVERY",
            Self::Warning { .. } => "WARNING",
            Self::Heartbeat { .. } => "HEARTBEAT",
            Self::NoIssuesDetected => "NO_ISSUES_DETECTED",
        }
    }
}

/// One emitted event with its position in the run's stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLine {
    pub seq: u64,
    pub run_id: RunId,
    pub emitted_at: DateTime<Utc>,
    pub event: MonitorEvent,
}

impl EventLine {
    /// Serialize as a single line (no trailing newline)
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_line_is_single_line() {
        let line = EventLine {
            seq: 7,
            run_id: RunId::from("run-abc"),
            emitted_at: Utc::now(),
            event: MonitorEvent::suggest(RecoveryAction::Restart {
                worker_id: WorkerId::from("wkr-1"),
                clean_state: true,
            }),
        };
        let text = line.to_line().unwrap();
        assert!(!text.contains('\n'));
        assert!(text.contains("\"kind\":\"SUGGEST_RECOVERY\""));
        assert!(text.contains("\"action\":\"restart\""));
        assert_eq!(EventLine::from_line(&text).unwrap(), line);
    }

    #[test]
    fn test_no_issues_wire_format() {
        let json = serde_json::to_string(&MonitorEvent::NoIssuesDetected).unwrap();
        assert_eq!(json, r#"{"kind":"NO_ISSUES_DETECTED"}"#);
    }

    #[test]
    fn test_action_targets() {
        let w = WorkerId::from("wkr-9");
        assert_eq!(
            RecoveryAction::retry(w.clone(), Duration::from_secs(2)).worker_id(),
            Some(&w)
        );
        assert_eq!(
            RecoveryAction::ReduceParallelism { new_max: 1 }.worker_id(),
            None
        );
        assert_eq!(
            RecoveryAction::retry(w, Duration::from_millis(1500)).to_string(),
            "retry(wkr-9, 1500ms)"
        );
    }
}
