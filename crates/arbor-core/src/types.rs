//! Core type definitions for the supervisor tree

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::{ArborError, Result};

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh random identifier
            pub fn new() -> Self {
                let hex = Uuid::new_v4().simple().to_string();
                Self(format!("{}-{}", $prefix, &hex[..12]))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

prefixed_id!(
    /// Identifier of one Coordinator invocation
    RunId,
    "run"
);
prefixed_id!(
    /// Identifier of one worker (one execution attempt of a subtask)
    WorkerId,
    "wkr"
);
prefixed_id!(
    /// Identifier of one recovery suggestion instance
    ActionId,
    "act"
);

/// Lifecycle of a Run Record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Planning,
    Executing,
    Recovering,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Executing => write!(f, "executing"),
            Self::Recovering => write!(f, "recovering"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "recovering" => Ok(Self::Recovering),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Lifecycle of a Worker Record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Pending,
    Spawning,
    Running,
    Waiting,
    Completed,
    Failed,
    Terminated,
}

impl WorkerStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Terminated)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Spawning => write!(f, "spawning"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "spawning" => Ok(Self::Spawning),
            "running" => Ok(Self::Running),
            "waiting" => Ok(Self::Waiting),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Invalid worker status: {}", s)),
        }
    }
}

/// One record per Coordinator invocation
///
/// Written only by the Coordinator that owns the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    /// Recursion level, 0 at the top
    pub depth: u32,
    #[serde(default)]
    pub parent_run_id: Option<RunId>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
    /// First line of the request this run was started with
    #[serde(default)]
    pub request: String,
    /// Recursion ceiling in force for this run
    #[serde(default)]
    pub max_depth: u32,
    /// Workers whose failure the Coordinator has already acted on
    #[serde(default)]
    pub settled: BTreeSet<WorkerId>,
    #[serde(default)]
    pub degraded: bool,
}

impl RunRecord {
    pub fn new(run_id: RunId, depth: u32, max_depth: u32, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            depth,
            parent_run_id: None,
            status: RunStatus::Planning,
            created_at: now,
            updated_at: now,
            error: None,
            request: String::new(),
            max_depth,
            settled: BTreeSet::new(),
            degraded: false,
        }
    }

    pub fn with_parent(mut self, parent: RunId) -> Self {
        self.parent_run_id = Some(parent);
        self
    }

    pub fn with_request(mut self, request: &str) -> Self {
        self.request = request.lines().next().unwrap_or_default().to_string();
        self
    }

    /// Move to a new status, refusing to leave a terminal one
    pub fn set_status(&mut self, status: RunStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() && self.status != status {
            return Err(ArborError::TerminalRecord(self.run_id.to_string()));
        }
        self.status = status;
        self.updated_at = self.updated_at.max(now);
        Ok(())
    }

    /// Whether the Coordinator may still recurse below this run
    pub fn can_recurse(&self) -> bool {
        self.depth < self.max_depth
    }
}

/// One record per worker, written only by the worker's own execution task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub run_id: RunId,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    /// Heartbeat timestamp, never moves backwards
    pub last_update: DateTime<Utc>,
    pub task_summary: String,
    #[serde(default)]
    pub error: Option<String>,
    /// Stable id of the subtask across resubmissions
    #[serde(default)]
    pub lineage: String,
    /// 1-based attempt number within the lineage
    #[serde(default = "default_attempt")]
    pub attempt: u32,
}

fn default_attempt() -> u32 {
    1
}

impl WorkerRecord {
    pub fn new(
        worker_id: WorkerId,
        run_id: RunId,
        task_summary: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id,
            run_id,
            status: WorkerStatus::Pending,
            started_at: now,
            last_update: now,
            task_summary: task_summary.into(),
            error: None,
            lineage: String::new(),
            attempt: 1,
        }
    }

    pub fn with_lineage(mut self, lineage: impl Into<String>, attempt: u32) -> Self {
        self.lineage = lineage.into();
        self.attempt = attempt;
        self
    }

    /// Advance the heartbeat (monotonic)
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_update = self.last_update.max(now);
    }

    /// Change status and heartbeat together; terminal records are frozen
    pub fn transition(&mut self, status: WorkerStatus, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(ArborError::TerminalRecord(self.worker_id.to_string()));
        }
        self.status = status;
        self.touch(now);
        Ok(())
    }

    /// Terminal transition carrying an error message
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        self.transition(WorkerStatus::Failed, now)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A unit of work handed to the Worker Pool
///
/// Contents are opaque to the supervisor; only `title` is surfaced in records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub title: String,
    pub body: String,
    /// Hard execution deadline for one attempt
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Ask the executor to start from a clean working state
    #[serde(default)]
    pub clean_state: bool,
}

impl Subtask {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            timeout_ms: None,
            clean_state: false,
        }
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }
}

/// Raw result of executing one subtask
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    #[serde(default)]
    pub output: Vec<u8>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded(output: impl Into<Vec<u8>>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(output: impl Into<Vec<u8>>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
        }
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).to_string()
    }
}
