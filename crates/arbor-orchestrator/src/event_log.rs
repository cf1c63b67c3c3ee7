//! Event Log - append-only audit trail of each run's Monitor events
//!
//! One JSONL file per run under `<state_dir>/events/`. Appends are fail-open:
//! losing an audit line never takes a run down.

use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use arbor_core::fail_open::fail_open;
use arbor_core::{EventLine, Result, RunId};

pub struct EventLog {
    dir: PathBuf,
}

impl EventLog {
    /// Log rooted at `state_dir/events`
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("events"),
        }
    }

    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }

    /// Append one line
    ///
    /// This operation is fail-open - write failures are only logged
    pub async fn append(&self, line: &EventLine) {
        fail_open("event_log::append", || self.append_internal(line)).await;
    }

    async fn append_internal(&self, line: &EventLine) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let mut text = line.to_line()?;
        text.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(&line.run_id))
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every readable line for `run_id`, in append order
    ///
    /// A run with no log yields an empty list. Lines that fail to parse are
    /// skipped.
    pub async fn replay(&self, run_id: &RunId) -> Result<Vec<EventLine>> {
        let content = match fs::read_to_string(self.path_for(run_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = Vec::new();
        for (n, raw) in content.lines().enumerate() {
            if raw.trim().is_empty() {
                continue;
            }
            match EventLine::from_line(raw) {
                Ok(line) => lines.push(line),
                Err(e) => warn!(run_id = %run_id, line = n + 1, "Skipping bad event line: {}", e),
            }
        }
        Ok(lines)
    }
}
