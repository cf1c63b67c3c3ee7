//! Opaque capabilities consumed by the Coordinator
//!
//! How a request is split, whether a subtask is worth a nested Coordinator,
//! and how results are merged are all outside the supervisor's contract.
//! These traits are the seams; the implementations here are the simple,
//! deterministic ones the CLI and the tests use.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use arbor_core::{ArborError, Result, RunStatus, Subtask, WorkerStatus};

use crate::coordinator::RunResult;
use crate::pool::WorkerResult;

/// Splits a request into subtasks
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, request: &str) -> Result<Vec<Subtask>>;
}

/// Decides whether a subtask should get its own Coordinator
pub trait ComplexityJudge: Send + Sync {
    fn wants_recursion(&self, subtask: &Subtask, depth: u32) -> bool;
}

/// Merged verdict over one run's results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aggregate {
    pub success: bool,
    pub summary: String,
}

/// Merges worker and child results into a verdict
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, workers: &[WorkerResult], children: &[RunResult]) -> Result<Aggregate>;
}

/// The whole request is one subtask
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleTask;

#[async_trait]
impl Decomposer for SingleTask {
    async fn decompose(&self, request: &str) -> Result<Vec<Subtask>> {
        let request = request.trim();
        if request.is_empty() {
            return Err(ArborError::Config("empty request".into()));
        }
        let title = request.lines().next().unwrap_or(request).trim();
        Ok(vec![Subtask::new(title, request)])
    }
}

/// One subtask per unindented line; indented lines below it form its body
///
/// ```text
/// build the parser        <- subtask "build the parser"
///   lexer                 <- its body, dedented: "lexer\ngrammar"
///   grammar
/// write docs              <- subtask "write docs"
/// ```
///
/// A subtask without indented lines has its title as its body.
#[derive(Debug, Clone, Copy, Default)]
pub struct LineSplit;

impl LineSplit {
    pub fn split(request: &str) -> Vec<Subtask> {
        let mut tasks: Vec<(String, Vec<String>)> = Vec::new();
        let mut indent: Option<usize> = None;

        for line in request.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let leading = line.len() - line.trim_start().len();
            match tasks.last_mut() {
                Some((_, body)) if leading > 0 => {
                    let strip = *indent.get_or_insert(leading);
                    let cut = leading.min(strip);
                    let rest = line.get(cut..).unwrap_or_else(|| line.trim_start());
                    body.push(rest.trim_end().to_string());
                }
                _ => {
                    tasks.push((line.trim().to_string(), Vec::new()));
                    indent = None;
                }
            }
        }

        tasks
            .into_iter()
            .map(|(title, body)| {
                let body = if body.is_empty() {
                    title.clone()
                } else {
                    body.join("\n")
                };
                Subtask::new(title, body)
            })
            .collect()
    }
}

#[async_trait]
impl Decomposer for LineSplit {
    async fn decompose(&self, request: &str) -> Result<Vec<Subtask>> {
        let tasks = Self::split(request);
        if tasks.is_empty() {
            return Err(ArborError::Config("empty request".into()));
        }
        Ok(tasks)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRecurse;

impl ComplexityJudge for NeverRecurse {
    fn wants_recursion(&self, _subtask: &Subtask, _depth: u32) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRecurse;

impl ComplexityJudge for AlwaysRecurse {
    fn wants_recursion(&self, _subtask: &Subtask, _depth: u32) -> bool {
        true
    }
}

/// Recurse when the body itself has several lines of work
#[derive(Debug, Clone, Copy)]
pub struct MultiLine {
    pub min_lines: usize,
}

impl Default for MultiLine {
    fn default() -> Self {
        Self { min_lines: 2 }
    }
}

impl ComplexityJudge for MultiLine {
    fn wants_recursion(&self, subtask: &Subtask, _depth: u32) -> bool {
        subtask
            .body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .count()
            >= self.min_lines
    }
}

/// Succeeds only if every lineage's last attempt finished and every child
/// run completed
///
/// A lineage that was skipped (last attempt terminated) does not fail the
/// run; a lineage whose last attempt failed does.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireAll;

#[async_trait]
impl Aggregator for RequireAll {
    async fn aggregate(&self, workers: &[WorkerResult], children: &[RunResult]) -> Result<Aggregate> {
        let mut latest: HashMap<&str, &WorkerResult> = HashMap::new();
        for worker in workers {
            let slot = latest.entry(worker.lineage.as_str()).or_insert(worker);
            if worker.attempt > slot.attempt {
                *slot = worker;
            }
        }

        let mut failed: Vec<String> = latest
            .values()
            .filter(|w| !matches!(w.status, WorkerStatus::Completed | WorkerStatus::Terminated))
            .map(|w| format!("{} ({})", w.title, w.error.as_deref().unwrap_or("failed")))
            .collect();
        failed.sort();
        failed.extend(
            children
                .iter()
                .filter(|c| c.status != RunStatus::Completed)
                .map(|c| format!("child {}", c.run_id)),
        );

        let completed = latest
            .values()
            .filter(|w| w.status == WorkerStatus::Completed)
            .count()
            + children
                .iter()
                .filter(|c| c.status == RunStatus::Completed)
                .count();

        if failed.is_empty() {
            Ok(Aggregate {
                success: true,
                summary: format!("{} parts completed", completed),
            })
        } else {
            Ok(Aggregate {
                success: false,
                summary: format!("{} parts completed; failed: {}", completed, failed.join(", ")),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::WorkerId;

    fn result(lineage: &str, attempt: u32, status: WorkerStatus) -> WorkerResult {
        WorkerResult {
            worker_id: WorkerId::new(),
            title: lineage.to_string(),
            lineage: lineage.to_string(),
            attempt,
            status,
            outcome: None,
            error: None,
        }
    }

    #[test]
    fn test_line_split() {
        let tasks = LineSplit::split("build parser\n  lexer\n    tokens\n  grammar\n\nwrite docs\n");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "build parser");
        assert_eq!(tasks[0].body, "lexer\n  tokens\ngrammar");
        assert_eq!(tasks[1].body, "write docs");
    }

    #[tokio::test]
    async fn test_empty_request_rejected() {
        assert!(LineSplit.decompose("  \n\n").await.is_err());
        assert!(SingleTask.decompose("").await.is_err());
    }

    #[test]
    fn test_multi_line_judge() {
        let judge = MultiLine::default();
        assert!(!judge.wants_recursion(&Subtask::new("a", "one"), 0));
        assert!(judge.wants_recursion(&Subtask::new("a", "one\ntwo"), 0));
    }

    #[tokio::test]
    async fn test_latest_attempt_decides() {
        let workers = vec![
            result("a", 1, WorkerStatus::Failed),
            result("a", 2, WorkerStatus::Completed),
            result("b", 1, WorkerStatus::Terminated),
        ];
        let verdict = RequireAll.aggregate(&workers, &[]).await.unwrap();
        assert!(verdict.success);

        let workers = vec![
            result("a", 1, WorkerStatus::Terminated),
            result("a", 2, WorkerStatus::Failed),
        ];
        let verdict = RequireAll.aggregate(&workers, &[]).await.unwrap();
        assert!(!verdict.success);
    }
}
