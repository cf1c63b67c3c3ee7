//! Recovery application for the Coordinator
//!
//! The Monitor suggests, the ledger applies. Every action instance is applied
//! at most once (keyed by its [`ActionId`]), and once a worker has been acted
//! on it is *settled*: later suggestions about the same worker are ignored,
//! so the first suggestion to arrive wins.

use std::collections::{BTreeSet, HashSet};

use tracing::{info, warn};

use arbor_core::{ActionId, RecoveryAction, Result, StateReader, WorkerId, WorkerStatus};

use crate::pool::WorkerPool;

/// What applying one suggestion did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A fresh attempt replaced the old worker
    Resubmitted {
        previous: WorkerId,
        replacement: WorkerId,
    },
    Skipped(WorkerId),
    Escalated {
        worker_id: Option<WorkerId>,
        reason: String,
    },
    Reduced {
        new_max: usize,
    },
    /// Valid but nothing to do
    NoOp(String),
    /// Already applied this action instance
    Duplicate,
}

impl Applied {
    /// Whether the worker set or the pool changed
    pub fn changed(&self) -> bool {
        !matches!(self, Self::NoOp(_) | Self::Duplicate)
    }
}

#[derive(Debug, Default)]
pub struct RecoveryLedger {
    applied: HashSet<ActionId>,
    settled: BTreeSet<WorkerId>,
}

impl RecoveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Workers already acted on
    pub fn settled(&self) -> &BTreeSet<WorkerId> {
        &self.settled
    }

    pub fn is_applied(&self, action_id: &ActionId) -> bool {
        self.applied.contains(action_id)
    }

    /// Stop acting on a worker without applying anything to it
    ///
    /// Returns `false` if it was already settled.
    pub fn settle(&mut self, worker_id: WorkerId) -> bool {
        self.settled.insert(worker_id)
    }

    /// Apply one suggestion against the pool
    ///
    /// `max_attempts` bounds each lineage: a retry or restart past the budget
    /// becomes a skip.
    pub async fn apply<R>(
        &mut self,
        action_id: &ActionId,
        action: &RecoveryAction,
        pool: &WorkerPool,
        reader: &R,
        max_attempts: u32,
    ) -> Result<Applied>
    where
        R: StateReader + ?Sized,
    {
        if !self.applied.insert(action_id.clone()) {
            return Ok(Applied::Duplicate);
        }

        let mut attempt = 1;
        if let Some(worker_id) = action.worker_id() {
            if self.settled.contains(worker_id) {
                return Ok(Applied::NoOp(format!("{} already settled", worker_id)));
            }
            if let Some(record) = reader.get_worker(pool.run_id(), worker_id).await? {
                if matches!(
                    record.status,
                    WorkerStatus::Completed | WorkerStatus::Terminated
                ) {
                    return Ok(Applied::NoOp(format!(
                        "{} already {}",
                        worker_id, record.status
                    )));
                }
                attempt = record.attempt;
            }
        }

        let applied = match action {
            RecoveryAction::Retry {
                worker_id,
                new_timeout_ms,
            } => {
                if attempt >= max_attempts {
                    self.skip(pool, worker_id).await?
                } else {
                    let timeout_ms = *new_timeout_ms;
                    self.replace(pool, worker_id, |task| task.timeout_ms = Some(timeout_ms))
                        .await?
                }
            }
            RecoveryAction::Restart {
                worker_id,
                clean_state,
            } => {
                if attempt >= max_attempts {
                    self.skip(pool, worker_id).await?
                } else {
                    let clean_state = *clean_state;
                    self.replace(pool, worker_id, |task| task.clean_state = clean_state)
                        .await?
                }
            }
            RecoveryAction::Skip { worker_id } => self.skip(pool, worker_id).await?,
            RecoveryAction::Escalate { worker_id, reason } => {
                if let Some(worker_id) = worker_id {
                    pool.terminate(worker_id).await?;
                    self.settled.insert(worker_id.clone());
                }
                warn!(run_id = %pool.run_id(), "Escalated: {}", reason);
                Applied::Escalated {
                    worker_id: worker_id.clone(),
                    reason: reason.clone(),
                }
            }
            RecoveryAction::ReduceParallelism { new_max } => Applied::Reduced {
                new_max: pool.set_max_concurrency(*new_max),
            },
        };

        info!(run_id = %pool.run_id(), action_id = %action_id, %action, "Applied recovery");
        Ok(applied)
    }

    /// Resubmit first, terminate second, so the run never looks drained
    async fn replace<F>(
        &mut self,
        pool: &WorkerPool,
        worker_id: &WorkerId,
        adjust: F,
    ) -> Result<Applied>
    where
        F: FnOnce(&mut arbor_core::Subtask),
    {
        let replacement = pool.resubmit(worker_id, adjust).await?;
        pool.terminate(worker_id).await?;
        self.settled.insert(worker_id.clone());
        Ok(Applied::Resubmitted {
            previous: worker_id.clone(),
            replacement,
        })
    }

    async fn skip(&mut self, pool: &WorkerPool, worker_id: &WorkerId) -> Result<Applied> {
        pool.terminate(worker_id).await?;
        self.settled.insert(worker_id.clone());
        Ok(Applied::Skipped(worker_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_agent::{Script, ScriptedExecutor};
    use arbor_core::{MemoryStateStore, RunId, Subtask, SystemClock};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn setup(executor: ScriptedExecutor) -> (WorkerPool, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let pool = WorkerPool::new(
            RunId::new(),
            store.clone(),
            Arc::new(executor),
            Arc::new(SystemClock),
            4,
            CancellationToken::new(),
        );
        (pool, store)
    }

    #[tokio::test]
    async fn test_same_action_twice_applies_once() {
        let (pool, store) = setup(ScriptedExecutor::new().with_script("t", Script::Hang));
        let worker = pool.submit(Subtask::new("t", "")).await.unwrap();

        let mut ledger = RecoveryLedger::new();
        let id = ActionId::new();
        let action = RecoveryAction::retry(worker.clone(), Duration::from_secs(4));

        let first = ledger.apply(&id, &action, &pool, store.as_ref(), 3).await.unwrap();
        assert!(matches!(first, Applied::Resubmitted { .. }));
        let second = ledger.apply(&id, &action, &pool, store.as_ref(), 3).await.unwrap();
        assert_eq!(second, Applied::Duplicate);
        assert_eq!(pool.submitted(), 2);

        pool.terminate_all().await;
        pool.wait_idle().await;
    }

    #[tokio::test]
    async fn test_first_suggestion_wins() {
        let (pool, store) = setup(ScriptedExecutor::new().with_script("t", Script::Hang));
        let worker = pool.submit(Subtask::new("t", "")).await.unwrap();
        let mut ledger = RecoveryLedger::new();

        let retry = RecoveryAction::retry(worker.clone(), Duration::from_secs(4));
        let restart = RecoveryAction::Restart {
            worker_id: worker.clone(),
            clean_state: true,
        };
        ledger
            .apply(&ActionId::new(), &retry, &pool, store.as_ref(), 3)
            .await
            .unwrap();
        let later = ledger
            .apply(&ActionId::new(), &restart, &pool, store.as_ref(), 3)
            .await
            .unwrap();
        assert!(matches!(later, Applied::NoOp(_)));
        assert_eq!(pool.submitted(), 2);
        assert!(ledger.settled().contains(&worker));

        pool.terminate_all().await;
        pool.wait_idle().await;
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips() {
        let (pool, store) = setup(ScriptedExecutor::new().with_script("t", Script::Hang));
        let worker = pool.submit(Subtask::new("t", "")).await.unwrap();
        let mut ledger = RecoveryLedger::new();
        let action = RecoveryAction::Restart {
            worker_id: worker.clone(),
            clean_state: true,
        };
        let applied = ledger
            .apply(&ActionId::new(), &action, &pool, store.as_ref(), 1)
            .await
            .unwrap();
        assert_eq!(applied, Applied::Skipped(worker));
        pool.wait_idle().await;
        assert_eq!(pool.submitted(), 1);
    }

    #[tokio::test]
    async fn test_completed_worker_is_left_alone() {
        let (pool, store) = setup(ScriptedExecutor::new());
        let worker = pool.submit(Subtask::new("ok", "")).await.unwrap();
        pool.wait_idle().await;

        let mut ledger = RecoveryLedger::new();
        let action = RecoveryAction::Skip { worker_id: worker };
        let applied = ledger
            .apply(&ActionId::new(), &action, &pool, store.as_ref(), 3)
            .await
            .unwrap();
        assert!(!applied.changed());
    }

    #[tokio::test]
    async fn test_reduce_parallelism() {
        let (pool, store) = setup(ScriptedExecutor::new());
        let mut ledger = RecoveryLedger::new();
        let action = RecoveryAction::ReduceParallelism { new_max: 2 };
        let applied = ledger
            .apply(&ActionId::new(), &action, &pool, store.as_ref(), 3)
            .await
            .unwrap();
        assert_eq!(applied, Applied::Reduced { new_max: 2 });
        assert_eq!(pool.max_concurrency(), 2);
    }
}
