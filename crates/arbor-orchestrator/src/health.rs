//! Per-worker health state machine
//!
//! Pure classification with NO I/O: the Monitor feeds in the previous state
//! and the latest Worker Record and gets back the new state plus, when the
//! state changed in a way worth reporting, a single signal. Signals are
//! edge-triggered: a worker that stays stalled for ten ticks produces one
//! `Stalled` signal, not ten.
//!
//! Lateness only ever escalates one step per tick
//! (`healthy → slow → stalled`), so a worker is always reported slow before
//! it is reported stalled, however coarse the polling.

use chrono::{DateTime, Utc};
use std::time::Duration;

use arbor_core::{WorkerRecord, WorkerStatus};

/// Health of one observed worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    /// Not yet running (or never seen)
    Unknown,
    Healthy,
    /// Quiet for more than half the worker timeout
    Slow,
    /// Quiet for more than the worker timeout
    Stalled,
    /// Fresh update after being slow or stalled
    Recovered,
    /// Failed, or its record vanished
    Crashed,
    /// Completed or terminated
    Finished,
}

impl Health {
    pub fn is_late(&self) -> bool {
        matches!(self, Self::Slow | Self::Stalled)
    }
}

/// Reportable state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Slow,
    Stalled,
    Crashed(String),
    Recovered,
    Finished,
}

/// Monitor-side memory about one worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tracked {
    pub health: Health,
    /// Latest `last_update` observed
    pub seen_update: Option<DateTime<Utc>>,
}

impl Default for Tracked {
    fn default() -> Self {
        Self {
            health: Health::Unknown,
            seen_update: None,
        }
    }
}

/// How late a worker is by elapsed time alone
fn lateness(elapsed_ms: i64, timeout_ms: i64) -> Health {
    if elapsed_ms > timeout_ms {
        Health::Stalled
    } else if elapsed_ms * 2 > timeout_ms {
        Health::Slow
    } else {
        Health::Healthy
    }
}

/// Classify one worker for the current tick
///
/// `record` is `None` when a previously seen Worker Record has disappeared.
/// This function never panics.
pub fn classify(
    prev: Tracked,
    record: Option<&WorkerRecord>,
    now: DateTime<Utc>,
    worker_timeout: Duration,
) -> (Tracked, Option<Signal>) {
    let Some(record) = record else {
        return match prev.health {
            Health::Crashed | Health::Finished => (prev, None),
            _ => (
                Tracked {
                    health: Health::Crashed,
                    ..prev
                },
                Some(Signal::Crashed("worker record disappeared".to_string())),
            ),
        };
    };

    let seen_update = Some(match prev.seen_update {
        Some(seen) => seen.max(record.last_update),
        None => record.last_update,
    });

    match record.status {
        WorkerStatus::Failed => {
            let next = Tracked {
                health: Health::Crashed,
                seen_update,
            };
            if prev.health == Health::Crashed {
                (next, None)
            } else {
                let reason = record
                    .error
                    .clone()
                    .unwrap_or_else(|| "worker failed".to_string());
                (next, Some(Signal::Crashed(reason)))
            }
        }
        WorkerStatus::Completed | WorkerStatus::Terminated => {
            let next = Tracked {
                health: Health::Finished,
                seen_update,
            };
            if prev.health == Health::Finished {
                (next, None)
            } else {
                (next, Some(Signal::Finished))
            }
        }
        // Queued, not running yet: nothing to time
        WorkerStatus::Pending => (
            Tracked {
                health: Health::Unknown,
                seen_update,
            },
            None,
        ),
        WorkerStatus::Spawning | WorkerStatus::Running | WorkerStatus::Waiting => {
            let fresh = prev
                .seen_update
                .map_or(false, |seen| record.last_update > seen);
            if prev.health.is_late() && fresh {
                return (
                    Tracked {
                        health: Health::Recovered,
                        seen_update,
                    },
                    Some(Signal::Recovered),
                );
            }

            let elapsed_ms = (now - record.last_update).num_milliseconds().max(0);
            let level = lateness(elapsed_ms, worker_timeout.as_millis() as i64);
            let health = match prev.health {
                Health::Unknown | Health::Healthy | Health::Recovered => match level {
                    Health::Healthy => Health::Healthy,
                    _ => Health::Slow,
                },
                Health::Slow => match level {
                    Health::Stalled => Health::Stalled,
                    _ => Health::Slow,
                },
                other => other,
            };

            let signal = if health != prev.health {
                match health {
                    Health::Slow => Some(Signal::Slow),
                    Health::Stalled => Some(Signal::Stalled),
                    _ => None,
                }
            } else {
                None
            };
            (
                Tracked {
                    health,
                    seen_update,
                },
                signal,
            )
        }
    }
}
