//! Fail-open helpers for side work that must never take a run down
//!
//! [`fail_open`] covers event-log appends and heartbeat writes from inside a
//! worker's progress callback. [`fail_open_with_retries`] covers writes worth
//! a second try: a failed run's final record, and worker status transitions,
//! whose callers turn a final `None` back into an error.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Run `f`, logging and swallowing any error
///
/// ```no_run
/// use arbor_core::fail_open::fail_open;
/// use arbor_core::Result;
///
/// async fn append_event() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("event_log.append", || append_event()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation, e);
            None
        }
    }
}

/// Like [`fail_open`] but tries up to `attempts` times, sleeping
/// `pause * attempt` between tries
pub async fn fail_open_with_retries<F, Fut, T>(
    operation: &str,
    mut f: F,
    attempts: usize,
    pause: Duration,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    for attempt in 1..=attempts {
        match f().await {
            Ok(val) => return Some(val),
            Err(e) if attempt == attempts => {
                warn!(
                    "{} failed after {} attempts (fail-open): {}",
                    operation, attempts, e
                );
            }
            Err(e) => {
                warn!("{} failed (attempt {}/{}): {}", operation, attempt, attempts, e);
                tokio::time::sleep(pause * attempt as u32).await;
            }
        }
    }
    None
}
