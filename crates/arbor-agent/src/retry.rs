//! Retry with exponential backoff
//!
//! Only recoverable errors are retried (see [`ArborError::is_recoverable`]);
//! a spawn failure or a cancelled call comes straight back to the caller.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use arbor_core::{ArborError, ResilienceConfig, Result};

/// Bounded attempts with doubling delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(
            config.retry_max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_max_delay_ms),
        )
    }

    /// Delay after the `attempt`-th failure (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResilienceConfig::default())
    }
}

/// Run `f` until it succeeds, fails fatally, or runs out of attempts
pub async fn retry_with_backoff<F, Fut, T>(operation: &str, policy: &RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if !e.is_recoverable() || is_rejection(&e) => {
                debug!("{} failed fatally: {}", operation, e);
                return Err(e);
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!("{} failed after {} attempts: {}", operation, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    operation, attempt, policy.max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Whether an error came from the retry machinery itself rather than the call
pub fn is_rejection(err: &ArborError) -> bool {
    matches!(
        err,
        ArborError::CircuitOpen { .. } | ArborError::BulkheadFull(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failures() {
        let mut calls = 0;
        let result = retry_with_backoff("spawn", &fast(3), || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err(ArborError::ProcessCrash("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let mut calls = 0;
        let result: Result<()> = retry_with_backoff("spawn", &fast(5), || {
            calls += 1;
            async { Err(ArborError::Spawn("no such file".into())) }
        })
        .await;
        assert!(matches!(result, Err(ArborError::Spawn(_))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_gives_up_at_budget() {
        let mut calls = 0;
        let result: Result<()> = retry_with_backoff("spawn", &fast(2), || {
            calls += 1;
            async { Err(ArborError::Timeout(Duration::from_secs(1))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }
}
