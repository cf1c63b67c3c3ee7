//! Circuit breaker for one class of operations
//!
//! Opens after a run of consecutive failures so a failing class (say,
//! spawning a binary that keeps crashing) stops burning resources, then
//! half-opens after a cooldown to let a single probe through.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation - calls allowed
    Closed,
    /// Too many failures - reject calls immediately
    Open,
    /// Cooldown elapsed - one probe call allowed
    HalfOpen,
}

/// Lock-free circuit breaker
///
/// # Example
///
/// ```
/// use arbor_agent::CircuitBreaker;
/// use std::time::Duration;
///
/// let cb = CircuitBreaker::new(3, Duration::from_secs(60));
/// cb.record_failure();
/// cb.record_failure();
/// cb.record_failure();
/// assert!(!cb.try_acquire());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    /// Millis since `epoch` of the latest failure
    last_failure: AtomicU64,
    probing: AtomicBool,
    threshold: u32,
    cooldown: Duration,
    epoch: Instant,
}

impl CircuitBreaker {
    /// * `threshold` - consecutive failures before the circuit opens
    /// * `cooldown` - time in Open before a probe is allowed
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            last_failure: AtomicU64::new(0),
            probing: AtomicBool::new(false),
            threshold: threshold.max(1),
            cooldown,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn since_last_failure_ms(&self) -> u64 {
        self.now_ms()
            .saturating_sub(self.last_failure.load(Ordering::Acquire))
    }

    pub fn state(&self) -> CircuitState {
        if self.failure_count.load(Ordering::Acquire) < self.threshold {
            return CircuitState::Closed;
        }
        if self.since_last_failure_ms() >= self.cooldown.as_millis() as u64 {
            CircuitState::HalfOpen
        } else {
            CircuitState::Open
        }
    }

    /// Non-consuming check: would a call be let through right now?
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => !self.probing.load(Ordering::Acquire),
            CircuitState::Open => false,
        }
    }

    /// Claim permission for one call
    ///
    /// In half-open only the first caller gets through until it reports back.
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => self
                .probing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok(),
            CircuitState::Open => false,
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.probing.store(false, Ordering::Release);
    }

    pub fn record_failure(&self) {
        self.last_failure.store(self.now_ms(), Ordering::Release);
        self.failure_count.fetch_add(1, Ordering::AcqRel);
        self.probing.store(false, Ordering::Release);
    }

    /// Give back a half-open probe without a verdict (cancelled call)
    pub fn release(&self) {
        self.probing.store(false, Ordering::Release);
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Time until a probe is allowed, zero unless open
    pub fn time_until_retry(&self) -> Duration {
        match self.state() {
            CircuitState::Open => {
                let left = (self.cooldown.as_millis() as u64)
                    .saturating_sub(self.since_last_failure_ms());
                Duration::from_millis(left)
            }
            _ => Duration::ZERO,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_initial_state_closed() {
        let cb = CircuitBreaker::default();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
        assert!(cb.time_until_retry() > Duration::ZERO);
    }

    #[test]
    fn test_success_resets_failures() {
        let cb = CircuitBreaker::new(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_single_probe() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(50));
        cb.record_failure();
        cb.record_failure();
        assert!(!cb.try_acquire());

        sleep(Duration::from_millis(80));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire());
        assert!(!cb.try_acquire());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(50));
        cb.record_failure();
        sleep(Duration::from_millis(80));
        assert!(cb.try_acquire());

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }
}
