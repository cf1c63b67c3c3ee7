//! Resilience layer
//!
//! One circuit breaker and one bulkhead per operation class, created on first
//! use. [`ResilienceLayer::call`] wraps an operation as
//! bulkhead → breaker → operation, retrying recoverable failures with
//! backoff. [`ResilienceLayer::try_enter`] is the non-blocking variant used
//! where waiting is not an option (recursive Coordinator calls fall back to
//! direct execution instead).

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

use arbor_core::{ArborError, ResilienceConfig, Result};

use crate::bulkhead::{Bulkhead, BulkheadPermit};
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Class for spawning worker processes
pub const PROCESS_SPAWN: &str = "process.spawn";
/// Class for recursive Coordinator invocations
pub const COORDINATOR_RECURSE: &str = "coordinator.recurse";

pub struct ResilienceLayer {
    config: ResilienceConfig,
    retry: RetryPolicy,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    bulkheads: Mutex<HashMap<String, Bulkhead>>,
}

impl ResilienceLayer {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            retry: RetryPolicy::from_config(&config),
            config,
            breakers: Mutex::new(HashMap::new()),
            bulkheads: Mutex::new(HashMap::new()),
        }
    }

    /// Override the retry policy (tests use zero delays)
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn capacity_for(&self, class: &str) -> usize {
        match class {
            COORDINATOR_RECURSE => self.config.recursion_bulkhead,
            _ => self.config.process_bulkhead,
        }
    }

    pub fn breaker(&self, class: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(breakers.entry(class.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::new(
                self.config.breaker_failure_threshold,
                std::time::Duration::from_millis(self.config.breaker_cooldown_ms),
            ))
        }))
    }

    pub fn bulkhead(&self, class: &str) -> Bulkhead {
        let mut bulkheads = self.bulkheads.lock().unwrap_or_else(|e| e.into_inner());
        bulkheads
            .entry(class.to_string())
            .or_insert_with(|| Bulkhead::new(class, self.capacity_for(class)))
            .clone()
    }

    pub fn state(&self, class: &str) -> CircuitState {
        self.breaker(class).state()
    }

    /// Run `f` under the class's bulkhead and breaker, with retries
    pub async fn call<F, Fut, T>(&self, class: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call_held(class, f).await.map(|(value, _permit)| value)
    }

    /// Like [`call`](Self::call), but the bulkhead slot stays claimed
    /// until the returned permit is dropped
    ///
    /// For operations whose result keeps using the resource, such as a
    /// spawned process that lives on after the spawn returns.
    pub async fn call_held<F, Fut, T>(&self, class: &str, mut f: F) -> Result<(T, BulkheadPermit)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.bulkhead(class).acquire().await?;
        let breaker = self.breaker(class);

        let value = retry_with_backoff(class, &self.retry, || {
            let breaker = Arc::clone(&breaker);
            let class = class.to_string();
            let attempt = f();
            async move {
                if !breaker.try_acquire() {
                    debug!("Circuit open for {}, rejecting call", class);
                    return Err(ArborError::CircuitOpen {
                        retry_in_ms: breaker.time_until_retry().as_millis() as u64,
                        class,
                    });
                }
                let result = attempt.await;
                match &result {
                    Ok(_) => breaker.record_success(),
                    Err(ArborError::Cancelled) => breaker.release(),
                    Err(_) => breaker.record_failure(),
                }
                result
            }
        })
        .await?;
        Ok((value, permit))
    }

    /// Claim a bulkhead slot and breaker permission without waiting
    pub fn try_enter(&self, class: &str) -> Result<Admission> {
        let permit = self.bulkhead(class).try_acquire()?;
        let breaker = self.breaker(class);
        if !breaker.try_acquire() {
            return Err(ArborError::CircuitOpen {
                class: class.to_string(),
                retry_in_ms: breaker.time_until_retry().as_millis() as u64,
            });
        }
        Ok(Admission {
            breaker,
            _permit: permit,
            settled: false,
        })
    }
}

impl Default for ResilienceLayer {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

/// Permission for one operation, obtained from [`ResilienceLayer::try_enter`]
///
/// Report the outcome with [`Admission::succeed`] or [`Admission::fail`];
/// dropping it unreported frees the slot without touching the breaker.
pub struct Admission {
    breaker: Arc<CircuitBreaker>,
    _permit: BulkheadPermit,
    settled: bool,
}

impl Admission {
    pub fn succeed(mut self) {
        self.breaker.record_success();
        self.settled = true;
    }

    pub fn fail(mut self) {
        self.breaker.record_failure();
        self.settled = true;
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release();
        }
    }
}
