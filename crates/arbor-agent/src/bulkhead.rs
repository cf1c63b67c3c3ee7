//! Bulkhead: caps in-flight operations of one class

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use arbor_core::{ArborError, Result};

/// Held while an operation is in flight; dropping it frees the slot
pub type BulkheadPermit = OwnedSemaphorePermit;

#[derive(Debug, Clone)]
pub struct Bulkhead {
    name: String,
    capacity: usize,
    semaphore: Arc<Semaphore>,
}

impl Bulkhead {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name: name.into(),
            capacity,
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Wait for a slot
    pub async fn acquire(&self) -> Result<BulkheadPermit> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ArborError::BulkheadFull(self.name.clone()))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Result<BulkheadPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .map_err(|_| ArborError::BulkheadFull(self.name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_caps_in_flight() {
        let bulkhead = Bulkhead::new("coordinator.recurse", 2);
        let a = bulkhead.try_acquire().unwrap();
        let _b = bulkhead.acquire().await.unwrap();
        assert_eq!(bulkhead.in_flight(), 2);
        assert!(matches!(
            bulkhead.try_acquire(),
            Err(ArborError::BulkheadFull(name)) if name == "coordinator.recurse"
        ));

        drop(a);
        assert_eq!(bulkhead.in_flight(), 1);
        assert!(bulkhead.try_acquire().is_ok());
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        assert_eq!(Bulkhead::new("x", 0).capacity(), 1);
    }
}
