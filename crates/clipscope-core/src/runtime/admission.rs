use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::runtime::types::RuntimeError;

/// RAII guard for one running job; the slot is released on drop.
pub struct JobPermit {
    #[allow(dead_code)]
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for JobPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobPermit").finish()
    }
}

/// Bounds how many jobs run stages at once.
///
/// Jobs waiting for a slot stay `queued`. Waiters are served in FIFO order.
#[derive(Debug, Clone)]
pub struct JobAdmission {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl JobAdmission {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> Result<JobPermit, RuntimeError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| JobPermit { permit })
            .map_err(|_| RuntimeError::Shutdown)
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<JobPermit> {
        Arc::clone(&self.semaphore)
            .try_acquire_owned()
            .ok()
            .map(|permit| JobPermit { permit })
    }
}

impl Default for JobAdmission {
    fn default() -> Self {
        Self::new(2)
    }
}
