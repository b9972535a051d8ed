//! Bounded-concurrency execution.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Semaphore, TryAcquireError};

use crate::error::{ExecutorError, ExecutorResult};

/// Runs handlers with a fixed concurrency bound.
///
/// The permit is taken synchronously when one is free, so a handler that
/// completes without yielding never touches the scheduler; when the executor
/// is saturated the submit suspends until capacity frees.
pub struct ParallelExecutor {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ParallelExecutor {
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

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run a job under a permit, suspending while the executor is saturated.
    pub async fn execute<Fut, T>(&self, job: Fut) -> ExecutorResult<T>
    where
        Fut: Future<Output = T>,
    {
        let _permit = match self.semaphore.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => self
                .semaphore
                .acquire()
                .await
                .map_err(|_| ExecutorError::Closed)?,
            Err(TryAcquireError::Closed) => return Err(ExecutorError::Closed),
        };
        Ok(job.await)
    }

    /// Stop accepting work. In-flight jobs keep their permits.
    pub fn close(&self) {
        self.semaphore.close();
    }
}
