//! One serial executor per stream key.
//!
//! The fleet gives per-stream linearizability with cross-stream parallelism:
//! work for one key runs in strict FIFO on that key's executor while other
//! keys proceed concurrently. Executors are created on first submit and
//! evicted after a configurable quiet period, so an idle fleet costs nothing.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::ExecutorResult;
use crate::serial::{SerialExecutor, SubmitHandle};

pub struct ExecutorFleet {
    executors: DashMap<String, Arc<SerialExecutor>>,
    queue_capacity: usize,
}

impl ExecutorFleet {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            executors: DashMap::new(),
            queue_capacity,
        }
    }

    /// The executor for a key, created on first use.
    pub fn executor(&self, key: &str) -> Arc<SerialExecutor> {
        self.executors
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(SerialExecutor::new(self.queue_capacity)))
            .clone()
    }

    /// Submit a job to the key's executor.
    pub async fn submit<Fut>(&self, key: &str, job: Fut) -> ExecutorResult<SubmitHandle>
    where
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.executor(key).submit(job).await
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Close and remove executors that have been quiet longer than the given
    /// period. Returns the number evicted. Queued work on an evicted
    /// executor still drains.
    pub fn evict_idle(&self, quiet_period: Duration) -> usize {
        let mut evicted = 0;
        self.executors.retain(|key, executor| {
            if executor.idle_for() >= quiet_period {
                executor.close();
                debug!(key = %key, "Evicted idle serial executor");
                evicted += 1;
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Close every executor and wait for their queues to drain.
    pub async fn shutdown(&self) {
        let executors: Vec<Arc<SerialExecutor>> = self
            .executors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.executors.clear();
        for executor in executors {
            executor.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::time::sleep;

    #[tokio::test]
    async fn same_key_reuses_the_executor() {
        let fleet = ExecutorFleet::new(8);
        let a = fleet.executor("stream-a");
        let b = fleet.executor("stream-a");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fleet.len(), 1);
    }

    #[tokio::test]
    async fn keys_are_independent_but_internally_ordered() {
        let fleet = ExecutorFleet::new(32);
        let seen_a = Arc::new(Mutex::new(Vec::new()));
        let seen_b = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..20 {
            let seen = seen_a.clone();
            handles.push(
                fleet
                    .submit("stream-a", async move {
                        seen.lock().push(n);
                        Ok(())
                    })
                    .await
                    .unwrap(),
            );
            let seen = seen_b.clone();
            handles.push(
                fleet
                    .submit("stream-b", async move {
                        seen.lock().push(n);
                        Ok(())
                    })
                    .await
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.wait().await.unwrap();
        }

        assert_eq!(*seen_a.lock(), (0..20).collect::<Vec<_>>());
        assert_eq!(*seen_b.lock(), (0..20).collect::<Vec<_>>());
        assert_eq!(fleet.len(), 2);
    }

    #[tokio::test]
    async fn idle_executors_are_evicted_and_recreated() {
        let fleet = ExecutorFleet::new(8);
        fleet
            .submit("stream-a", async { Ok(()) })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        sleep(Duration::from_millis(30)).await;
        let evicted = fleet.evict_idle(Duration::from_millis(10));
        assert_eq!(evicted, 1);
        assert!(fleet.is_empty());

        // A fresh submit transparently builds a new executor.
        fleet
            .submit("stream-a", async { Ok(()) })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(fleet.len(), 1);
    }
}
