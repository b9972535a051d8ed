//! Strict-FIFO execution for a single stream key.

use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{ExecutorError, ExecutorResult};

type Job = Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'static>>;

struct Work {
    job: Job,
    done: oneshot::Sender<Result<(), String>>,
}

/// Completes when the worker has finished the submitted job.
#[derive(Debug)]
pub struct SubmitHandle {
    receiver: oneshot::Receiver<Result<(), String>>,
}

impl SubmitHandle {
    /// Wait for the job's outcome.
    pub async fn wait(self) -> ExecutorResult<()> {
        match self.receiver.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ExecutorError::HandlerFailed(error)),
            Err(_) => Err(ExecutorError::Closed),
        }
    }
}

/// Single-consumer producer-consumer queue processing jobs in submission
/// order. Ordering is absolute: job N+1 starts only after job N's future
/// completed and its handle was signalled.
pub struct SerialExecutor {
    sender: RwLock<Option<mpsc::Sender<Work>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_submit: Mutex<Instant>,
}

impl SerialExecutor {
    /// Create an executor with a bounded queue. Submitters suspend when the
    /// queue is full.
    pub fn new(capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<Work>(capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(work) = receiver.recv().await {
                let result = work.job.await;
                // The submitter may have dropped its handle; that is fine.
                let _ = work.done.send(result);
            }
            debug!("Serial executor drained");
        });
        Self {
            sender: RwLock::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            last_submit: Mutex::new(Instant::now()),
        }
    }

    /// Enqueue a job. Suspends when the queue is saturated; fails once the
    /// executor is closed.
    pub async fn submit<Fut>(&self, job: Fut) -> ExecutorResult<SubmitHandle>
    where
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let sender = self
            .sender
            .read()
            .as_ref()
            .cloned()
            .ok_or(ExecutorError::Closed)?;
        *self.last_submit.lock() = Instant::now();

        let (done, receiver) = oneshot::channel();
        sender
            .send(Work {
                job: Box::pin(job),
                done,
            })
            .await
            .map_err(|_| ExecutorError::Closed)?;
        Ok(SubmitHandle { receiver })
    }

    /// Time since the last submission.
    pub fn idle_for(&self) -> Duration {
        self.last_submit.lock().elapsed()
    }

    /// Stop accepting work. Queued jobs still run to completion.
    pub fn close(&self) {
        self.sender.write().take();
    }

    /// Close and wait for the queue to drain.
    pub async fn shutdown(&self) {
        self.close();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
