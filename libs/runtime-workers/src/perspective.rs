//! Perspective worker: claims perspective-event work and executes runners
//! under per-(stream, perspective) serial discipline.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use coordination_store::{FailureReport, PerspectiveReport, PerspectiveWork, StoreMetrics};
use stream_executors::ExecutorFleet;
use work_coordinator::{FlushMode, WorkCoordinator};

use crate::config::WorkerConfig;

/// Executable adapter between a perspective-event work item and the
/// user-supplied perspective function.
#[async_trait]
pub trait PerspectiveRunner: Send + Sync {
    async fn run(&self, work: &PerspectiveWork) -> Result<(), String>;
}

/// Immutable name -> runner table, provided by the host at startup.
#[derive(Default)]
pub struct RunnerRegistry {
    by_name: HashMap<String, Arc<dyn PerspectiveRunner>>,
}

impl RunnerRegistry {
    pub fn builder() -> RunnerRegistryBuilder {
        RunnerRegistryBuilder {
            by_name: HashMap::new(),
        }
    }

    pub fn runner(&self, perspective_name: &str) -> Option<Arc<dyn PerspectiveRunner>> {
        self.by_name.get(perspective_name).cloned()
    }
}

pub struct RunnerRegistryBuilder {
    by_name: HashMap<String, Arc<dyn PerspectiveRunner>>,
}

impl RunnerRegistryBuilder {
    pub fn runner(
        mut self,
        perspective_name: impl Into<String>,
        runner: Arc<dyn PerspectiveRunner>,
    ) -> Self {
        self.by_name.insert(perspective_name.into(), runner);
        self
    }

    pub fn build(self) -> RunnerRegistry {
        RunnerRegistry {
            by_name: self.by_name,
        }
    }
}

/// Long-running loop that materializes perspectives.
///
/// Each claimed item runs on the serial executor for its
/// `stream_id/perspective_name` key, so a perspective sees its stream's
/// events in sequence order while unrelated streams proceed in parallel.
/// Completion is reported with the processed event id, which advances the
/// checkpoint; a runner failure fail-stops the pair until an operator
/// clears it.
pub struct PerspectiveWorker {
    coordinator: Arc<WorkCoordinator>,
    runners: RunnerRegistry,
    fleet: ExecutorFleet,
    config: WorkerConfig,
    metrics: Option<StoreMetrics>,
    idle: AtomicBool,
    empty_polls: AtomicU32,
}

impl PerspectiveWorker {
    pub fn new(
        coordinator: Arc<WorkCoordinator>,
        runners: RunnerRegistry,
        config: WorkerConfig,
    ) -> Self {
        Self {
            coordinator,
            runners,
            fleet: ExecutorFleet::new(64),
            config,
            metrics: None,
            idle: AtomicBool::new(false),
            empty_polls: AtomicU32::new(0),
        }
    }

    /// Attach Prometheus metrics updated on every cycle.
    pub fn with_metrics(mut self, metrics: StoreMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Perspective worker starting"
        );

        while !*shutdown.borrow() {
            let reply = match self
                .coordinator
                .flush(FlushMode::Immediate, Utc::now())
                .await
            {
                Ok(reply) => reply,
                Err(e) => {
                    error!(error = %e, "Coordination store unavailable; backing off");
                    sleep(self.config.backoff_with_jitter()).await;
                    continue;
                }
            };

            self.track_idle(reply.perspective_work.is_empty());
            if let Some(metrics) = &self.metrics {
                metrics.batch_rounds.inc();
                metrics
                    .perspective_claimed
                    .inc_by(reply.perspective_work.len() as u64);
            }

            // Submit everything first so independent streams overlap, then
            // collect results in claim order.
            let mut in_flight = Vec::with_capacity(reply.perspective_work.len());
            for work in reply.perspective_work {
                if let Some(submitted) = self.submit_one(work).await {
                    in_flight.push(submitted);
                }
            }
            for (work, handle) in in_flight {
                self.settle_one(work, handle.wait().await).await;
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        if let Err(e) = self.coordinator.drain(Utc::now()).await {
            warn!(error = %e, "Final drain flush failed; leases will recover the rows");
        }
        crate::wait_until_quiet(&self.coordinator, &self.config).await;
        self.fleet.shutdown().await;
        info!("Perspective worker stopped");
    }

    async fn submit_one(
        &self,
        work: PerspectiveWork,
    ) -> Option<(PerspectiveWork, stream_executors::SubmitHandle)> {
        if work.attempts > self.config.max_attempts {
            warn!(
                event_work_id = %work.event_work_id,
                attempts = work.attempts,
                "Perspective work exceeded attempt threshold; reporting poison"
            );
            self.report_failure(
                &work,
                format!("exceeded {} attempts", self.config.max_attempts),
                true,
            );
            return None;
        }

        let runner = match self.runners.runner(&work.perspective_name) {
            Some(runner) => runner,
            None => {
                error!(
                    perspective = %work.perspective_name,
                    "No runner registered for perspective"
                );
                self.report_failure(
                    &work,
                    format!("no runner registered for {}", work.perspective_name),
                    false,
                );
                return None;
            }
        };

        let key = format!("{}/{}", work.stream_id, work.perspective_name);
        let job_work = work.clone();
        match self
            .fleet
            .submit(&key, async move { runner.run(&job_work).await })
            .await
        {
            Ok(handle) => Some((work, handle)),
            Err(e) => {
                self.report_failure(&work, e.to_string(), false);
                None
            }
        }
    }

    async fn settle_one(
        &self,
        work: PerspectiveWork,
        outcome: Result<(), stream_executors::ExecutorError>,
    ) {
        match outcome {
            Ok(()) => {
                debug!(
                    event_work_id = %work.event_work_id,
                    perspective = %work.perspective_name,
                    sequence = work.sequence_number,
                    "Perspective event processed"
                );
                self.coordinator
                    .report_perspective_event_completion(work.event_work_id);
                self.coordinator
                    .report_perspective_completion(PerspectiveReport {
                        stream_id: work.stream_id,
                        perspective_name: work.perspective_name.clone(),
                        last_event_id: Some(work.event_id),
                        error: None,
                    });
                if let Some(metrics) = &self.metrics {
                    metrics.perspective_completed.inc();
                }
            }
            Err(e) => {
                warn!(
                    event_work_id = %work.event_work_id,
                    perspective = %work.perspective_name,
                    error = %e,
                    "Perspective runner failed"
                );
                self.report_failure(&work, e.to_string(), false);
            }
        }
    }

    fn report_failure(&self, work: &PerspectiveWork, error: String, poison: bool) {
        let failure = if poison {
            FailureReport::poison(work.event_work_id, error.clone())
        } else {
            FailureReport::new(work.event_work_id, error.clone())
        };
        if let Some(metrics) = &self.metrics {
            metrics.perspective_failed.inc();
        }
        self.coordinator.report_perspective_event_failure(failure);
        self.coordinator
            .report_perspective_failure(PerspectiveReport {
                stream_id: work.stream_id,
                perspective_name: work.perspective_name.clone(),
                last_event_id: None,
                error: Some(error),
            });
    }

    fn track_idle(&self, empty: bool) {
        if empty {
            let polls = self.empty_polls.fetch_add(1, Ordering::SeqCst) + 1;
            if polls >= self.config.idle_after_empty_polls {
                self.idle.store(true, Ordering::SeqCst);
            }
        } else {
            self.empty_polls.store(0, Ordering::SeqCst);
            self.idle.store(false, Ordering::SeqCst);
        }
    }
}
