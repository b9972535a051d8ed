//! Outbox publisher worker.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use coordination_store::{FailureReport, OutboxWork, StoreMetrics};
use envelope_schema::{Envelope, EnvelopeHeaders};
use transport_core::{Destination, Transport};
use work_coordinator::{FlushMode, WorkCoordinator};

use crate::config::WorkerConfig;

/// Long-running loop that claims outbox rows and drives a transport.
///
/// Completions and failures observed in one cycle ride the next cycle's
/// batched state transitions. A transport that is down or a publish that
/// fails transiently leaves the row claimed; lease expiry returns it to the
/// pool with its attempt counter intact. Rows that keep failing past the
/// attempt threshold are reported poison.
pub struct PublisherWorker {
    coordinator: Arc<WorkCoordinator>,
    transport: Arc<dyn Transport>,
    config: WorkerConfig,
    metrics: Option<StoreMetrics>,
    idle: AtomicBool,
    empty_polls: AtomicU32,
}

impl PublisherWorker {
    pub fn new(
        coordinator: Arc<WorkCoordinator>,
        transport: Arc<dyn Transport>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            coordinator,
            transport,
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

    /// Two consecutive empty polls mark the worker idle; graceful-shutdown
    /// wait loops read this.
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    /// Run until the shutdown signal flips, then drain and exit.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            transport = %self.transport.name(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Publisher worker starting"
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

            self.track_idle(reply.outbox_work.is_empty());
            if let Some(metrics) = &self.metrics {
                metrics.batch_rounds.inc();
                metrics.outbox_claimed.inc_by(reply.outbox_work.len() as u64);
            }

            for work in reply.outbox_work {
                self.publish_one(work).await;
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        // Drain: deliver the final cycle's completion reports without
        // claiming anything new.
        if let Err(e) = self.coordinator.drain(Utc::now()).await {
            warn!(error = %e, "Final drain flush failed; leases will recover the rows");
        }
        crate::wait_until_quiet(&self.coordinator, &self.config).await;
        info!("Publisher worker stopped");
    }

    async fn publish_one(&self, work: OutboxWork) {
        if work.attempts > self.config.max_attempts {
            warn!(
                message_id = %work.message_id,
                attempts = work.attempts,
                max_attempts = self.config.max_attempts,
                "Outbox row exceeded attempt threshold; reporting poison"
            );
            self.coordinator.report_outbox_failure(FailureReport::poison(
                work.message_id,
                format!("exceeded {} attempts", self.config.max_attempts),
            ));
            if let Some(metrics) = &self.metrics {
                metrics.outbox_poisoned.inc();
            }
            return;
        }

        let envelope: Envelope = match serde_json::from_value(work.envelope.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    message_id = %work.message_id,
                    error = %e,
                    "Outbox envelope failed to deserialize"
                );
                self.coordinator.report_outbox_failure(FailureReport::new(
                    work.message_id,
                    format!("envelope deserialization failed: {}", e),
                ));
                return;
            }
        };

        if !self.transport.is_ready().await {
            // Transient: the row stays claimed and returns via lease expiry.
            warn!(
                transport = %self.transport.name(),
                message_id = %work.message_id,
                "Transport not ready; deferring to lease expiry"
            );
            return;
        }

        let headers = EnvelopeHeaders::new(
            work.envelope_type.clone(),
            self.coordinator.instance().service_name.clone(),
        );
        let destination = Destination::new(work.destination.clone());

        match self.transport.publish(&envelope, &headers, &destination).await {
            Ok(()) => {
                debug!(
                    message_id = %work.message_id,
                    destination = %work.destination,
                    "Outbox message published"
                );
                self.coordinator.report_outbox_completion(work.message_id);
                if let Some(metrics) = &self.metrics {
                    metrics.outbox_completed.inc();
                }
            }
            Err(e) => {
                warn!(
                    message_id = %work.message_id,
                    attempts = work.attempts,
                    error = %e,
                    "Publish failed"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.outbox_failed.inc();
                }
                if work.attempts >= self.config.max_attempts {
                    self.coordinator
                        .report_outbox_failure(FailureReport::poison(
                            work.message_id,
                            e.to_string(),
                        ));
                    if let Some(metrics) = &self.metrics {
                        metrics.outbox_poisoned.inc();
                    }
                }
                // Otherwise the claim lapses and the row is retried after
                // lease expiry.
            }
        }
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
