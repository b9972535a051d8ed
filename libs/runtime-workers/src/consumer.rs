//! Transport consumer worker: receives envelopes from subscribed
//! destinations, deduplicates them, and routes commands to local receptors
//! and events into the inbox + event store through the batch function.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use coordination_store::{NewEventRecord, NewInboxMessage, StoreMetrics, WorkStore};
use envelope_schema::{Envelope, EnvelopeHeaders};
use message_dispatch::{ReceptorContext, ReceptorRegistry};
use transport_core::{Destination, Subscription, Transport, TransportHandler};
use work_coordinator::{FlushMode, WorkCoordinator};

use crate::config::WorkerConfig;

/// One transport/destination pair the consumer subscribes to.
pub struct ConsumerBinding {
    pub transport: Arc<dyn Transport>,
    pub destination: Destination,
}

/// Stream id from the envelope's current hop. Falls back to the message id
/// so a malformed hop still lands somewhere deterministic.
fn stream_of(envelope: &Envelope) -> Uuid {
    envelope
        .current_hop()
        .and_then(|hop| hop.stream_key.as_deref())
        .and_then(|key| Uuid::parse_str(key).ok())
        .unwrap_or_else(|| {
            warn!(
                message_id = %envelope.message_id,
                "Envelope carries no parseable stream key; using message id"
            );
            envelope.message_id
        })
}

struct InboundHandler {
    coordinator: Arc<WorkCoordinator>,
    receptors: Arc<ReceptorRegistry>,
    store: Arc<dyn WorkStore>,
    source: String,
}

#[async_trait]
impl TransportHandler for InboundHandler {
    async fn handle(&self, envelope: Envelope, headers: EnvelopeHeaders) -> Result<(), String> {
        let stream_id = stream_of(&envelope);

        // Commands go straight to a local receptor; the processing log makes
        // redelivery idempotent.
        if let Some((name, receptor)) = self.receptors.receptor_for(&headers.envelope_type) {
            let context = ReceptorContext {
                message_type: headers.envelope_type.clone(),
                stream_id,
                correlation_id: envelope.correlation_id(),
            };
            let name = name.to_string();
            return match receptor.handle(&envelope, &context).await {
                Ok(()) => {
                    let _ = self
                        .store
                        .record_receptor_processing(envelope.message_id, &name, None)
                        .await;
                    debug!(
                        message_id = %envelope.message_id,
                        receptor = %name,
                        "Inbound command handled"
                    );
                    Ok(())
                }
                Err(error) => {
                    let _ = self
                        .store
                        .record_receptor_processing(envelope.message_id, &name, Some(&error))
                        .await;
                    Err(error)
                }
            };
        }

        // Events buffer an inbox row plus the companion event-store record;
        // both land inside the next flush's batch transaction. The dedup
        // ledger drops message ids seen before.
        let aggregate_type = envelope
            .current_hop()
            .and_then(|hop| hop.metadata.get("aggregate_type"))
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let envelope_value = serde_json::to_value(&envelope).map_err(|e| e.to_string())?;

        self.coordinator.enqueue_inbox(NewInboxMessage {
            message_id: envelope.message_id,
            source: self.source.clone(),
            envelope: envelope_value,
            stream_id,
            event: Some(NewEventRecord {
                aggregate_type,
                event_type: headers.envelope_type.clone(),
                event_data: envelope.payload.clone(),
                metadata: json!({"source": headers.source}),
                scope: None,
            }),
        });
        debug!(
            message_id = %envelope.message_id,
            event_type = %headers.envelope_type,
            "Inbound event buffered for the next batch"
        );
        Ok(())
    }
}

/// Long-running loop that owns the transport subscriptions.
///
/// The stop sequence drains pending work before terminating subscriptions.
pub struct TransportConsumerWorker {
    coordinator: Arc<WorkCoordinator>,
    receptors: Arc<ReceptorRegistry>,
    store: Arc<dyn WorkStore>,
    bindings: Vec<ConsumerBinding>,
    subscriptions: Mutex<Vec<Box<dyn Subscription>>>,
    config: WorkerConfig,
    metrics: Option<StoreMetrics>,
    idle: AtomicBool,
    empty_polls: AtomicU32,
}

impl TransportConsumerWorker {
    pub fn new(
        coordinator: Arc<WorkCoordinator>,
        receptors: Arc<ReceptorRegistry>,
        store: Arc<dyn WorkStore>,
        bindings: Vec<ConsumerBinding>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            coordinator,
            receptors,
            store,
            bindings,
            subscriptions: Mutex::new(Vec::new()),
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

    /// Pause every subscription. Messages buffer until resume.
    pub fn pause_all(&self) {
        for subscription in self.subscriptions.lock().iter() {
            subscription.pause();
        }
    }

    /// Resume every subscription, draining anything buffered while paused.
    pub fn resume_all(&self) {
        for subscription in self.subscriptions.lock().iter() {
            subscription.resume();
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            bindings = self.bindings.len(),
            "Transport consumer worker starting"
        );

        for binding in &self.bindings {
            let handler = Arc::new(InboundHandler {
                coordinator: self.coordinator.clone(),
                receptors: self.receptors.clone(),
                store: self.store.clone(),
                source: binding.destination.address.clone(),
            });
            match binding.transport.subscribe(&binding.destination, handler).await {
                Ok(subscription) => self.subscriptions.lock().push(subscription),
                Err(e) => {
                    error!(
                        transport = %binding.transport.name(),
                        address = %binding.destination.address,
                        error = %e,
                        "Subscription failed"
                    );
                }
            }
        }

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

            self.track_idle(reply.inbox_work.is_empty());
            if let Some(metrics) = &self.metrics {
                metrics.batch_rounds.inc();
                metrics.inbox_claimed.inc_by(reply.inbox_work.len() as u64);
            }

            // The event and dedup bookkeeping happened inside the batch that
            // inserted the row; claiming it here closes the loop.
            for work in reply.inbox_work {
                debug!(message_id = %work.message_id, "Inbox message processed");
                self.coordinator.report_inbox_completion(work.message_id);
                if let Some(metrics) = &self.metrics {
                    metrics.inbox_completed.inc();
                }
            }

            tokio::select! {
                _ = sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        // Stop sequence: drain pending work first, then terminate the
        // subscriptions.
        if let Err(e) = self.coordinator.drain(Utc::now()).await {
            warn!(error = %e, "Final drain flush failed; leases will recover the rows");
        }
        crate::wait_until_quiet(&self.coordinator, &self.config).await;
        self.subscriptions.lock().clear();
        info!("Transport consumer worker stopped");
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
