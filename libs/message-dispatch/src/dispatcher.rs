//! The local dispatcher: policy evaluation, envelope stamping, local
//! receptor execution and outbox enqueueing.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use coordination_store::{InstanceIdentity, NewOutboxMessage, WorkStore};
use delivery_policy::{
    partition_for_stream, ExecutorKind, PolicyContext, PolicyEngine, PolicyMatch, SizeLimitAction,
};
use envelope_schema::{Envelope, Hop};
use stream_executors::{ExecutorFleet, ParallelExecutor};
use work_coordinator::WorkCoordinator;

use crate::receipt::DeliveryReceipt;
use crate::receptors::{ReceptorContext, ReceptorRegistry};

/// Extra attributes for a published event.
#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    pub aggregate_type: String,
    pub scope: Option<serde_json::Value>,
    pub metadata: serde_json::Value,
}

impl EventOptions {
    pub fn aggregate(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            scope: None,
            metadata: serde_json::Value::Null,
        }
    }
}

/// Local routing front door: commands go to a local receptor or the outbox,
/// events always go to the outbox. Registries are immutable after
/// construction.
pub struct Dispatcher {
    instance: InstanceIdentity,
    policies: PolicyEngine,
    receptors: ReceptorRegistry,
    coordinator: Arc<WorkCoordinator>,
    store: Arc<dyn WorkStore>,
    serial: ExecutorFleet,
    parallel: ParallelExecutor,
}

pub struct DispatcherBuilder {
    instance: InstanceIdentity,
    policies: PolicyEngine,
    receptors: ReceptorRegistry,
    coordinator: Arc<WorkCoordinator>,
    store: Arc<dyn WorkStore>,
    serial_queue_capacity: usize,
    parallel_capacity: usize,
}

impl Dispatcher {
    pub fn builder(
        instance: InstanceIdentity,
        policies: PolicyEngine,
        coordinator: Arc<WorkCoordinator>,
        store: Arc<dyn WorkStore>,
    ) -> DispatcherBuilder {
        DispatcherBuilder {
            instance,
            policies,
            receptors: ReceptorRegistry::default(),
            coordinator,
            store,
            serial_queue_capacity: 64,
            parallel_capacity: 16,
        }
    }

    /// Dispatch a command. A locally registered receptor executes inline on
    /// the policy-selected executor; otherwise the command is enqueued for
    /// transport fan-out.
    pub async fn send_command(
        &self,
        command_type: &str,
        stream_id: Uuid,
        payload: serde_json::Value,
    ) -> DeliveryReceipt {
        let matched = self
            .policies
            .match_message(&PolicyContext::new(command_type, false, stream_id));
        let envelope = self.stamp(payload, stream_id, &matched);

        if let Err(receipt) = self.enforce_size(&envelope, &matched) {
            return receipt;
        }

        if let Some((name, receptor)) = self.receptors.receptor_for(command_type) {
            let context = ReceptorContext {
                message_type: command_type.to_string(),
                stream_id,
                correlation_id: envelope.correlation_id(),
            };
            let name = name.to_string();
            let outcome = match matched.configuration.executor {
                ExecutorKind::Serial => {
                    let stream_key = matched
                        .configuration
                        .stream_key
                        .clone()
                        .unwrap_or_else(|| stream_id.to_string());
                    let envelope_for_job = envelope.clone();
                    let submit = self
                        .serial
                        .submit(&stream_key, async move {
                            receptor.handle(&envelope_for_job, &context).await
                        })
                        .await;
                    match submit {
                        Ok(handle) => handle.wait().await.map_err(|e| e.to_string()),
                        Err(e) => Err(e.to_string()),
                    }
                }
                ExecutorKind::Parallel => match self
                    .parallel
                    .execute(receptor.handle(&envelope, &context))
                    .await
                {
                    Ok(result) => result,
                    Err(e) => Err(e.to_string()),
                },
            };

            return match outcome {
                Ok(()) => {
                    let _ = self
                        .store
                        .record_receptor_processing(envelope.message_id, &name, None)
                        .await;
                    debug!(
                        message_id = %envelope.message_id,
                        receptor = %name,
                        "Command delivered to local receptor"
                    );
                    DeliveryReceipt::delivered(envelope.message_id)
                }
                Err(error) => {
                    let _ = self
                        .store
                        .record_receptor_processing(envelope.message_id, &name, Some(&error))
                        .await;
                    warn!(
                        message_id = %envelope.message_id,
                        receptor = %name,
                        error = %error,
                        "Local receptor failed"
                    );
                    DeliveryReceipt::failed(
                        envelope.message_id,
                        format!("receptor {} failed: {}", name, error),
                    )
                }
            };
        }

        self.enqueue(envelope, command_type, stream_id, false, &matched, json!({}))
    }

    /// Publish an event. Events are never executed locally in the publish
    /// path; they always go through the outbox.
    pub async fn publish_event(
        &self,
        event_type: &str,
        stream_id: Uuid,
        payload: serde_json::Value,
        options: EventOptions,
    ) -> DeliveryReceipt {
        let matched = self
            .policies
            .match_message(&PolicyContext::new(event_type, true, stream_id));
        let envelope = self.stamp(payload, stream_id, &matched);

        if let Err(receipt) = self.enforce_size(&envelope, &matched) {
            return receipt;
        }

        let mut metadata = json!({
            "aggregate_type": options.aggregate_type,
            "correlation_id": envelope.correlation_id(),
        });
        if let Some(scope) = options.scope {
            metadata["scope"] = scope;
        }
        if let serde_json::Value::Object(extra) = options.metadata {
            for (key, value) in extra {
                metadata[key] = value;
            }
        }

        self.enqueue(envelope, event_type, stream_id, true, &matched, metadata)
    }

    fn stamp(
        &self,
        payload: serde_json::Value,
        stream_id: Uuid,
        matched: &PolicyMatch,
    ) -> Envelope {
        let mut envelope = Envelope::new(payload);
        let partition = partition_for_stream(stream_id, matched.configuration.partition_count);
        let hop = Hop::current(self.instance.label(), Utc::now())
            .with_correlation(envelope.message_id)
            .with_topic(matched.configuration.topic.clone())
            .with_stream_key(
                matched
                    .configuration
                    .stream_key
                    .clone()
                    .unwrap_or_else(|| stream_id.to_string()),
            )
            .with_partition(partition);
        envelope.push_hop(hop);
        envelope
    }

    /// Size enforcement at dispatch time, before persistence.
    fn enforce_size(
        &self,
        envelope: &Envelope,
        matched: &PolicyMatch,
    ) -> Result<(), DeliveryReceipt> {
        let limit = matched.configuration.max_data_size_bytes;
        match envelope.validate_size(limit) {
            Ok(_) => Ok(()),
            Err(error) => match matched.configuration.on_size_exceeded {
                SizeLimitAction::Block => {
                    Err(DeliveryReceipt::failed(envelope.message_id, error.to_string()))
                }
                SizeLimitAction::Warn => {
                    warn!(
                        message_id = %envelope.message_id,
                        limit,
                        "Envelope exceeds configured size limit"
                    );
                    Ok(())
                }
                SizeLimitAction::Ignore => Ok(()),
            },
        }
    }

    fn enqueue(
        &self,
        envelope: Envelope,
        message_type: &str,
        stream_id: Uuid,
        is_event: bool,
        matched: &PolicyMatch,
        metadata: serde_json::Value,
    ) -> DeliveryReceipt {
        let message_id = envelope.message_id;
        let partition = partition_for_stream(stream_id, matched.configuration.partition_count);
        let envelope_value = match serde_json::to_value(&envelope) {
            Ok(value) => value,
            Err(error) => {
                return DeliveryReceipt::failed(
                    message_id,
                    format!("envelope serialization failed: {}", error),
                )
            }
        };

        self.coordinator.enqueue_outbox(NewOutboxMessage {
            message_id,
            destination: matched.configuration.topic.clone(),
            event_type: message_type.to_string(),
            envelope_type: message_type.to_string(),
            envelope: envelope_value.clone(),
            metadata,
            stream_id,
            partition_number: partition,
            is_event,
        });

        // Policies may have accumulated extra publish destinations; each gets
        // its own mirror row so completion is tracked per destination. Mirror
        // rows never re-enter the event store.
        for target in &matched.configuration.publish_targets {
            self.coordinator.enqueue_outbox(NewOutboxMessage {
                message_id: Uuid::now_v7(),
                destination: target.clone(),
                event_type: message_type.to_string(),
                envelope_type: message_type.to_string(),
                envelope: envelope_value.clone(),
                metadata: json!({"mirror_of": message_id}),
                stream_id,
                partition_number: partition,
                is_event: false,
            });
        }

        debug!(
            message_id = %message_id,
            destination = %matched.configuration.topic,
            is_event,
            extra_targets = matched.configuration.publish_targets.len(),
            "Message enqueued to outbox"
        );
        DeliveryReceipt::queued(message_id)
    }
}

impl DispatcherBuilder {
    pub fn receptors(mut self, receptors: ReceptorRegistry) -> Self {
        self.receptors = receptors;
        self
    }

    pub fn serial_queue_capacity(mut self, capacity: usize) -> Self {
        self.serial_queue_capacity = capacity;
        self
    }

    pub fn parallel_capacity(mut self, capacity: usize) -> Self {
        self.parallel_capacity = capacity;
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            instance: self.instance,
            policies: self.policies,
            receptors: self.receptors,
            coordinator: self.coordinator,
            store: self.store,
            serial: ExecutorFleet::new(self.serial_queue_capacity),
            parallel: ParallelExecutor::new(self.parallel_capacity),
        }
    }
}
