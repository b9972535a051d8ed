//! Row types and insert payloads for the coordination store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::status::CheckpointStatus;

/// Identity of one live process instance. One row per process; owns leases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceIdentity {
    pub instance_id: Uuid,
    pub service_name: String,
    pub host_name: String,
    pub process_id: i32,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InstanceIdentity {
    /// Identity for the current process with a fresh time-ordered id.
    pub fn for_process(service_name: impl Into<String>) -> Self {
        let host_name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        Self {
            instance_id: Uuid::now_v7(),
            service_name: service_name.into(),
            host_name,
            process_id: std::process::id() as i32,
            metadata: serde_json::Value::Null,
        }
    }

    /// A stable label for hop stamping: `service/host/pid`.
    pub fn label(&self) -> String {
        format!("{}/{}/{}", self.service_name, self.host_name, self.process_id)
    }
}

/// A new outbox row, produced by the dispatcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOutboxMessage {
    pub message_id: Uuid,
    pub destination: String,
    pub event_type: String,
    pub envelope_type: String,
    pub envelope: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub stream_id: Uuid,
    pub partition_number: i32,
    pub is_event: bool,
}

/// The event-store record accompanying an inbound event message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEventRecord {
    pub aggregate_type: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub scope: Option<serde_json::Value>,
}

/// A new inbox row, produced by a transport consumer. When the message is an
/// event, `event` carries the record persisted to the event store in the same
/// batch transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInboxMessage {
    pub message_id: Uuid,
    pub source: String,
    pub envelope: serde_json::Value,
    pub stream_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub event: Option<NewEventRecord>,
}

/// Full outbox row as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessageRow {
    pub message_id: Uuid,
    pub destination: String,
    pub event_type: String,
    pub envelope_type: String,
    pub envelope: serde_json::Value,
    pub metadata: serde_json::Value,
    pub stream_id: Uuid,
    pub partition_number: i32,
    pub is_event: bool,
    pub status: i32,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Full inbox row as stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessageRow {
    pub message_id: Uuid,
    pub source: String,
    pub envelope: serde_json::Value,
    pub stream_id: Uuid,
    pub status: i32,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// An immutable event-store row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    pub stream_id: Uuid,
    pub aggregate_type: String,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub scope: Option<serde_json::Value>,
    /// Strictly monotonic across all streams.
    pub sequence_number: i64,
    /// Strictly increasing within `stream_id`.
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Durable progress of one perspective over one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveCheckpoint {
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub last_event_id: Option<Uuid>,
    pub status: CheckpointStatus,
    pub error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

/// One unit of perspective work: a single event for a single perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveEventRow {
    pub event_work_id: Uuid,
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub event_id: Uuid,
    pub sequence_number: i64,
    pub status: i32,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub instance_id: Option<Uuid>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Claimed outbox work returned by the batch function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxWork {
    pub message_id: Uuid,
    pub destination: String,
    pub event_type: String,
    pub envelope_type: String,
    pub envelope: serde_json::Value,
    pub metadata: serde_json::Value,
    pub stream_id: Uuid,
    pub partition_number: i32,
    pub is_event: bool,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
}

/// Claimed inbox work returned by the batch function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxWork {
    pub message_id: Uuid,
    pub source: String,
    pub envelope: serde_json::Value,
    pub stream_id: Uuid,
    pub attempts: i32,
    pub received_at: DateTime<Utc>,
}

/// Claimed perspective work, joined with the event payload the runner needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveWork {
    pub event_work_id: Uuid,
    pub stream_id: Uuid,
    pub perspective_name: String,
    pub event_id: Uuid,
    pub sequence_number: i64,
    pub attempts: i32,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub metadata: serde_json::Value,
    pub version: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_label_carries_service_host_and_pid() {
        let identity = InstanceIdentity::for_process("inventory");
        let label = identity.label();
        assert!(label.starts_with("inventory/"));
        assert!(label.ends_with(&identity.process_id.to_string()));
    }

    #[test]
    fn new_inbox_message_event_is_optional_on_the_wire() {
        let msg = NewInboxMessage {
            message_id: Uuid::now_v7(),
            source: "queue-a".into(),
            envelope: serde_json::json!({}),
            stream_id: Uuid::now_v7(),
            event: None,
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert!(wire.get("event").is_none());
    }
}
