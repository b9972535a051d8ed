//! Message envelope wire format.
//!
//! Every message that crosses a process boundary travels inside an
//! [`Envelope`]: the payload plus a message id and the ordered list of
//! [`Hop`]s the message has taken through the system. The envelope is
//! serialized as JSON with PascalCase field names (`MessageId`, `Payload`,
//! `Hops`); the envelope type travels out-of-band in a transport header
//! ([`EnvelopeHeaders`]) so the receiver can select the correct payload
//! deserializer without inspecting the body.
//!
//! Hops form a flat array with an explicit discriminator: exactly one hop is
//! marked `Current`; hops retained for tracing are demoted to `Causation`
//! when a new hop is stamped. There is never a pointer graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod error;

pub use error::{EnvelopeError, EnvelopeResult};

/// Default upper bound for an encoded envelope, aligned with the Postgres
/// TOAST threshold so oversized payloads are caught before they hit storage.
pub const DEFAULT_MAX_DATA_SIZE_BYTES: usize = 7_000;

/// Generate a new time-ordered message id.
pub fn new_message_id() -> Uuid {
    Uuid::now_v7()
}

/// Role of a hop within the envelope's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HopType {
    /// The hop being executed right now. Exactly one per envelope.
    Current,
    /// A prior traversal kept for tracing.
    Causation,
}

/// One traversal of the message through a service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Hop {
    #[serde(rename = "Type")]
    pub hop_type: HopType,
    /// Identity of the service instance that stamped this hop.
    pub service_instance: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub correlation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub causation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stream_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partition_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence_number: Option<i64>,
    #[serde(skip_serializing_if = "serde_json::Value::is_null", default)]
    pub metadata: serde_json::Value,
}

impl Hop {
    /// Create a bare `Current` hop for the given service instance.
    pub fn current(service_instance: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            hop_type: HopType::Current,
            service_instance: service_instance.into(),
            timestamp,
            correlation_id: None,
            causation_id: None,
            topic: None,
            stream_key: None,
            partition_index: None,
            sequence_number: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_stream_key(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = Some(stream_key.into());
        self
    }

    pub fn with_partition(mut self, partition_index: i32) -> Self {
        self.partition_index = Some(partition_index);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Wrapper carrying a payload, message id and ordered hop history.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub message_id: Uuid,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub hops: Vec<Hop>,
}

impl Envelope {
    /// Wrap a payload with a fresh time-ordered message id and no hops.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            message_id: new_message_id(),
            payload,
            hops: Vec::new(),
        }
    }

    /// Wrap a serializable payload.
    pub fn wrap<T: Serialize>(payload: &T) -> EnvelopeResult<Self> {
        Ok(Self::new(serde_json::to_value(payload)?))
    }

    /// The hop currently being executed, if any.
    pub fn current_hop(&self) -> Option<&Hop> {
        self.hops.iter().find(|h| h.hop_type == HopType::Current)
    }

    /// Correlation id of the current hop, falling back to the message id.
    pub fn correlation_id(&self) -> Uuid {
        self.current_hop()
            .and_then(|h| h.correlation_id)
            .unwrap_or(self.message_id)
    }

    /// Causation id of the current hop.
    pub fn causation_id(&self) -> Option<Uuid> {
        self.current_hop().and_then(|h| h.causation_id)
    }

    /// Build the next hop for a message derived from this envelope: the new
    /// hop inherits the correlation chain and records this message as its
    /// cause.
    pub fn next_hop(&self, service_instance: impl Into<String>, now: DateTime<Utc>) -> Hop {
        Hop::current(service_instance, now)
            .with_correlation(self.correlation_id())
            .with_causation(self.message_id)
    }

    /// Stamp a new `Current` hop, demoting any existing `Current` hop to
    /// `Causation`.
    pub fn push_hop(&mut self, mut hop: Hop) {
        for existing in &mut self.hops {
            if existing.hop_type == HopType::Current {
                existing.hop_type = HopType::Causation;
            }
        }
        hop.hop_type = HopType::Current;
        self.hops.push(hop);
    }

    /// Size of the JSON encoding in bytes.
    pub fn encoded_size(&self) -> EnvelopeResult<usize> {
        Ok(serde_json::to_vec(self)?.len())
    }

    /// Reject envelopes whose encoding exceeds `limit` bytes.
    pub fn validate_size(&self, limit: usize) -> EnvelopeResult<usize> {
        let size = self.encoded_size()?;
        if size > limit {
            return Err(EnvelopeError::SizeExceeded { size, limit });
        }
        Ok(size)
    }

    /// Deserialize the payload into a concrete type.
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> EnvelopeResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Out-of-band headers accompanying an envelope on the wire.
///
/// The envelope type is deliberately not part of the body: the receiver uses
/// it to pick a payload deserializer before touching the JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeaders {
    pub envelope_type: String,
    /// Name of the service that produced the envelope.
    pub source: String,
}

impl EnvelopeHeaders {
    pub fn new(envelope_type: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            envelope_type: envelope_type.into(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format_uses_pascal_case_fields() {
        let envelope = Envelope::new(json!({"name": "widget"}));
        let wire = serde_json::to_value(&envelope).unwrap();

        assert!(wire.get("MessageId").is_some());
        assert!(wire.get("Payload").is_some());
        assert!(wire.get("Hops").is_some());
        assert!(wire.get("message_id").is_none());
    }

    #[test]
    fn message_ids_are_time_ordered() {
        let a = new_message_id();
        let b = new_message_id();
        assert!(a < b);
    }

    #[test]
    fn push_hop_demotes_previous_current() {
        let mut envelope = Envelope::new(json!({}));
        let now = Utc::now();

        envelope.push_hop(Hop::current("svc-a/1", now));
        envelope.push_hop(Hop::current("svc-b/1", now).with_topic("products"));

        assert_eq!(envelope.hops.len(), 2);
        assert_eq!(envelope.hops[0].hop_type, HopType::Causation);
        assert_eq!(envelope.hops[1].hop_type, HopType::Current);
        assert_eq!(envelope.current_hop().unwrap().service_instance, "svc-b/1");
    }

    #[test]
    fn next_hop_inherits_correlation_and_records_causation() {
        let mut envelope = Envelope::new(json!({}));
        let correlation = Uuid::now_v7();
        let now = Utc::now();
        envelope.push_hop(Hop::current("svc-a/1", now).with_correlation(correlation));

        let hop = envelope.next_hop("svc-b/1", now);

        assert_eq!(hop.correlation_id, Some(correlation));
        assert_eq!(hop.causation_id, Some(envelope.message_id));
    }

    #[test]
    fn correlation_falls_back_to_message_id() {
        let envelope = Envelope::new(json!({}));
        assert_eq!(envelope.correlation_id(), envelope.message_id);
    }

    #[test]
    fn metadata_round_trips_every_json_shape() {
        let metadata = json!({
            "string": "value",
            "int": 42,
            "float": 1.5,
            "bool": true,
            "null": null,
            "array": [1, "two", {"three": 3}],
            "nested": {"inner": {"deep": [true, false]}}
        });
        let mut envelope = Envelope::new(json!({"ok": true}));
        envelope.push_hop(Hop::current("svc/1", Utc::now()).with_metadata(metadata.clone()));

        let bytes = serde_json::to_vec(&envelope).unwrap();
        let decoded: Envelope = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(decoded.hops[0].metadata, metadata);
        assert_eq!(decoded.message_id, envelope.message_id);
    }

    #[test]
    fn size_validation_rejects_oversized_envelopes() {
        let envelope = Envelope::new(json!({"blob": "x".repeat(8_000)}));

        let err = envelope.validate_size(DEFAULT_MAX_DATA_SIZE_BYTES).unwrap_err();
        assert!(matches!(err, EnvelopeError::SizeExceeded { .. }));

        let small = Envelope::new(json!({"ok": true}));
        assert!(small.validate_size(DEFAULT_MAX_DATA_SIZE_BYTES).is_ok());
    }
}
