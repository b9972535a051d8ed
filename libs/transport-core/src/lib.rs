//! # Transport Core
//!
//! The transport abstraction the runtime publishes through and consumes
//! from. Concrete wire drivers (AMQP, Kafka, Service Bus) live outside the
//! engine and implement [`Transport`]; the in-process transport in this
//! crate serves tests and single-process deployments.

use async_trait::async_trait;
use envelope_schema::{Envelope, EnvelopeHeaders};
use std::collections::BTreeMap;

mod error;
mod in_process;

pub use error::{TransportError, TransportResult};
pub use in_process::InProcessTransport;

/// Where a message goes. `metadata` is transport-specific (consumer group,
/// subscription name, SQL filter, partition).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub address: String,
    pub routing_key: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl Destination {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            routing_key: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Receives envelopes delivered by a subscription.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope, headers: EnvelopeHeaders) -> Result<(), String>;
}

/// A live subscription. Dropping it disposes the subscription and stops
/// delivery.
pub trait Subscription: Send + Sync {
    /// Stop delivering; received messages buffer until resume.
    fn pause(&self);
    /// Resume delivery, draining anything buffered while paused.
    fn resume(&self);
    fn is_paused(&self) -> bool;
}

/// One message transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logs and readiness reporting.
    fn name(&self) -> &str;

    /// Whether the transport is currently able to publish.
    async fn is_ready(&self) -> bool;

    async fn publish(
        &self,
        envelope: &Envelope,
        headers: &EnvelopeHeaders,
        destination: &Destination,
    ) -> TransportResult<()>;

    async fn subscribe(
        &self,
        destination: &Destination,
        handler: std::sync::Arc<dyn TransportHandler>,
    ) -> TransportResult<Box<dyn Subscription>>;
}
