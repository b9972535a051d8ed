//! Receptor registration and lookup.
//!
//! Receptors handle commands locally. The registry is built once at startup
//! and handed to the dispatcher; there is no mutation after construction,
//! and lookup never inspects types at message-processing time. It is a
//! plain fuzzy-matched table scan over registered type names.

use async_trait::async_trait;
use envelope_schema::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use coordination_store::fuzzy_match;

/// Context handed to a receptor invocation.
#[derive(Debug, Clone)]
pub struct ReceptorContext {
    pub message_type: String,
    pub stream_id: Uuid,
    pub correlation_id: Uuid,
}

/// A command handler.
#[async_trait]
pub trait Receptor: Send + Sync {
    async fn handle(&self, envelope: &Envelope, context: &ReceptorContext) -> Result<(), String>;
}

struct Registration {
    message_type: String,
    receptor: Arc<dyn Receptor>,
}

/// Immutable name -> receptor table.
#[derive(Default)]
pub struct ReceptorRegistry {
    by_name: HashMap<String, Registration>,
}

impl ReceptorRegistry {
    pub fn builder() -> ReceptorRegistryBuilder {
        ReceptorRegistryBuilder {
            by_name: HashMap::new(),
        }
    }

    /// Find the receptor registered for a message type, fuzzy-matched.
    /// Returns the registration name alongside the receptor for the
    /// processing log.
    pub fn receptor_for(&self, message_type: &str) -> Option<(&str, Arc<dyn Receptor>)> {
        self.by_name
            .iter()
            .find(|(_, reg)| fuzzy_match(&reg.message_type, message_type))
            .map(|(name, reg)| (name.as_str(), reg.receptor.clone()))
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

pub struct ReceptorRegistryBuilder {
    by_name: HashMap<String, Registration>,
}

impl ReceptorRegistryBuilder {
    pub fn receptor(
        mut self,
        name: impl Into<String>,
        message_type: impl Into<String>,
        receptor: Arc<dyn Receptor>,
    ) -> Self {
        self.by_name.insert(
            name.into(),
            Registration {
                message_type: message_type.into(),
                receptor,
            },
        );
        self
    }

    pub fn build(self) -> ReceptorRegistry {
        ReceptorRegistry {
            by_name: self.by_name,
        }
    }
}
