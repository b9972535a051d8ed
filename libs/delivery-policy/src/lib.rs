//! # Delivery Policy
//!
//! Deterministic mapping from a message to its routing decision: topic,
//! stream key, executor kind, partition count and envelope size limits.
//! Policies are an ordered list of (name, predicate, configurator) triples
//! evaluated against every dispatched message; each evaluation is recorded
//! in a diagnostic decision trail.

mod engine;
mod routing;

pub use engine::{
    DecisionOutcome, PolicyConfiguration, PolicyContext, PolicyDecision, PolicyEngine,
    PolicyEngineBuilder, PolicyMatch,
};
pub use routing::{default_topic, partition_for_stream, ExecutorKind, SizeLimitAction};
