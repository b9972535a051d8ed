//! Ordered policy evaluation with a diagnostic decision trail.

use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::warn;
use uuid::Uuid;

use crate::routing::{default_topic, ExecutorKind, SizeLimitAction};

/// What the policy engine evaluates against.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub message_type: String,
    pub is_event: bool,
    pub stream_id: Uuid,
    pub metadata: serde_json::Value,
}

impl PolicyContext {
    pub fn new(message_type: impl Into<String>, is_event: bool, stream_id: Uuid) -> Self {
        Self {
            message_type: message_type.into(),
            is_event,
            stream_id,
            metadata: serde_json::Value::Null,
        }
    }
}

/// The resolved routing decision for one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfiguration {
    pub topic: String,
    pub stream_key: Option<String>,
    pub executor: ExecutorKind,
    pub partition_count: i32,
    pub max_data_size_bytes: usize,
    pub on_size_exceeded: SizeLimitAction,
    /// Additional publish destinations, accumulated across matches.
    pub publish_targets: Vec<String>,
    /// Subscription destinations, accumulated across matches.
    pub subscribe_targets: Vec<String>,
}

impl Default for PolicyConfiguration {
    fn default() -> Self {
        Self {
            topic: String::new(),
            stream_key: None,
            executor: ExecutorKind::Serial,
            partition_count: 1,
            max_data_size_bytes: 7_000,
            on_size_exceeded: SizeLimitAction::Warn,
            publish_targets: Vec::new(),
            subscribe_targets: Vec::new(),
        }
    }
}

/// Outcome of evaluating one policy against one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionOutcome {
    Matched,
    Skipped,
    Error(String),
}

/// One entry in the decision trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub policy: String,
    pub outcome: DecisionOutcome,
}

/// Result of a full evaluation: the configuration plus the trail of every
/// policy considered. The trail is diagnostic only and never serialized to
/// the wire.
#[derive(Debug, Clone)]
pub struct PolicyMatch {
    pub configuration: PolicyConfiguration,
    pub matched: bool,
    pub trail: Vec<PolicyDecision>,
}

type Predicate = dyn Fn(&PolicyContext) -> bool + Send + Sync;
type Configurator = dyn Fn(&PolicyContext, &mut PolicyConfiguration) + Send + Sync;

struct Policy {
    name: String,
    predicate: Box<Predicate>,
    configurator: Box<Configurator>,
}

/// An ordered list of (name, predicate, configurator) triples.
///
/// Evaluation walks the whole list: the first match establishes the base
/// configuration (topic, stream key, executor, partitions, size limits);
/// later matches may only append publish/subscribe targets, never overwrite
/// the base fields. Predicates that panic are recorded in the trail as
/// errors and treated as misses.
pub struct PolicyEngine {
    policies: Vec<Policy>,
    defaults: PolicyConfiguration,
}

impl PolicyEngine {
    pub fn builder() -> PolicyEngineBuilder {
        PolicyEngineBuilder {
            policies: Vec::new(),
            defaults: PolicyConfiguration::default(),
        }
    }

    /// Evaluate every policy in order against the context.
    pub fn match_message(&self, context: &PolicyContext) -> PolicyMatch {
        let mut configuration = self.defaults.clone();
        let mut trail = Vec::with_capacity(self.policies.len());
        let mut matched = false;

        for policy in &self.policies {
            let verdict = catch_unwind(AssertUnwindSafe(|| (policy.predicate)(context)));
            match verdict {
                Ok(true) => {
                    if !matched {
                        (policy.configurator)(context, &mut configuration);
                    } else {
                        // The first match owns the base configuration; later
                        // matches may only accumulate delivery targets.
                        let mut scratch = configuration.clone();
                        (policy.configurator)(context, &mut scratch);
                        configuration.publish_targets = scratch.publish_targets;
                        configuration.subscribe_targets = scratch.subscribe_targets;
                    }
                    matched = true;
                    trail.push(PolicyDecision {
                        policy: policy.name.clone(),
                        outcome: DecisionOutcome::Matched,
                    });
                }
                Ok(false) => {
                    trail.push(PolicyDecision {
                        policy: policy.name.clone(),
                        outcome: DecisionOutcome::Skipped,
                    });
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "policy predicate panicked".to_string());
                    warn!(policy = %policy.name, error = %message, "Policy predicate failed");
                    trail.push(PolicyDecision {
                        policy: policy.name.clone(),
                        outcome: DecisionOutcome::Error(message),
                    });
                }
            }
        }

        if configuration.topic.is_empty() {
            configuration.topic = default_topic(&context.message_type);
        }
        if configuration.stream_key.is_none() {
            configuration.stream_key = Some(context.stream_id.to_string());
        }

        PolicyMatch {
            configuration,
            matched,
            trail,
        }
    }
}

pub struct PolicyEngineBuilder {
    policies: Vec<Policy>,
    defaults: PolicyConfiguration,
}

impl PolicyEngineBuilder {
    /// Append a policy. Order of registration is order of evaluation.
    pub fn policy<P, C>(mut self, name: impl Into<String>, predicate: P, configurator: C) -> Self
    where
        P: Fn(&PolicyContext) -> bool + Send + Sync + 'static,
        C: Fn(&PolicyContext, &mut PolicyConfiguration) + Send + Sync + 'static,
    {
        self.policies.push(Policy {
            name: name.into(),
            predicate: Box::new(predicate),
            configurator: Box::new(configurator),
        });
        self
    }

    /// Replace the base configuration applied before any policy runs.
    pub fn defaults(mut self, defaults: PolicyConfiguration) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn build(self) -> PolicyEngine {
        PolicyEngine {
            policies: self.policies,
            defaults: self.defaults,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(message_type: &str) -> PolicyContext {
        PolicyContext::new(message_type, true, Uuid::now_v7())
    }

    #[test]
    fn first_match_configures_and_evaluation_continues() {
        let engine = PolicyEngine::builder()
            .policy(
                "products",
                |ctx: &PolicyContext| ctx.message_type.starts_with("Product"),
                |_, config| {
                    config.topic = "products".to_string();
                    config.partition_count = 4;
                },
            )
            .policy(
                "audit-mirror",
                |_: &PolicyContext| true,
                |_, config| config.publish_targets.push("audit".to_string()),
            )
            .build();

        let result = engine.match_message(&context("ProductCreated, Inventory"));
        assert!(result.matched);
        assert_eq!(result.configuration.topic, "products");
        assert_eq!(result.configuration.partition_count, 4);
        // The second policy still ran and appended its target.
        assert_eq!(result.configuration.publish_targets, vec!["audit"]);
        assert_eq!(result.trail.len(), 2);
        assert_eq!(result.trail[0].outcome, DecisionOutcome::Matched);
        assert_eq!(result.trail[1].outcome, DecisionOutcome::Matched);
    }

    #[test]
    fn misses_are_recorded_and_fall_back_to_defaults() {
        let engine = PolicyEngine::builder()
            .policy(
                "orders-only",
                |ctx: &PolicyContext| ctx.message_type.starts_with("Order"),
                |_, config| config.topic = "orders".to_string(),
            )
            .build();

        let ctx = context("ProductCreated, Inventory");
        let result = engine.match_message(&ctx);
        assert!(!result.matched);
        assert_eq!(result.trail[0].outcome, DecisionOutcome::Skipped);
        assert_eq!(result.configuration.topic, "productcreated");
        assert_eq!(
            result.configuration.stream_key,
            Some(ctx.stream_id.to_string())
        );
    }

    #[test]
    fn panicking_predicate_lands_in_the_trail_as_error() {
        let engine = PolicyEngine::builder()
            .policy(
                "broken",
                |_: &PolicyContext| panic!("predicate bug"),
                |_, _| {},
            )
            .policy(
                "fallback",
                |_: &PolicyContext| true,
                |_, config| config.topic = "fallback".to_string(),
            )
            .build();

        let result = engine.match_message(&context("ProductCreated, Inventory"));
        assert!(matches!(
            result.trail[0].outcome,
            DecisionOutcome::Error(ref msg) if msg.contains("predicate bug")
        ));
        assert_eq!(result.configuration.topic, "fallback");
        assert!(result.matched);
    }

    #[test]
    fn later_matches_cannot_overwrite_the_base_configuration() {
        let engine = PolicyEngine::builder()
            .policy(
                "products",
                |_: &PolicyContext| true,
                |_, config| {
                    config.topic = "products".to_string();
                    config.partition_count = 4;
                    config.executor = crate::routing::ExecutorKind::Serial;
                },
            )
            .policy(
                "greedy",
                |_: &PolicyContext| true,
                |_, config| {
                    // A later match that tries to take over the base fields.
                    config.topic = "hijacked".to_string();
                    config.partition_count = 1;
                    config.executor = crate::routing::ExecutorKind::Parallel;
                    config.max_data_size_bytes = 1;
                    config.publish_targets.push("mirror".to_string());
                },
            )
            .build();

        let result = engine.match_message(&context("ProductCreated, Inventory"));
        assert_eq!(result.configuration.topic, "products");
        assert_eq!(result.configuration.partition_count, 4);
        assert_eq!(
            result.configuration.executor,
            crate::routing::ExecutorKind::Serial
        );
        assert_ne!(result.configuration.max_data_size_bytes, 1);
        // The target it appended still lands.
        assert_eq!(result.configuration.publish_targets, vec!["mirror"]);
        assert_eq!(result.trail[1].outcome, DecisionOutcome::Matched);
    }

    #[test]
    fn later_policies_accumulate_targets_without_short_circuit() {
        let engine = PolicyEngine::builder()
            .policy(
                "fanout-a",
                |_: &PolicyContext| true,
                |_, config| config.publish_targets.push("a".to_string()),
            )
            .policy(
                "fanout-b",
                |_: &PolicyContext| true,
                |_, config| {
                    config.publish_targets.push("b".to_string());
                    config.subscribe_targets.push("b-sub".to_string());
                },
            )
            .build();

        let result = engine.match_message(&context("ProductCreated, Inventory"));
        assert_eq!(result.configuration.publish_targets, vec!["a", "b"]);
        assert_eq!(result.configuration.subscribe_targets, vec!["b-sub"]);
    }
}
