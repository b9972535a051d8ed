use prometheus::{IntCounter, IntGauge, Opts};
use tracing::warn;

/// Prometheus metrics for one service's coordination activity.
#[derive(Clone)]
pub struct StoreMetrics {
    pub batch_rounds: IntCounter,
    pub outbox_claimed: IntCounter,
    pub outbox_completed: IntCounter,
    pub outbox_failed: IntCounter,
    pub outbox_poisoned: IntCounter,
    pub inbox_claimed: IntCounter,
    pub inbox_completed: IntCounter,
    pub perspective_claimed: IntCounter,
    pub perspective_completed: IntCounter,
    pub perspective_failed: IntCounter,
    pub outbox_pending: IntGauge,
    pub inbox_pending: IntGauge,
    pub perspective_pending: IntGauge,
}

impl StoreMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let counter = |name: &str, help: &str| {
            IntCounter::with_opts(
                Opts::new(name, help).const_label("service", service.to_string()),
            )
            .expect("valid metric opts")
        };
        let gauge = |name: &str, help: &str| {
            IntGauge::with_opts(
                Opts::new(name, help).const_label("service", service.to_string()),
            )
            .expect("valid metric opts")
        };

        let batch_rounds = counter(
            "coordination_batch_rounds_total",
            "Total process_work_batch invocations",
        );
        let outbox_claimed = counter(
            "coordination_outbox_claimed_total",
            "Outbox rows claimed for publication",
        );
        let outbox_completed = counter(
            "coordination_outbox_completed_total",
            "Outbox rows completed",
        );
        let outbox_failed = counter("coordination_outbox_failed_total", "Outbox rows failed");
        let outbox_poisoned = counter(
            "coordination_outbox_poisoned_total",
            "Outbox rows marked poison after exceeding the attempt threshold",
        );
        let inbox_claimed = counter("coordination_inbox_claimed_total", "Inbox rows claimed");
        let inbox_completed = counter(
            "coordination_inbox_completed_total",
            "Inbox rows processed",
        );
        let perspective_claimed = counter(
            "coordination_perspective_claimed_total",
            "Perspective work items claimed",
        );
        let perspective_completed = counter(
            "coordination_perspective_completed_total",
            "Perspective work items completed",
        );
        let perspective_failed = counter(
            "coordination_perspective_failed_total",
            "Perspective work items failed",
        );
        let outbox_pending = gauge(
            "coordination_outbox_pending",
            "Outbox rows not yet completed or poisoned",
        );
        let inbox_pending = gauge(
            "coordination_inbox_pending",
            "Inbox rows not yet processed",
        );
        let perspective_pending = gauge(
            "coordination_perspective_pending",
            "Perspective work items not yet completed",
        );

        for metric in [
            Box::new(batch_rounds.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(outbox_claimed.clone()),
            Box::new(outbox_completed.clone()),
            Box::new(outbox_failed.clone()),
            Box::new(outbox_poisoned.clone()),
            Box::new(inbox_claimed.clone()),
            Box::new(inbox_completed.clone()),
            Box::new(perspective_claimed.clone()),
            Box::new(perspective_completed.clone()),
            Box::new(perspective_failed.clone()),
            Box::new(outbox_pending.clone()),
            Box::new(inbox_pending.clone()),
            Box::new(perspective_pending.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register coordination metric: {}", e);
            }
        }

        Self {
            batch_rounds,
            outbox_claimed,
            outbox_completed,
            outbox_failed,
            outbox_poisoned,
            inbox_claimed,
            inbox_completed,
            perspective_claimed,
            perspective_completed,
            perspective_failed,
            outbox_pending,
            inbox_pending,
            perspective_pending,
        }
    }
}
