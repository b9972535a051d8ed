//! # Runtime Workers
//!
//! The long-running loops that drive the coordination engine: the outbox
//! publisher, the perspective materializer and the transport consumer. Each
//! worker polls the store once per cycle through its work coordinator,
//! executes the claimed work, and reports outcomes on the next cycle's
//! batched transitions.
//!
//! All workers share the same lifecycle contract: a `tokio::sync::watch`
//! shutdown signal, drain-then-stop semantics (no new claims after the
//! signal; in-flight handlers finish under their lease), an idle flag after
//! consecutive empty polls, and a jittered backoff loop while the
//! coordination store is unavailable.

use chrono::Utc;
use tokio::time::sleep;

use work_coordinator::WorkCoordinator;

mod config;
mod consumer;
mod perspective;
mod publisher;

pub use config::WorkerConfig;
pub use consumer::{ConsumerBinding, TransportConsumerWorker};
pub use perspective::{PerspectiveRunner, PerspectiveWorker, RunnerRegistry, RunnerRegistryBuilder};
pub use publisher::PublisherWorker;

/// Hold shutdown until the coordinator has stayed quiet for the configured
/// number of consecutive checks, re-draining anything that arrives late.
/// Connections are disposed only after this returns, so no in-flight call is
/// ever cancelled.
pub(crate) async fn wait_until_quiet(coordinator: &WorkCoordinator, config: &WorkerConfig) {
    let mut quiet_checks = 0;
    while quiet_checks < config.quiescence_checks {
        if coordinator.has_pending() {
            quiet_checks = 0;
            let _ = coordinator.drain(Utc::now()).await;
        } else {
            quiet_checks += 1;
        }
        sleep(config.poll_interval).await;
    }
}
