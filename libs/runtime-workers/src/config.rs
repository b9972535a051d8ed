//! Shared worker configuration.

use std::time::Duration;

/// Polling and claiming parameters shared by all worker loops.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Delay between polling cycles. Tests run at 100 ms; production
    /// deployments usually raise this.
    pub poll_interval: Duration,
    /// Consecutive empty polls after which the worker reports idle.
    pub idle_after_empty_polls: u32,
    /// Consecutive quiet checks required before shutdown disposes
    /// connections.
    pub quiescence_checks: u32,
    /// Attempt threshold beyond which a failing row is reported poison.
    pub max_attempts: i32,
    /// Base delay for the store-unavailable backoff loop. Jitter is added.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            idle_after_empty_polls: 2,
            quiescence_checks: 3,
            max_attempts: 5,
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    /// Backoff delay with ±30% jitter for store-outage loops.
    pub fn backoff_with_jitter(&self) -> Duration {
        use rand::Rng;
        let base = self.error_backoff.as_millis() as f64;
        let factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        Duration::from_millis((base * factor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_thirty_percent() {
        let config = WorkerConfig {
            error_backoff: Duration::from_millis(1000),
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = config.backoff_with_jitter().as_millis();
            assert!((700..=1300).contains(&delay), "delay {} out of range", delay);
        }
    }
}
