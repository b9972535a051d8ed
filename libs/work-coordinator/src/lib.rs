//! # Work Coordinator
//!
//! Scoped, per-unit-of-work batching of coordination state. A coordinator
//! accumulates outbox inserts, inbox inserts and state transitions; `flush`
//! drains everything into one `process_work_batch` invocation and returns
//! the work the caller should execute.
//!
//! Two flush points exist: [`FlushMode::Immediate`] after a synchronous
//! operation, and [`FlushMode::PostCommit`] after the caller's own database
//! transaction committed (the caller wrote its outbox rows inside that
//! transaction, so the flush only carries transitions). Buffered items that
//! are never flushed are simply dropped with the coordinator.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use coordination_store::{
    FailureReport, InstanceIdentity, NewInboxMessage, NewMessages, NewOutboxMessage,
    PerspectiveReport, StateTransitions, StoreResult, WorkBatchOptions, WorkBatchReply,
    WorkBatchRequest, WorkStore,
};

/// When the flush is happening relative to the caller's work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Called directly after a synchronous operation.
    Immediate,
    /// Called after the ambient database transaction committed.
    PostCommit,
}

/// Claim parameters a coordinator applies to every flush.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub lease_duration: Duration,
    pub partition_count: i32,
    pub partitions: Option<Vec<i32>>,
    pub batch_size: i32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(30),
            partition_count: 1,
            partitions: None,
            batch_size: 100,
        }
    }
}

#[derive(Default)]
struct Buffers {
    new_messages: NewMessages,
    transitions: StateTransitions,
}

/// Accumulates coordination work and flushes it in one batch.
pub struct WorkCoordinator {
    store: Arc<dyn WorkStore>,
    instance: InstanceIdentity,
    config: CoordinatorConfig,
    buffers: Mutex<Buffers>,
}

impl WorkCoordinator {
    pub fn new(
        store: Arc<dyn WorkStore>,
        instance: InstanceIdentity,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            instance,
            config,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    pub fn instance(&self) -> &InstanceIdentity {
        &self.instance
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Buffer an outbox insert for the next flush.
    pub fn enqueue_outbox(&self, message: NewOutboxMessage) {
        self.buffers.lock().new_messages.outbox.push(message);
    }

    /// Buffer an inbox insert for the next flush.
    pub fn enqueue_inbox(&self, message: NewInboxMessage) {
        self.buffers.lock().new_messages.inbox.push(message);
    }

    /// Merge a set of observed transitions into the buffer.
    pub fn report(&self, transitions: StateTransitions) {
        self.buffers.lock().transitions.merge(transitions);
    }

    pub fn report_outbox_completion(&self, message_id: Uuid) {
        self.buffers
            .lock()
            .transitions
            .outbox_completions
            .push(message_id);
    }

    pub fn report_outbox_failure(&self, failure: FailureReport) {
        self.buffers.lock().transitions.outbox_failures.push(failure);
    }

    pub fn report_inbox_completion(&self, message_id: Uuid) {
        self.buffers
            .lock()
            .transitions
            .inbox_completions
            .push(message_id);
    }

    pub fn report_inbox_failure(&self, failure: FailureReport) {
        self.buffers.lock().transitions.inbox_failures.push(failure);
    }

    pub fn report_perspective_event_completion(&self, event_work_id: Uuid) {
        self.buffers
            .lock()
            .transitions
            .perspective_event_completions
            .push(event_work_id);
    }

    pub fn report_perspective_event_failure(&self, failure: FailureReport) {
        self.buffers
            .lock()
            .transitions
            .perspective_event_failures
            .push(failure);
    }

    pub fn report_perspective_completion(&self, report: PerspectiveReport) {
        self.buffers
            .lock()
            .transitions
            .perspective_completions
            .push(report);
    }

    pub fn report_perspective_failure(&self, report: PerspectiveReport) {
        self.buffers
            .lock()
            .transitions
            .perspective_failures
            .push(report);
    }

    /// Whether anything is waiting for the next flush.
    pub fn has_pending(&self) -> bool {
        let buffers = self.buffers.lock();
        !buffers.new_messages.is_empty() || !buffers.transitions.is_empty()
    }

    /// Drain the buffers into one batch invocation. Returns the work claimed
    /// for this instance.
    pub async fn flush(&self, mode: FlushMode, now: DateTime<Utc>) -> StoreResult<WorkBatchReply> {
        self.flush_with_batch_size(mode, now, self.config.batch_size)
            .await
    }

    /// Apply buffered inserts and transitions without claiming any new work.
    /// Shutdown paths use this so reported completions land before exit.
    pub async fn drain(&self, now: DateTime<Utc>) -> StoreResult<()> {
        self.flush_with_batch_size(FlushMode::Immediate, now, 0)
            .await?;
        Ok(())
    }

    async fn flush_with_batch_size(
        &self,
        mode: FlushMode,
        now: DateTime<Utc>,
        batch_size: i32,
    ) -> StoreResult<WorkBatchReply> {
        let drained = {
            let mut buffers = self.buffers.lock();
            std::mem::take(&mut *buffers)
        };

        let options = WorkBatchOptions::new(now)
            .with_lease(self.config.lease_duration)
            .with_batch_size(batch_size)
            .with_partitions(self.config.partition_count, self.config.partitions.clone());

        let mut request = WorkBatchRequest::new(self.instance.clone(), options);
        request.new_messages = drained.new_messages;
        request.transitions = drained.transitions;

        let outbox_inserts = request.new_messages.outbox.len();
        let inbox_inserts = request.new_messages.inbox.len();

        let reply = self.store.process_batch(request).await?;
        debug!(
            ?mode,
            outbox_inserts,
            inbox_inserts,
            claimed = reply.total(),
            "Work coordinator flushed"
        );
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination_store::MemoryWorkStore;
    use serde_json::json;

    fn coordinator() -> WorkCoordinator {
        WorkCoordinator::new(
            Arc::new(MemoryWorkStore::new()),
            InstanceIdentity::for_process("coordinator-test"),
            CoordinatorConfig::default(),
        )
    }

    fn outbox_message() -> NewOutboxMessage {
        let message_id = Uuid::now_v7();
        NewOutboxMessage {
            message_id,
            destination: "products".to_string(),
            event_type: "ProductCreated, Inventory".to_string(),
            envelope_type: "ProductCreated, Inventory".to_string(),
            envelope: json!({"MessageId": message_id, "Payload": {}, "Hops": []}),
            metadata: json!({}),
            stream_id: Uuid::now_v7(),
            partition_number: 0,
            is_event: true,
        }
    }

    #[tokio::test]
    async fn flush_drains_buffers_and_returns_claimed_work() {
        let coordinator = coordinator();
        coordinator.enqueue_outbox(outbox_message());
        assert!(coordinator.has_pending());

        let reply = coordinator
            .flush(FlushMode::Immediate, Utc::now())
            .await
            .unwrap();
        assert_eq!(reply.outbox_work.len(), 1);
        assert!(!coordinator.has_pending(), "flush drained the buffers");
    }

    #[tokio::test]
    async fn flush_with_empty_buffers_still_claims() {
        let coordinator = coordinator();
        coordinator.enqueue_outbox(outbox_message());
        // First flush inserts and claims; a later empty flush is a plain
        // polling cycle.
        coordinator
            .flush(FlushMode::Immediate, Utc::now())
            .await
            .unwrap();
        let reply = coordinator
            .flush(FlushMode::PostCommit, Utc::now())
            .await
            .unwrap();
        assert!(reply.outbox_work.is_empty());
    }

    #[tokio::test]
    async fn transitions_ride_the_next_flush() {
        let coordinator = coordinator();
        coordinator.enqueue_outbox(outbox_message());
        let reply = coordinator
            .flush(FlushMode::Immediate, Utc::now())
            .await
            .unwrap();
        let claimed = reply.outbox_work[0].message_id;

        coordinator.report_outbox_completion(claimed);
        assert!(coordinator.has_pending());
        coordinator
            .flush(FlushMode::Immediate, Utc::now())
            .await
            .unwrap();
        assert!(!coordinator.has_pending());
    }

    #[tokio::test]
    async fn dropped_coordinator_leaks_nothing_into_the_store() {
        let store = Arc::new(MemoryWorkStore::new());
        let message = outbox_message();
        let message_id = message.message_id;
        {
            let coordinator = WorkCoordinator::new(
                store.clone(),
                InstanceIdentity::for_process("dropper"),
                CoordinatorConfig::default(),
            );
            coordinator.enqueue_outbox(message);
            // Never flushed.
        }
        use coordination_store::WorkStore;
        assert!(store.outbox_message(message_id).await.unwrap().is_none());
    }
}
