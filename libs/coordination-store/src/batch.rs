//! Batch request and reply types for `process_work_batch`.
//!
//! One request carries everything a worker wants applied atomically in a
//! single polling cycle: its heartbeat, buffered new messages, the state
//! transitions it observed since the last cycle, and its claim parameters.
//! The reply carries the work it should execute next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::types::{
    InboxWork, InstanceIdentity, NewInboxMessage, NewOutboxMessage, OutboxWork, PerspectiveWork,
};

/// Claim parameters for one batch round.
#[derive(Debug, Clone)]
pub struct WorkBatchOptions {
    /// Explicit wall time, so lease arithmetic is deterministic in tests.
    pub now: DateTime<Utc>,
    pub lease_duration: Duration,
    pub partition_count: i32,
    /// Partitions assigned to this caller. `None` claims from all.
    pub partitions: Option<Vec<i32>>,
    /// Maximum rows claimed per work table.
    pub batch_size: i32,
}

impl WorkBatchOptions {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now,
            lease_duration: Duration::from_secs(30),
            partition_count: 1,
            partitions: None,
            batch_size: 100,
        }
    }

    pub fn with_lease(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn with_batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_partitions(mut self, partition_count: i32, partitions: Option<Vec<i32>>) -> Self {
        self.partition_count = partition_count;
        self.partitions = partitions;
        self
    }
}

/// A failure report for a work row. `poison` marks the row terminal after the
/// caller's attempt threshold was exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureReport {
    pub id: Uuid,
    pub error: String,
    #[serde(default)]
    pub poison: bool,
}

impl FailureReport {
    pub fn new(id: Uuid, error: impl Into<String>) -> Self {
        Self {
            id,
            error: error.into(),
            poison: false,
        }
    }

    pub fn poison(id: Uuid, error: impl Into<String>) -> Self {
        Self {
            id,
            error: error.into(),
            poison: true,
        }
    }
}

/// Perspective-level progress report: the checkpoint for
/// `(stream_id, perspective_name)` advances to `last_event_id` on completion,
/// or records `error` on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerspectiveReport {
    pub stream_id: Uuid,
    pub perspective_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_event_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// State transitions accumulated since the previous cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateTransitions {
    #[serde(default)]
    pub outbox_completions: Vec<Uuid>,
    #[serde(default)]
    pub outbox_failures: Vec<FailureReport>,
    #[serde(default)]
    pub inbox_completions: Vec<Uuid>,
    #[serde(default)]
    pub inbox_failures: Vec<FailureReport>,
    #[serde(default)]
    pub perspective_event_completions: Vec<Uuid>,
    #[serde(default)]
    pub perspective_event_failures: Vec<FailureReport>,
    #[serde(default)]
    pub perspective_completions: Vec<PerspectiveReport>,
    #[serde(default)]
    pub perspective_failures: Vec<PerspectiveReport>,
}

impl StateTransitions {
    pub fn is_empty(&self) -> bool {
        self.outbox_completions.is_empty()
            && self.outbox_failures.is_empty()
            && self.inbox_completions.is_empty()
            && self.inbox_failures.is_empty()
            && self.perspective_event_completions.is_empty()
            && self.perspective_event_failures.is_empty()
            && self.perspective_completions.is_empty()
            && self.perspective_failures.is_empty()
    }

    /// Fold another transition set into this one.
    pub fn merge(&mut self, other: StateTransitions) {
        self.outbox_completions.extend(other.outbox_completions);
        self.outbox_failures.extend(other.outbox_failures);
        self.inbox_completions.extend(other.inbox_completions);
        self.inbox_failures.extend(other.inbox_failures);
        self.perspective_event_completions
            .extend(other.perspective_event_completions);
        self.perspective_event_failures
            .extend(other.perspective_event_failures);
        self.perspective_completions
            .extend(other.perspective_completions);
        self.perspective_failures.extend(other.perspective_failures);
    }
}

/// New rows accumulated by the work coordinator since the previous flush.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMessages {
    #[serde(default)]
    pub outbox: Vec<NewOutboxMessage>,
    #[serde(default)]
    pub inbox: Vec<NewInboxMessage>,
}

impl NewMessages {
    pub fn is_empty(&self) -> bool {
        self.outbox.is_empty() && self.inbox.is_empty()
    }
}

/// One atomic round of claim/complete/fail/auto-create.
#[derive(Debug, Clone)]
pub struct WorkBatchRequest {
    pub instance: InstanceIdentity,
    pub options: WorkBatchOptions,
    pub new_messages: NewMessages,
    pub transitions: StateTransitions,
}

impl WorkBatchRequest {
    pub fn new(instance: InstanceIdentity, options: WorkBatchOptions) -> Self {
        Self {
            instance,
            options,
            new_messages: NewMessages::default(),
            transitions: StateTransitions::default(),
        }
    }
}

/// Work claimed for the caller, ordered as it must be executed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkBatchReply {
    #[serde(default)]
    pub outbox_work: Vec<OutboxWork>,
    #[serde(default)]
    pub inbox_work: Vec<InboxWork>,
    #[serde(default)]
    pub perspective_work: Vec<PerspectiveWork>,
}

impl WorkBatchReply {
    pub fn is_empty(&self) -> bool {
        self.outbox_work.is_empty()
            && self.inbox_work.is_empty()
            && self.perspective_work.is_empty()
    }

    pub fn total(&self) -> usize {
        self.outbox_work.len() + self.inbox_work.len() + self.perspective_work.len()
    }
}
