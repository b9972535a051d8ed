//! # Coordination Store
//!
//! Postgres-backed state machine that coordinates event-sourced work across
//! service instances. All durable state for a logical service lives in one
//! relational schema: outbox, inbox, event store, perspective checkpoints,
//! perspective work items, receptor processing log, dedup ledger and the
//! event sequence.
//!
//! ## How coordination works
//!
//! Every worker calls [`WorkStore::process_batch`] once per polling cycle.
//! One call is one database transaction that:
//!
//! 1. Heartbeats the calling instance.
//! 2. Recovers expired leases (a crashed holder's rows return to the pool).
//! 3. Persists claimed outbox events into the event store, assigning the
//!    next global sequence number and per-stream version.
//! 4. Applies the completions/failures the caller observed last cycle.
//! 5. Auto-creates perspective checkpoints and work items for every stored
//!    event whose type fuzzy-matches a registered association.
//! 6. Advances perspective checkpoints monotonically.
//! 7. Claims up to a batch of new work per table under `FOR UPDATE SKIP
//!    LOCKED`, stamping the caller's lease.
//!
//! Within a stream, perspective events are claimed in sequence order and at
//! most one row per (stream, perspective) is outstanding, so per-stream FIFO
//! holds while unrelated streams proceed in parallel.
//!
//! ## Implementations
//!
//! - [`PgWorkStore`]: the production store. Also exposes
//!   [`PgWorkStore::enqueue_outbox_tx`] so business rows and outbox rows
//!   commit in one transaction (the transactional-outbox property).
//! - [`MemoryWorkStore`]: the same semantics in process memory, driven by
//!   the explicit clock in [`WorkBatchOptions`]; used by tests and
//!   single-process deployments.

use async_trait::async_trait;
use uuid::Uuid;

pub mod associations;
pub mod batch;
mod error;
pub mod memory;
pub mod metrics;
pub mod migrate;
pub mod pg;
pub mod schema;
pub mod status;
pub mod types;

pub use associations::{
    fuzzy_match, AssociationRegistry, AssociationType, MessageAssociation, MessageTypeName,
};
pub use batch::{
    FailureReport, NewMessages, PerspectiveReport, StateTransitions, WorkBatchOptions,
    WorkBatchReply, WorkBatchRequest,
};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryWorkStore;
pub use metrics::StoreMetrics;
pub use pg::PgWorkStore;
pub use schema::{SchemaConfig, SchemaStatement};
pub use status::CheckpointStatus;
pub use types::{
    EventRecord, InboxMessageRow, InboxWork, InstanceIdentity, NewEventRecord, NewInboxMessage,
    NewOutboxMessage, OutboxMessageRow, OutboxWork, PerspectiveCheckpoint, PerspectiveEventRow,
    PerspectiveWork,
};

/// The coordination store seen by dispatchers, coordinators and workers.
///
/// `process_batch` is the only mutation path workers use; the remaining
/// methods exist for registration at startup and for inspection by tests and
/// operator tooling.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Run one atomic round of claim/complete/fail/auto-create.
    async fn process_batch(&self, request: WorkBatchRequest) -> StoreResult<WorkBatchReply>;

    /// Install message associations. Called once at startup.
    async fn register_associations(
        &self,
        associations: &[MessageAssociation],
    ) -> StoreResult<()>;

    /// Record a receptor completion or failure. Idempotent: returns `false`
    /// when the (event, receptor) pair was already recorded.
    async fn record_receptor_processing(
        &self,
        event_id: Uuid,
        receptor_name: &str,
        error: Option<&str>,
    ) -> StoreResult<bool>;

    /// Events of one stream in version order.
    async fn load_events(&self, stream_id: Uuid) -> StoreResult<Vec<EventRecord>>;

    /// Current checkpoint for a (stream, perspective) pair.
    async fn checkpoint(
        &self,
        stream_id: Uuid,
        perspective_name: &str,
    ) -> StoreResult<Option<PerspectiveCheckpoint>>;

    /// Perspective work rows for a (stream, perspective) pair in sequence
    /// order.
    async fn perspective_events(
        &self,
        stream_id: Uuid,
        perspective_name: &str,
    ) -> StoreResult<Vec<PerspectiveEventRow>>;

    /// A single outbox row.
    async fn outbox_message(&self, message_id: Uuid) -> StoreResult<Option<OutboxMessageRow>>;

    /// A single inbox row.
    async fn inbox_message(&self, message_id: Uuid) -> StoreResult<Option<InboxMessageRow>>;
}
