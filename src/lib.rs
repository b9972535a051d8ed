//! # Workhive
//!
//! A distributed message-processing runtime that coordinates event-sourced
//! workloads across service instances backed by a shared Postgres store.
//! Producers submit commands and events through a local dispatcher; the
//! runtime persists them transactionally, fans them out over configurable
//! transports, and materializes per-stream perspectives with exactly-once
//! semantics relative to the event store.
//!
//! This crate is a facade over the member libraries:
//!
//! - [`coordination_store`]: the Postgres-backed work coordination state
//!   machine (outbox, inbox, event store, perspective checkpoints, leases).
//! - [`db_pool`]: env-configured Postgres connection pooling.
//! - [`envelope_schema`]: the envelope and hop wire format.
//! - [`delivery_policy`]: message -> topic/stream/executor routing.
//! - [`stream_executors`]: per-stream FIFO and bounded-parallel execution.
//! - [`transport_core`]: the transport abstraction and in-process
//!   transport.
//! - [`work_coordinator`]: per-unit-of-work batching of state transitions.
//! - [`message_dispatch`]: the local dispatcher and receptor registry.
//! - [`runtime_workers`]: publisher, perspective and consumer loops.

pub use coordination_store;
pub use db_pool;
pub use delivery_policy;
pub use envelope_schema;
pub use message_dispatch;
pub use runtime_workers;
pub use stream_executors;
pub use transport_core;
pub use work_coordinator;
