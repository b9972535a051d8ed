//! # Stream Executors
//!
//! Execution primitives for per-stream ordering and bounded parallelism.
//!
//! - [`SerialExecutor`] processes work for a single stream key in strict
//!   FIFO. Submitters receive a [`SubmitHandle`] that completes when the
//!   worker signals success or failure. Throughput is bounded by the
//!   coordination cycle; ordering is absolute.
//! - [`ParallelExecutor`] bounds concurrency through a counting semaphore
//!   with a synchronous fast path.
//! - [`ExecutorFleet`] keeps one serial executor per stream key: per-key
//!   linearizability, cross-key parallelism, cheap creation and idle
//!   eviction.

mod error;
mod fleet;
mod parallel;
mod serial;

pub use error::{ExecutorError, ExecutorResult};
pub use fleet::ExecutorFleet;
pub use parallel::ParallelExecutor;
pub use serial::{SerialExecutor, SubmitHandle};
