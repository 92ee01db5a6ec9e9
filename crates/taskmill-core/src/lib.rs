//! Taskmill task model.
//!
//! This crate provides the data layer of the Taskmill background job runner:
//!
//! - **[`task`]** -- The [`Task`] record and its strict lifecycle state
//!   machine, with atomic status transitions and clamped progress updates.
//! - **[`bus`]** -- Thread-safe publish/subscribe [`EventBus`] carrying
//!   task lifecycle events to observers on a small dispatch pool.
//! - **[`executor`]** -- The pluggable [`TaskExecutor`] seam with
//!   cooperative cancellation via [`ComputeContext`].
//! - **[`result`]** -- Per-execution [`TaskResult`] records (timeline,
//!   metrics, structured errors).
//! - **[`wire`]** -- Lenient wire-format (de)serialization for tasks.
//! - **[`error`]** -- Unified [`CoreError`] via `thiserror`.
//!
//! All public types are `Send + Sync` and designed for use from both plain
//! threads and a multi-threaded tokio runtime.  Scheduling lives in the
//! `taskmill-kernel` crate.

pub mod bus;
pub mod error;
pub mod executor;
pub mod result;
pub mod task;
pub mod wire;

// Re-export the most commonly used types at the crate root for convenience.
pub use bus::{EventBus, EventCallback, TaskEvent, topics};
pub use error::{CoreError, Result};
pub use executor::{CancelFlag, ComputeContext, DefaultExecutor, TaskExecutor};
pub use result::{ErrorDetail, ErrorKind, TaskResult};
pub use task::{Task, TaskBuilder, TaskPriority, TaskSnapshot, TaskStatus};
pub use wire::TaskRecord;
