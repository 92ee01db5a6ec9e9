//! Taskmill scheduling kernel.
//!
//! This crate provides the engine of the Taskmill background job runner:
//!
//! - **[`scheduler`]** -- Bounded worker pool with strict
//!   highest-priority-first dispatch, per-attempt execution deadlines,
//!   bounded automatic retries, and cooperative cancellation.
//! - **[`queue`]** -- Indexed min-heap ordered by `(priority, sequence)`
//!   with O(1) membership checks and arbitrary removal.
//! - **[`position`]** -- TTL-cached "where am I in the queue?" lookups.
//! - **[`scanner`]** -- 1 Hz sweeper that force-fails tasks whose
//!   queue-wait timeout elapsed before dispatch.
//! - **[`error`]** -- Unified [`KernelError`] via `thiserror`.
//!
//! Task data, the state machine, events, and the executor seam live in
//! `taskmill-core`; this crate consumes them.

pub mod error;
pub mod position;
pub mod queue;
pub mod scanner;
pub mod scheduler;

// Re-export the most commonly used types at the crate root for convenience.
pub use error::{KernelError, Result};
pub use position::PositionService;
pub use queue::TaskHeap;
pub use scanner::SCAN_PERIOD;
pub use scheduler::{DEFAULT_MAX_WORKERS, QueueStats, RETRY_LIMIT, Scheduler};
