//! Kernel error types.
//!
//! All scheduling subsystems surface errors through [`KernelError`].
//! Execution-side failures (`ExecutionTimeout`, `Executor`) never escape to
//! callers: the worker converts them into a `Failed` task status subject to
//! the retry policy.  Lookups of unknown task ids are not errors here:
//! `get_status`/`get_position` return `Option`-shaped answers and
//! `cancel_task` returns `false`.

use std::time::Duration;

use taskmill_core::CoreError;

/// Unified error type for the Taskmill scheduling kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The scheduler has been shut down and will not accept new work.
    #[error("scheduler is shut down")]
    SchedulerShutdown,

    /// A task-model operation was rejected (bad input or an illegal status
    /// transition).
    #[error(transparent)]
    Task(#[from] CoreError),

    /// A running attempt exceeded its execution deadline.
    #[error("execution timeout after {}s", .limit.as_secs())]
    ExecutionTimeout {
        /// The configured per-attempt limit.
        limit: Duration,
    },

    /// An error escaped the task's executor.
    #[error("executor failed: {0}")]
    Executor(#[source] anyhow::Error),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
