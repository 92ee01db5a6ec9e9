//! Core error types.
//!
//! All task-model subsystems surface errors through [`CoreError`], which is
//! the single error type returned by every fallible public API in this crate.
//! Each variant carries enough context for callers to decide how to handle
//! the failure without inspecting opaque strings.

use crate::task::TaskStatus;

/// Unified error type for the Taskmill task model.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// A field value failed validation at an input boundary (construction,
    /// deserialization, or direct use).
    #[error("invalid input for `{field}`: {reason}")]
    InvalidInput {
        /// Name of the offending field.
        field: &'static str,
        /// Human-readable description of the violation.
        reason: String,
    },

    /// The requested status transition is not in the transition matrix.
    #[error("invalid status transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        /// The task whose transition was rejected.
        task_id: String,
        /// Status the task was in.
        from: TaskStatus,
        /// Status that was requested.
        to: TaskStatus,
    },
}

/// Convenience alias used throughout the core crate.
pub type Result<T> = std::result::Result<T, CoreError>;
