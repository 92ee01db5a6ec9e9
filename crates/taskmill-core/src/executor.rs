//! Pluggable task execution.
//!
//! An executor does the actual work for a task.  The scheduler creates a
//! fresh [`ComputeContext`] for every attempt and drops it when the attempt
//! returns; executors hold no state across attempts and the task keeps no
//! back-pointer to the context.
//!
//! Cancellation is cooperative: well-behaved executors poll
//! [`ComputeContext::should_stop`] at reasonable granularity and return
//! promptly with a truthful partial result when it trips.  The scheduler
//! never forcibly aborts a running executor other than through the
//! per-attempt deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::task::{Task, TaskStatus};

/// Cooperative stop signal shared between the scheduler and one execution
/// attempt.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Request that the attempt stop at its next poll.
    pub fn trigger(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop has been requested.
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-attempt execution handle passed to [`TaskExecutor::execute_task`].
pub struct ComputeContext {
    task: Task,
    flag: CancelFlag,
}

impl ComputeContext {
    /// Create a context with a fresh stop flag.
    #[must_use]
    pub fn new(task: Task) -> Self {
        Self::with_flag(task, CancelFlag::default())
    }

    /// Create a context around an externally held stop flag.
    #[must_use]
    pub fn with_flag(task: Task, flag: CancelFlag) -> Self {
        Self { task, flag }
    }

    /// The task being executed.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// A clone of this attempt's stop flag.
    #[must_use]
    pub fn flag(&self) -> CancelFlag {
        self.flag.clone()
    }

    /// Whether the attempt should wind down: either the stop flag was
    /// triggered or the task has been cancelled.
    pub fn should_stop(&self) -> bool {
        self.flag.is_set() || self.task.status() == TaskStatus::Cancelled
    }
}

/// The "do the work" seam attached to a task.
///
/// Implementations should update progress via
/// [`Task::update_progress`](crate::task::Task::update_progress) as they go,
/// and either return before any external execution deadline or accept that
/// the worker's deadline timer aborts the attempt.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task to completion (or early cooperative exit), returning an
    /// arbitrary JSON result.
    async fn execute_task(&self, ctx: &ComputeContext) -> anyhow::Result<Value>;
}

/// Built-in executor that simulates work.
///
/// Performs ten equal steps of 0.2 s, reporting progress after each one and
/// returning early when cancellation is observed.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultExecutor;

impl DefaultExecutor {
    const STEPS: u32 = 10;
    const STEP_DELAY: Duration = Duration::from_millis(200);
}

#[async_trait]
impl TaskExecutor for DefaultExecutor {
    async fn execute_task(&self, ctx: &ComputeContext) -> anyhow::Result<Value> {
        let task = ctx.task();
        for step in 0..Self::STEPS {
            tokio::time::sleep(Self::STEP_DELAY).await;
            task.update_progress(f64::from(step + 1) / f64::from(Self::STEPS));
            if ctx.should_stop() {
                return Ok(json!({
                    "task_id": task.id(),
                    "status": "cancelled",
                    "message": format!("interrupted after step {} of {}", step + 1, Self::STEPS),
                }));
            }
        }
        Ok(json!({
            "task_id": task.id(),
            "status": "completed",
            "message": format!("task {} finished", task.title()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;

    fn test_task() -> Task {
        Task::builder("exec")
            .bus(EventBus::with_workers(1))
            .build()
            .expect("task should build")
    }

    #[tokio::test]
    async fn default_executor_reports_progress() {
        tokio::time::pause();
        let task = test_task();
        let ctx = ComputeContext::new(task.clone());

        let run = tokio::spawn(async move { DefaultExecutor.execute_task(&ctx).await });
        let result = run.await.expect("join").expect("execute");

        assert_eq!(task.progress(), 1.0);
        assert_eq!(result["status"], "completed");
        assert_eq!(result["task_id"], task.id());
    }

    #[tokio::test]
    async fn default_executor_observes_stop_flag() {
        tokio::time::pause();
        let task = test_task();
        let ctx = ComputeContext::new(task.clone());
        let flag = ctx.flag();
        flag.trigger();

        let result = DefaultExecutor.execute_task(&ctx).await.expect("execute");
        assert_eq!(result["status"], "cancelled");
        assert!(task.progress() < 1.0);
    }

    #[tokio::test]
    async fn default_executor_observes_cancelled_status() {
        tokio::time::pause();
        let task = test_task();
        task.cancel();

        let ctx = ComputeContext::new(task.clone());
        let result = DefaultExecutor.execute_task(&ctx).await.expect("execute");
        assert_eq!(result["status"], "cancelled");
    }

    #[test]
    fn context_stop_conditions() {
        let task = test_task();
        let ctx = ComputeContext::new(task.clone());
        assert!(!ctx.should_stop());

        ctx.flag().trigger();
        assert!(ctx.should_stop());

        let ctx = ComputeContext::new(task.clone());
        task.cancel();
        assert!(ctx.should_stop());
    }
}
