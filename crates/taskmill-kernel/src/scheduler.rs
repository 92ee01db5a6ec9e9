//! Worker-pool scheduler.
//!
//! The scheduler accepts pending [`Task`]s, orders them in an indexed
//! priority heap, and drives execution on a fixed pool of workers (default
//! 2).  Each enqueue submits one run-request; a worker consumes one
//! run-request, performs a single atomic dispatch step, and then runs the
//! task's executor outside the lock, under the task's execution deadline
//! when one is configured.
//!
//! # Locking
//!
//! One mutex guards the heap, its id index, the active set, the completed
//! map, and the retained result records.  It is never held across an
//! `await`: dispatch and result processing are synchronous critical
//! sections, and execution happens strictly between them.
//!
//! # Task lifecycle
//!
//! ```text
//! enqueue       dispatch        settle
//! Pending -> Queued -> Running -> Completed
//!               ^          \---> Failed --(retry x3)--> Queued
//! ```
//!
//! Cancellation may arrive at any time from any thread: before dispatch it
//! removes the task from the heap; after dispatch it trips the attempt's
//! stop flag and the worker discards the outcome when it returns.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use taskmill_core::TaskExecutor;

use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use taskmill_core::{
    CancelFlag, ComputeContext, CoreError, DefaultExecutor, ErrorKind, EventBus, Task, TaskEvent,
    TaskResult, TaskStatus, topics,
};

use crate::error::{KernelError, Result};
use crate::position::PositionService;
use crate::queue::TaskHeap;
use crate::scanner;

/// Number of workers a [`Scheduler::default`] scheduler runs.
pub const DEFAULT_MAX_WORKERS: usize = 2;
/// Maximum number of automatic retries per task.
pub const RETRY_LIMIT: u32 = 3;

/// Snapshot of the scheduler's bookkeeping sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks waiting in the heap.
    pub queued: usize,
    /// Tasks currently executing.
    pub active: usize,
    /// Tasks retained in the completed map.
    pub completed: usize,
    /// Whether the position cache would serve a lookup right now.
    pub cache_valid: bool,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Priority task scheduler with a bounded worker pool.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across threads and
/// async tasks.  Call [`Scheduler::start`] to spawn the workers and the
/// queue-timeout scanner onto the ambient tokio runtime.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

pub(crate) struct SchedulerInner {
    state: Mutex<SchedulerState>,
    pub(crate) positions: PositionService,
    run_requests: Semaphore,
    pub(crate) shutdown: AtomicBool,
    pub(crate) stop: Notify,
    pub(crate) bus: EventBus,
    max_workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

pub(crate) struct SchedulerState {
    pub(crate) heap: TaskHeap,
    active: HashMap<String, ActiveEntry>,
    completed: HashMap<String, Task>,
    results: HashMap<String, TaskResult>,
}

struct ActiveEntry {
    task: Task,
    flag: CancelFlag,
}

impl SchedulerInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Scheduler {
    /// Create a scheduler publishing to the process-wide event bus.
    ///
    /// The workers are not running until [`Scheduler::start`] is called.
    #[must_use]
    pub fn new(max_workers: usize) -> Self {
        Self::with_bus(max_workers, EventBus::global().clone())
    }

    /// Create a scheduler publishing to `bus` (test isolation, embedders
    /// with their own bus).
    #[must_use]
    pub fn with_bus(max_workers: usize, bus: EventBus) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(SchedulerState {
                    heap: TaskHeap::new(),
                    active: HashMap::new(),
                    completed: HashMap::new(),
                    results: HashMap::new(),
                }),
                positions: PositionService::default(),
                run_requests: Semaphore::new(0),
                shutdown: AtomicBool::new(false),
                stop: Notify::new(),
                bus,
                max_workers: max_workers.max(1),
                handles: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the worker pool and the queue-timeout scanner.
    ///
    /// Starting twice is a no-op.
    pub fn start(&self) {
        let mut handles = self.lock_handles();
        if !handles.is_empty() {
            tracing::warn!("scheduler already started");
            return;
        }
        for worker_id in 0..self.inner.max_workers {
            let inner = Arc::clone(&self.inner);
            handles.push(tokio::spawn(async move {
                Self::worker_loop(inner, worker_id).await;
            }));
        }
        handles.push(tokio::spawn(scanner::run(Arc::clone(&self.inner))));
        tracing::info!(workers = self.inner.max_workers, "scheduler started");
    }

    /// Move a pending task into the queue and submit a run-request.
    ///
    /// Rejects tasks that are not `Pending` with
    /// [`CoreError::InvalidTransition`], and everything once the scheduler
    /// is shut down.
    pub fn enqueue(&self, task: &Task) -> Result<()> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(KernelError::SchedulerShutdown);
        }
        let mut state = self.inner.lock_state();
        let status = task.status();
        if status != TaskStatus::Pending {
            return Err(KernelError::Task(CoreError::InvalidTransition {
                task_id: task.id().to_string(),
                from: status,
                to: TaskStatus::Queued,
            }));
        }
        task.try_transition(TaskStatus::Queued)?;
        task.mark_queue_started();
        state.heap.push(task);
        self.inner.positions.invalidate();
        let queued = state.heap.len();
        drop(state);

        self.inner.run_requests.add_permits(1);
        tracing::debug!(
            task_id = %task.id(),
            priority = ?task.priority(),
            queued,
            "task enqueued"
        );
        Ok(())
    }

    /// Cancel a task wherever it currently lives.
    ///
    /// - In the heap: marks it cancelled and drops the entry.
    /// - In the active set: marks it cancelled and trips the attempt's stop
    ///   flag; the running executor observes cancellation cooperatively.
    /// - In the completed map, or unknown: returns `false`.
    pub fn cancel_task(&self, id: &str) -> bool {
        let mut state = self.inner.lock_state();
        if state.heap.contains(id) {
            let Some(task) = state.heap.remove_by_id(id) else {
                return false;
            };
            self.inner.positions.invalidate();
            let cancelled = task.cancel();
            tracing::info!(task_id = %id, "queued task removed by cancellation");
            return cancelled;
        }
        if let Some(entry) = state.active.get(id) {
            entry.flag.trigger();
            return entry.task.cancel();
        }
        if state.completed.contains_key(id) {
            tracing::warn!(task_id = %id, "cancel rejected: task already completed");
            return false;
        }
        false
    }

    /// Current status of a task known to the scheduler.
    ///
    /// Returns `None` once a task has left all bookkeeping (terminal failed
    /// and cancelled tasks are dropped, not retained).
    pub fn get_status(&self, id: &str) -> Option<TaskStatus> {
        let state = self.inner.lock_state();
        if let Some(entry) = state.active.get(id) {
            return Some(entry.task.status());
        }
        if let Some(task) = state.completed.get(id) {
            return Some(task.status());
        }
        state.heap.get(id).map(Task::status)
    }

    /// `(position, total)` for a queued task, served from the position
    /// cache.  Also writes the advisory hints back onto the task.
    pub fn get_position(&self, id: &str) -> (Option<usize>, usize) {
        let state = self.inner.lock_state();
        let (position, total) = self.inner.positions.get(&state.heap, id);
        if let Some(task) = state.heap.get(id) {
            task.set_queue_hints(position, total);
        }
        (position, total)
    }

    /// The most recent execution record for a task, if any attempt ran.
    pub fn get_result(&self, id: &str) -> Option<TaskResult> {
        self.inner.lock_state().results.get(id).cloned()
    }

    /// Bookkeeping sizes and position-cache validity.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock_state();
        QueueStats {
            queued: state.heap.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            cache_valid: self.inner.positions.cache_valid(),
        }
    }

    /// Shut down: stop dispatching, wait for in-flight tasks, stop the
    /// scanner, and shut down the event bus.  Closing twice is a no-op.
    pub async fn close(&self) {
        if self.inner.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("scheduler shutdown requested");
        self.inner.run_requests.close();
        self.inner.stop.notify_waiters();

        let handles = {
            let mut guard = self.lock_handles();
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.inner.bus.shutdown(true);
        tracing::info!("scheduler stopped");
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // -- Worker side --------------------------------------------------------

    async fn worker_loop(inner: Arc<SchedulerInner>, worker_id: usize) {
        tracing::debug!(worker = worker_id, "scheduler worker started");
        loop {
            let Ok(permit) = inner.run_requests.acquire().await else {
                break; // semaphore closed on shutdown
            };
            permit.forget();
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            if let Some((task, flag)) = Self::dispatch(&inner) {
                Self::execute(&inner, task, flag).await;
            }
        }
        tracing::debug!(worker = worker_id, "scheduler worker stopped");
    }

    /// One atomic dispatch step under the scheduler lock.
    fn dispatch(inner: &SchedulerInner) -> Option<(Task, CancelFlag)> {
        let mut state = inner.lock_state();
        let task = state.heap.pop_highest()?;
        inner.positions.invalidate();

        if task.status() == TaskStatus::Cancelled {
            tracing::debug!(task_id = %task.id(), "dropping cancelled task at dispatch");
            return None;
        }

        // A strictly more urgent task arrived between submission and pop:
        // surrender this dispatch so the next run-request takes it.
        if let Some(next) = state.heap.peek_highest_priority() {
            if next < task.priority() {
                state.heap.push(&task);
                inner.positions.invalidate();
                inner.run_requests.add_permits(1);
                tracing::debug!(
                    task_id = %task.id(),
                    "dispatch surrendered to higher-priority arrival"
                );
                return None;
            }
        }

        let flag = CancelFlag::default();
        state.active.insert(
            task.id().to_string(),
            ActiveEntry {
                task: task.clone(),
                flag: flag.clone(),
            },
        );
        if !task.atomic_set_status(TaskStatus::Running, true) {
            // Cancelled between the status probe and the transition.
            state.active.remove(task.id());
            return None;
        }
        tracing::info!(
            task_id = %task.id(),
            title = %task.title(),
            priority = ?task.priority(),
            "task running"
        );
        Some((task, flag))
    }

    /// Run one attempt outside the lock, then process its outcome.
    async fn execute(inner: &Arc<SchedulerInner>, task: Task, flag: CancelFlag) {
        let mut record = TaskResult::started(&task);
        let _ = record.record_timeline_event("dispatched");
        let ctx = ComputeContext::with_flag(task.clone(), flag);

        let outcome = match task.execution_timeout() {
            Some(limit) => match tokio::time::timeout(limit, Self::run_executor(&task, &ctx)).await
            {
                Ok(result) => result.map_err(KernelError::Executor),
                Err(_) => Err(KernelError::ExecutionTimeout { limit }),
            },
            None => Self::run_executor(&task, &ctx)
                .await
                .map_err(KernelError::Executor),
        };
        let _ = record.record_timeline_event("returned");

        Self::settle(inner, &task, record, outcome);
    }

    async fn run_executor(
        task: &Task,
        ctx: &ComputeContext,
    ) -> anyhow::Result<serde_json::Value> {
        match task.executor() {
            Some(executor) => executor.execute_task(ctx).await,
            None => DefaultExecutor.execute_task(ctx).await,
        }
    }

    /// Result processing and cleanup under the scheduler lock.
    fn settle(
        inner: &SchedulerInner,
        task: &Task,
        mut record: TaskResult,
        outcome: Result<serde_json::Value>,
    ) {
        let mut state = inner.lock_state();
        let id = task.id().to_string();

        if task.status() == TaskStatus::Cancelled {
            // Cancelled during execution: the outcome is dropped silently.
            tracing::debug!(task_id = %id, "outcome dropped for cancelled task");
            record.finish(TaskStatus::Cancelled);
        } else {
            match outcome {
                Ok(value) => {
                    if task.atomic_set_status(TaskStatus::Completed, true) {
                        task.update_progress(1.0);
                        state.completed.insert(id.clone(), task.clone());
                        record.value = Some(value.clone());
                        record.finish(TaskStatus::Completed);
                        let event = TaskEvent::new(task).with("result", value);
                        inner.bus.publish(topics::TASK_COMPLETED, event, true);
                        tracing::info!(task_id = %id, "task completed");
                    } else {
                        record.finish(task.status());
                    }
                }
                Err(error) => {
                    Self::settle_failure(inner, &mut state, task, &mut record, &error);
                }
            }
        }

        if let Some(duration) = record.duration() {
            let millis = duration.num_milliseconds().max(0);
            let _ = record.add_metric("duration_ms", millis as f64);
        }
        state.results.insert(id.clone(), record);
        state.active.remove(&id);
        inner.positions.invalidate();
    }

    fn settle_failure(
        inner: &SchedulerInner,
        state: &mut SchedulerState,
        task: &Task,
        record: &mut TaskResult,
        error: &KernelError,
    ) {
        if !task.atomic_set_status(TaskStatus::Failed, true) {
            // Raced with cancellation; treat like a dropped outcome.
            record.finish(task.status());
            return;
        }
        let kind = match error {
            KernelError::ExecutionTimeout { limit } => {
                task.set_timeout_reason(format!("execution timeout: {}s", limit.as_secs()));
                ErrorKind::Timeout
            }
            _ => ErrorKind::System,
        };
        record.set_error(kind, error.to_string());
        record.finish(TaskStatus::Failed);

        let event = TaskEvent::new(task)
            .with("error", error.to_string())
            .with("retry_count", task.retry_count());
        inner.bus.publish(topics::TASK_FAILED, event, true);
        tracing::warn!(task_id = %task.id(), error = %error, "task failed");

        if task.retry_count() < RETRY_LIMIT {
            let attempt = task.increment_retry_count();
            if task.atomic_set_status(TaskStatus::Queued, true) {
                task.mark_queue_started();
                state.heap.push(task);
                inner.positions.invalidate();
                inner.run_requests.add_permits(1);
                tracing::info!(task_id = %task.id(), retry = attempt, "task re-enqueued for retry");
            }
        } else {
            tracing::warn!(
                task_id = %task.id(),
                retries = RETRY_LIMIT,
                "retry budget exhausted; task remains failed"
            );
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
