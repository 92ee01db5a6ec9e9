//! Task model and state machine.
//!
//! A [`Task`] is a unit of deferred work: identity, lifecycle status,
//! priority, progress, timeout configuration, and an optional pluggable
//! executor.  Handles are cheaply cloneable (`Arc`-backed) and safe to share
//! across threads; all mutable fields live behind a single interior lock.
//!
//! # Lifecycle
//!
//! ```text
//! Pending --> Queued --> Running --> Completed
//!    \           \ \->  Failed  --> Queued (retry)
//!     \           \->   Cancelled
//!      \->  Cancelled
//! ```
//!
//! Every status change goes through [`Task::atomic_set_status`] (or its
//! fallible twin [`Task::try_transition`]), which validates the transition
//! against the matrix above, stamps `updated_at`, and publishes a
//! [`topics::TASK_STATUS_CHANGED`] event as one step.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{EventBus, TaskEvent, topics};
use crate::error::{CoreError, Result};
use crate::executor::TaskExecutor;

/// Maximum length of a task title, in characters.
pub const MAX_TITLE_LEN: usize = 100;
/// Maximum length of a task description, in characters.
pub const MAX_DESCRIPTION_LEN: usize = 500;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// Discriminants are the wire integers accepted by deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created but not yet enqueued.
    Pending = 1,
    /// Sitting in the priority queue, waiting for a worker.
    Queued = 2,
    /// Currently executing.
    Running = 3,
    /// Finished successfully.
    Completed = 4,
    /// Finished with an error; may be re-enqueued by retry.
    Failed = 5,
    /// Cancelled before or during execution.
    Cancelled = 6,
}

impl TaskStatus {
    /// Lowercase name used on the wire and in event payloads.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a status name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Parse a wire integer (1..=6).
    #[must_use]
    pub const fn from_wire(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Queued),
            3 => Some(Self::Running),
            4 => Some(Self::Completed),
            5 => Some(Self::Failed),
            6 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Whether this status admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// The statuses this status may transition to.
    #[must_use]
    pub const fn allowed_next(self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[Self::Queued, Self::Cancelled],
            Self::Queued => &[Self::Running, Self::Cancelled, Self::Failed],
            Self::Running => &[Self::Completed, Self::Failed, Self::Cancelled],
            Self::Failed => &[Self::Queued],
            Self::Completed | Self::Cancelled => &[],
        }
    }

    /// Whether `self -> next` is in the transition matrix.
    #[must_use]
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level; a smaller value dequeues first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    /// Must execute before anything else.
    Critical = 0,
    /// Important but not safety-critical.
    High = 1,
    /// Default priority for most work.
    Normal = 2,
    /// Background / best-effort.
    Low = 3,
}

impl TaskPriority {
    /// Parse a wire integer (0..=3).
    #[must_use]
    pub const fn from_wire(value: i64) -> Option<Self> {
        match value {
            0 => Some(Self::Critical),
            1 => Some(Self::High),
            2 => Some(Self::Normal),
            3 => Some(Self::Low),
            _ => None,
        }
    }

    /// Parse a priority name, case-insensitively.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "critical" => Some(Self::Critical),
            "high" => Some(Self::High),
            "normal" => Some(Self::Normal),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A unit of deferred work.
///
/// Cloning a `Task` clones the handle, not the task: all clones observe the
/// same state.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

struct TaskInner {
    id: String,
    title: String,
    description: String,
    priority: TaskPriority,
    created_at: DateTime<Utc>,
    queue_timeout: Option<Duration>,
    execution_timeout: Option<Duration>,
    bus: EventBus,
    state: Mutex<TaskState>,
}

struct TaskState {
    status: TaskStatus,
    progress: f64,
    updated_at: DateTime<Utc>,
    queue_started_at: Option<DateTime<Utc>>,
    queue_position: Option<usize>,
    queue_total: Option<usize>,
    timeout_reason: Option<String>,
    retry_count: u32,
    executor: Option<Arc<dyn TaskExecutor>>,
}

/// A point-in-time copy of a task's fields.
///
/// Observers take a snapshot under the task's lock and then release it, per
/// the shared-resource policy: no observer reads live fields without the
/// lock.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSnapshot {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub progress: f64,
    pub queue_position: Option<usize>,
    pub queue_total: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queue_started_at: Option<DateTime<Utc>>,
    pub timeout_reason: Option<String>,
    pub retry_count: u32,
}

impl Task {
    /// Start building a task with the given title.
    pub fn builder(title: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(title)
    }

    /// Reconstruct a task from deserialized parts.  Does not publish
    /// `task_created`.
    pub(crate) fn restore(parts: RestoredTask) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: parts.id,
                title: parts.title,
                description: parts.description,
                priority: parts.priority,
                created_at: parts.created_at,
                queue_timeout: None,
                execution_timeout: None,
                bus: parts.bus,
                state: Mutex::new(TaskState {
                    status: parts.status,
                    progress: parts.progress,
                    updated_at: parts.updated_at,
                    queue_started_at: None,
                    queue_position: parts.queue_position,
                    queue_total: parts.queue_total,
                    timeout_reason: None,
                    retry_count: 0,
                    executor: None,
                }),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, TaskState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // -- Immutable configuration --------------------------------------------

    /// Opaque, globally unique identifier.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Short human-readable title.
    pub fn title(&self) -> &str {
        &self.inner.title
    }

    /// Longer human-readable description.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Scheduling priority.
    pub fn priority(&self) -> TaskPriority {
        self.inner.priority
    }

    /// When the task was created (UTC).
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// How long the task may wait in the queue before being force-failed.
    pub fn queue_timeout(&self) -> Option<Duration> {
        self.inner.queue_timeout
    }

    /// Deadline for a single running attempt.
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.inner.execution_timeout
    }

    /// The bus this task publishes lifecycle events to.
    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }

    // -- Observers ----------------------------------------------------------

    /// Current lifecycle status.
    pub fn status(&self) -> TaskStatus {
        self.state().status
    }

    /// Current progress in `[0.0, 1.0]`.
    pub fn progress(&self) -> f64 {
        self.state().progress
    }

    /// Instant of the most recent mutation (UTC).
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.state().updated_at
    }

    /// Instant the task entered `Queued`, if it has.
    pub fn queue_started_at(&self) -> Option<DateTime<Utc>> {
        self.state().queue_started_at
    }

    /// Why a timeout failed this task, if one did.
    pub fn timeout_reason(&self) -> Option<String> {
        self.state().timeout_reason.clone()
    }

    /// Number of automatic retries performed so far.
    pub fn retry_count(&self) -> u32 {
        self.state().retry_count
    }

    /// The executor attached to this task, if any.
    pub fn executor(&self) -> Option<Arc<dyn TaskExecutor>> {
        self.state().executor.clone()
    }

    /// Copy all fields under the lock.
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state();
        TaskSnapshot {
            id: self.inner.id.clone(),
            title: self.inner.title.clone(),
            description: self.inner.description.clone(),
            status: state.status,
            priority: self.inner.priority,
            progress: state.progress,
            queue_position: state.queue_position,
            queue_total: state.queue_total,
            created_at: self.inner.created_at,
            updated_at: state.updated_at,
            queue_started_at: state.queue_started_at,
            timeout_reason: state.timeout_reason.clone(),
            retry_count: state.retry_count,
        }
    }

    // -- State machine ------------------------------------------------------

    /// Set the status, stamping `updated_at` and publishing
    /// [`topics::TASK_STATUS_CHANGED`], as one observable step.
    ///
    /// With `validate` set, the transition must be in the matrix; an invalid
    /// request is logged and reported as `false`, leaving the task
    /// unchanged.  This and [`Task::try_transition`] are the only ways
    /// status changes.
    pub fn atomic_set_status(&self, new_status: TaskStatus, validate: bool) -> bool {
        match self.apply_transition(new_status, validate, &[]) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(task_id = %self.inner.id, error = %e, "status change rejected");
                false
            }
        }
    }

    /// Fallible variant of [`Task::atomic_set_status`] with validation
    /// always on.
    pub fn try_transition(&self, new_status: TaskStatus) -> Result<()> {
        self.apply_transition(new_status, true, &[])
    }

    fn apply_transition(
        &self,
        new_status: TaskStatus,
        validate: bool,
        extra_fields: &[(&str, serde_json::Value)],
    ) -> Result<()> {
        let event = {
            let mut state = self.state();
            let old_status = state.status;
            if validate && !old_status.can_transition_to(new_status) {
                return Err(CoreError::InvalidTransition {
                    task_id: self.inner.id.clone(),
                    from: old_status,
                    to: new_status,
                });
            }
            if old_status == new_status {
                return Ok(());
            }
            state.status = new_status;
            state.updated_at = Utc::now();

            let mut event = TaskEvent::new(self)
                .with("old_status", old_status.as_str())
                .with("new_status", new_status.as_str());
            for (key, value) in extra_fields {
                event = event.with(key, value.clone());
            }
            event
        };

        tracing::debug!(
            task_id = %self.inner.id,
            old_status = %event.fields["old_status"].as_str().unwrap_or_default(),
            new_status = %new_status,
            "task status changed"
        );
        self.inner
            .bus
            .publish(topics::TASK_STATUS_CHANGED, event, true);
        Ok(())
    }

    /// Update progress, clamped to `[0.0, 1.0]`.
    ///
    /// Stamps `updated_at` and publishes [`topics::TASK_PROGRESS`] with the
    /// old and new values when the clamped value actually changed.
    pub fn update_progress(&self, progress: f64) {
        if !progress.is_finite() {
            tracing::warn!(task_id = %self.inner.id, progress, "non-finite progress ignored");
            return;
        }
        let event = {
            let mut state = self.state();
            let old = state.progress;
            let new = progress.clamp(0.0, 1.0);
            state.progress = new;
            state.updated_at = Utc::now();
            if (new - old).abs() < f64::EPSILON {
                None
            } else {
                Some(
                    TaskEvent::new(self)
                        .with("old_progress", old)
                        .with("new_progress", new),
                )
            }
        };
        if let Some(event) = event {
            self.inner.bus.publish(topics::TASK_PROGRESS, event, true);
        }
    }

    // -- User operations ----------------------------------------------------

    /// Cancel the task.
    ///
    /// Rejected (returns `false`) on a completed task, and on any other
    /// state whose matrix row does not admit `Cancelled`.  On success,
    /// publishes [`topics::TASK_CANCELLED`] in addition to the status-change
    /// event.
    pub fn cancel(&self) -> bool {
        let old_status = self.status();
        if old_status == TaskStatus::Completed {
            tracing::warn!(task_id = %self.inner.id, "cancel rejected: task already completed");
            return false;
        }
        match self.try_transition(TaskStatus::Cancelled) {
            Ok(()) => {
                let event = TaskEvent::new(self).with("old_status", old_status.as_str());
                self.inner.bus.publish(topics::TASK_CANCELLED, event, true);
                tracing::info!(task_id = %self.inner.id, "task cancelled");
                true
            }
            Err(e) => {
                tracing::warn!(task_id = %self.inner.id, error = %e, "cancel rejected");
                false
            }
        }
    }

    /// Re-queue a failed task at the user's request.
    ///
    /// Rejected (returns `false`) unless the task is currently `Failed`.
    /// Publishes the status-change event with an `is_retry` flag.  Unlike
    /// the scheduler's automatic retries, this does not touch
    /// `retry_count`.
    pub fn retry_failed(&self) -> bool {
        if self.status() != TaskStatus::Failed {
            tracing::warn!(
                task_id = %self.inner.id,
                status = %self.status(),
                "retry rejected: task is not failed"
            );
            return false;
        }
        match self.apply_transition(
            TaskStatus::Queued,
            true,
            &[("is_retry", serde_json::Value::Bool(true))],
        ) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(task_id = %self.inner.id, error = %e, "retry rejected");
                false
            }
        }
    }

    /// Attach an executor, replacing any existing one.
    pub fn set_executor(&self, executor: Arc<dyn TaskExecutor>) {
        self.state().executor = Some(executor);
    }

    // -- Scheduler hooks ----------------------------------------------------
    // Invoked by the scheduler under its own lock; not for general use.

    /// Record the instant the task entered the queue.
    pub fn mark_queue_started(&self) {
        let mut state = self.state();
        state.queue_started_at = Some(Utc::now());
        state.updated_at = Utc::now();
    }

    /// Record why a timeout failed this task.
    pub fn set_timeout_reason(&self, reason: impl Into<String>) {
        let mut state = self.state();
        state.timeout_reason = Some(reason.into());
        state.updated_at = Utc::now();
    }

    /// Bump the automatic-retry counter, returning the new value.
    pub fn increment_retry_count(&self) -> u32 {
        let mut state = self.state();
        state.retry_count += 1;
        state.retry_count
    }

    /// Store the advisory queue-position hints.
    pub fn set_queue_hints(&self, position: Option<usize>, total: usize) {
        let mut state = self.state();
        state.queue_position = position;
        state.queue_total = Some(total);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("title", &self.inner.title)
            .field("status", &self.status())
            .field("priority", &self.inner.priority)
            .finish_non_exhaustive()
    }
}

pub(crate) struct RestoredTask {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub progress: f64,
    pub queue_position: Option<usize>,
    pub queue_total: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub bus: EventBus,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`Task`].
///
/// Validates field constraints on [`TaskBuilder::build`] and publishes
/// [`topics::TASK_CREATED`] for the new task.
pub struct TaskBuilder {
    title: String,
    description: String,
    priority: TaskPriority,
    queue_timeout: Option<u64>,
    execution_timeout: Option<u64>,
    executor: Option<Arc<dyn TaskExecutor>>,
    bus: Option<EventBus>,
}

impl TaskBuilder {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            priority: TaskPriority::default(),
            queue_timeout: None,
            execution_timeout: None,
            executor: None,
            bus: None,
        }
    }

    /// Human-readable description (up to [`MAX_DESCRIPTION_LEN`] chars).
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Scheduling priority; defaults to [`TaskPriority::Normal`].
    #[must_use]
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Queue-wait timeout in whole seconds (must be positive).
    #[must_use]
    pub fn queue_timeout(mut self, seconds: u64) -> Self {
        self.queue_timeout = Some(seconds);
        self
    }

    /// Per-attempt execution timeout in whole seconds (must be positive).
    #[must_use]
    pub fn execution_timeout(mut self, seconds: u64) -> Self {
        self.execution_timeout = Some(seconds);
        self
    }

    /// Executor to run this task with; defaults to the built-in simulated
    /// executor when absent.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Publish lifecycle events to `bus` instead of the process-wide bus.
    #[must_use]
    pub fn bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Validate and construct the task.
    pub fn build(self) -> Result<Task> {
        if self.title.chars().count() > MAX_TITLE_LEN {
            return Err(CoreError::InvalidInput {
                field: "title",
                reason: format!("longer than {MAX_TITLE_LEN} characters"),
            });
        }
        if self.description.chars().count() > MAX_DESCRIPTION_LEN {
            return Err(CoreError::InvalidInput {
                field: "description",
                reason: format!("longer than {MAX_DESCRIPTION_LEN} characters"),
            });
        }
        let queue_timeout = self
            .queue_timeout
            .map(|secs| positive_seconds("queue_timeout", secs))
            .transpose()?;
        let execution_timeout = self
            .execution_timeout
            .map(|secs| positive_seconds("execution_timeout", secs))
            .transpose()?;

        let bus = self.bus.unwrap_or_else(|| EventBus::global().clone());
        let now = Utc::now();
        let task = Task {
            inner: Arc::new(TaskInner {
                id: format!("task_{}", Uuid::now_v7().simple()),
                title: self.title,
                description: self.description,
                priority: self.priority,
                created_at: now,
                queue_timeout,
                execution_timeout,
                bus: bus.clone(),
                state: Mutex::new(TaskState {
                    status: TaskStatus::Pending,
                    progress: 0.0,
                    updated_at: now,
                    queue_started_at: None,
                    queue_position: None,
                    queue_total: None,
                    timeout_reason: None,
                    retry_count: 0,
                    executor: self.executor,
                }),
            }),
        };

        tracing::debug!(task_id = %task.id(), title = %task.title(), "task created");
        bus.publish(topics::TASK_CREATED, TaskEvent::new(&task), true);
        Ok(task)
    }
}

fn positive_seconds(field: &'static str, seconds: u64) -> Result<Duration> {
    if seconds == 0 {
        return Err(CoreError::InvalidInput {
            field,
            reason: "must be a positive number of seconds".to_string(),
        });
    }
    Ok(Duration::from_secs(seconds))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventCallback;
    use std::sync::Mutex as StdMutex;

    fn quiet_task() -> Task {
        Task::builder("unit")
            .bus(EventBus::with_workers(1))
            .build()
            .expect("task should build")
    }

    #[test]
    fn new_task_is_pending() {
        let task = quiet_task();
        assert_eq!(task.status(), TaskStatus::Pending);
        assert_eq!(task.priority(), TaskPriority::Normal);
        assert_eq!(task.progress(), 0.0);
        assert_eq!(task.retry_count(), 0);
        assert!(task.id().starts_with("task_"));
        assert!(task.updated_at() >= task.created_at());
    }

    #[test]
    fn builder_rejects_oversized_fields() {
        let result = Task::builder("t".repeat(MAX_TITLE_LEN + 1))
            .bus(EventBus::with_workers(1))
            .build();
        assert!(matches!(
            result,
            Err(CoreError::InvalidInput { field: "title", .. })
        ));

        let result = Task::builder("ok")
            .description("d".repeat(MAX_DESCRIPTION_LEN + 1))
            .bus(EventBus::with_workers(1))
            .build();
        assert!(matches!(
            result,
            Err(CoreError::InvalidInput {
                field: "description",
                ..
            })
        ));
    }

    #[test]
    fn builder_rejects_zero_timeouts() {
        let result = Task::builder("t")
            .queue_timeout(0)
            .bus(EventBus::with_workers(1))
            .build();
        assert!(matches!(
            result,
            Err(CoreError::InvalidInput {
                field: "queue_timeout",
                ..
            })
        ));
    }

    #[test]
    fn transition_matrix_is_enforced() {
        let task = quiet_task();

        // Pending -> Running is not in the matrix.
        assert!(!task.atomic_set_status(TaskStatus::Running, true));
        assert_eq!(task.status(), TaskStatus::Pending);

        assert!(task.atomic_set_status(TaskStatus::Queued, true));
        assert!(task.atomic_set_status(TaskStatus::Running, true));
        assert!(task.atomic_set_status(TaskStatus::Completed, true));

        // Completed is terminal.
        assert!(!task.atomic_set_status(TaskStatus::Queued, true));
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn unvalidated_set_skips_the_matrix() {
        let task = quiet_task();
        assert!(task.atomic_set_status(TaskStatus::Failed, false));
        assert_eq!(task.status(), TaskStatus::Failed);
    }

    #[test]
    fn try_transition_reports_typed_error() {
        let task = quiet_task();
        let err = task.try_transition(TaskStatus::Completed).unwrap_err();
        match err {
            CoreError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, TaskStatus::Pending);
                assert_eq!(to, TaskStatus::Completed);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn progress_is_clamped() {
        let task = quiet_task();

        task.update_progress(-0.5);
        assert_eq!(task.progress(), 0.0);

        task.update_progress(1.7);
        assert_eq!(task.progress(), 1.0);

        task.update_progress(0.42);
        assert_eq!(task.progress(), 0.42);
    }

    #[test]
    fn progress_event_carries_old_and_new() {
        let bus = EventBus::with_workers(1);
        let seen: Arc<StdMutex<Vec<(f64, f64)>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb: EventCallback = Arc::new(move |event| {
            let old = event.field("old_progress").and_then(|v| v.as_f64());
            let new = event.field("new_progress").and_then(|v| v.as_f64());
            if let (Some(old), Some(new)) = (old, new) {
                sink.lock().unwrap().push((old, new));
            }
        });
        bus.subscribe(topics::TASK_PROGRESS, cb);

        let task = Task::builder("progress")
            .bus(bus.clone())
            .build()
            .expect("build");
        task.update_progress(0.5);
        task.update_progress(0.5); // unchanged: no event
        task.update_progress(1.0);
        bus.shutdown(true);

        assert_eq!(*seen.lock().unwrap(), vec![(0.0, 0.5), (0.5, 1.0)]);
    }

    #[test]
    fn cancel_rejected_on_completed() {
        let task = quiet_task();
        task.atomic_set_status(TaskStatus::Completed, false);
        assert!(!task.cancel());
        assert_eq!(task.status(), TaskStatus::Completed);
    }

    #[test]
    fn cancel_is_idempotent_once_terminal() {
        let task = quiet_task();
        assert!(task.cancel());
        assert_eq!(task.status(), TaskStatus::Cancelled);

        // Terminal: a second cancel is a non-throwing false.
        assert!(!task.cancel());
    }

    #[test]
    fn retry_requires_failed() {
        let task = quiet_task();
        assert!(!task.retry_failed());

        task.atomic_set_status(TaskStatus::Failed, false);
        assert!(task.retry_failed());
        assert_eq!(task.status(), TaskStatus::Queued);
        // User retry does not consume the automatic-retry budget.
        assert_eq!(task.retry_count(), 0);
    }

    #[test]
    fn status_events_follow_transitions() {
        let bus = EventBus::with_workers(1);
        let seen: Arc<StdMutex<Vec<(String, String)>>> = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(
            topics::TASK_STATUS_CHANGED,
            Arc::new(move |event| {
                let old = event
                    .field("old_status")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let new = event
                    .field("new_status")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                sink.lock().unwrap().push((old, new));
            }),
        );

        let task = Task::builder("events").bus(bus.clone()).build().expect("build");
        task.atomic_set_status(TaskStatus::Queued, true);
        task.atomic_set_status(TaskStatus::Running, true);
        task.atomic_set_status(TaskStatus::Completed, true);
        // Rejected transition must not emit anything.
        task.atomic_set_status(TaskStatus::Queued, true);
        bus.shutdown(true);

        let events = seen.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                ("pending".to_string(), "queued".to_string()),
                ("queued".to_string(), "running".to_string()),
                ("running".to_string(), "completed".to_string()),
            ]
        );
    }

    #[test]
    fn retry_event_is_flagged() {
        let bus = EventBus::with_workers(1);
        let flagged = Arc::new(StdMutex::new(false));
        let sink = Arc::clone(&flagged);
        bus.subscribe(
            topics::TASK_STATUS_CHANGED,
            Arc::new(move |event| {
                if event.field("is_retry").and_then(|v| v.as_bool()) == Some(true) {
                    *sink.lock().unwrap() = true;
                }
            }),
        );

        let task = Task::builder("retry").bus(bus.clone()).build().expect("build");
        task.atomic_set_status(TaskStatus::Failed, false);
        assert!(task.retry_failed());
        bus.shutdown(true);

        assert!(*flagged.lock().unwrap());
    }

    #[test]
    fn snapshot_copies_fields() {
        let task = quiet_task();
        task.atomic_set_status(TaskStatus::Queued, true);
        task.mark_queue_started();
        task.update_progress(0.3);
        task.set_queue_hints(Some(2), 5);

        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Queued);
        assert_eq!(snap.progress, 0.3);
        assert_eq!(snap.queue_position, Some(2));
        assert_eq!(snap.queue_total, Some(5));
        assert!(snap.queue_started_at.is_some());
    }

    #[test]
    fn updated_at_is_monotone() {
        let task = quiet_task();
        let t0 = task.updated_at();
        task.update_progress(0.1);
        let t1 = task.updated_at();
        task.atomic_set_status(TaskStatus::Queued, true);
        let t2 = task.updated_at();
        assert!(t0 <= t1 && t1 <= t2);
        assert!(task.created_at() <= t0);
    }

    #[test]
    fn status_parsing() {
        assert_eq!(TaskStatus::from_name("RUNNING"), Some(TaskStatus::Running));
        assert_eq!(TaskStatus::from_name("queued"), Some(TaskStatus::Queued));
        assert_eq!(TaskStatus::from_name("nope"), None);
        assert_eq!(TaskStatus::from_wire(4), Some(TaskStatus::Completed));
        assert_eq!(TaskStatus::from_wire(0), None);
        assert_eq!(TaskStatus::from_wire(7), None);
    }

    #[test]
    fn priority_parsing() {
        assert_eq!(TaskPriority::from_wire(0), Some(TaskPriority::Critical));
        assert_eq!(TaskPriority::from_wire(3), Some(TaskPriority::Low));
        assert_eq!(TaskPriority::from_wire(4), None);
        assert_eq!(TaskPriority::from_name("HIGH"), Some(TaskPriority::High));
        assert_eq!(TaskPriority::from_name("urgent"), None);
    }
}
