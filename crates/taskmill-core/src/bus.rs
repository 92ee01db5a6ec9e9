//! Task lifecycle event bus.
//!
//! The bus provides a thread-safe publish/subscribe mechanism keyed by
//! event-type strings.  All task lifecycle notifications (creation, status
//! changes, progress, completion, failure, cancellation) flow through it.
//!
//! # Dispatch model
//!
//! Asynchronous publishes snapshot the subscriber list under a short lock,
//! then hand one job per subscriber to a small fixed pool of dispatch threads
//! (default 4).  A panicking subscriber is logged and discarded without
//! affecting its siblings or the publisher.  Synchronous publishes run the
//! callbacks inline on the publisher's thread, in registration order.
//! Ordering across asynchronous publishes is not guaranteed.
//!
//! Events are wrapped in [`Arc`] so that dispatching to multiple subscribers
//! does not clone the payload.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use taskmill_core::bus::{EventBus, topics};
//! # use std::sync::Arc;
//! let bus = EventBus::new();
//! bus.subscribe(
//!     topics::TASK_STATUS_CHANGED,
//!     Arc::new(|event| println!("{} changed status", event.task.id())),
//! );
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;

use chrono::{DateTime, Utc};
use crossbeam::channel::{Sender, unbounded};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::Value;

use crate::task::Task;

/// Number of dispatch threads an [`EventBus::new`] bus starts with.
pub const DEFAULT_DISPATCH_WORKERS: usize = 4;

/// Predefined task lifecycle event types.
pub mod topics {
    /// A task was created.
    pub const TASK_CREATED: &str = "task_created";
    /// A task moved to a new status.
    pub const TASK_STATUS_CHANGED: &str = "task_status_changed";
    /// A task reported progress.
    pub const TASK_PROGRESS: &str = "task_progress";
    /// A task finished successfully.
    pub const TASK_COMPLETED: &str = "task_completed";
    /// A task transitioned to failed.
    pub const TASK_FAILED: &str = "task_failed";
    /// A task was cancelled.
    pub const TASK_CANCELLED: &str = "task_cancelled";
}

// ---------------------------------------------------------------------------
// Event payload
// ---------------------------------------------------------------------------

/// Payload delivered to subscribers.
///
/// Every event carries the [`Task`] handle it concerns, a key/value map with
/// the event-specific fields (`old_status`, `new_progress`, ...), and the
/// instant the event was emitted.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    /// The task this event concerns.
    pub task: Task,
    /// Event-specific fields.
    pub fields: serde_json::Map<String, Value>,
    /// When the event was emitted (UTC).
    pub timestamp: DateTime<Utc>,
}

impl TaskEvent {
    /// Create an empty payload for `task`, stamped with the current time.
    #[must_use]
    pub fn new(task: &Task) -> Self {
        Self {
            task: task.clone(),
            fields: serde_json::Map::new(),
            timestamp: Utc::now(),
        }
    }

    /// Attach an event-specific field.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// Read back a field attached via [`TaskEvent::with`].
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// A subscriber callback.
///
/// Callback identity (for idempotent subscription and for unsubscription) is
/// the `Arc` allocation: clone the same `Arc` to refer to the same
/// subscriber.
pub type EventCallback = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

struct DispatchJob {
    event_type: String,
    callback: EventCallback,
    event: Arc<TaskEvent>,
}

// ---------------------------------------------------------------------------
// Event bus
// ---------------------------------------------------------------------------

/// Thread-safe publish/subscribe event bus.
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.  A single
/// process-wide instance is available through [`EventBus::global`]; tests and
/// embedders that need isolation construct their own.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    subscribers: DashMap<String, Vec<EventCallback>>,
    sender: RwLock<Option<Sender<DispatchJob>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

static GLOBAL: Lazy<EventBus> = Lazy::new(EventBus::new);

impl EventBus {
    /// Create a bus with [`DEFAULT_DISPATCH_WORKERS`] dispatch threads.
    ///
    /// # Panics
    ///
    /// See [`EventBus::with_workers`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_workers(DEFAULT_DISPATCH_WORKERS)
    }

    /// Create a bus with `workers` dispatch threads.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to spawn a dispatch thread.
    /// This can only happen at construction, never on publish.
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        let (tx, rx) = unbounded::<DispatchJob>();
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("taskmill-bus-{i}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        invoke(&job.event_type, &job.callback, &job.event);
                    }
                })
                .expect("failed to spawn bus dispatch thread");
            handles.push(handle);
        }
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                sender: RwLock::new(Some(tx)),
                workers: Mutex::new(handles),
            }),
        }
    }

    /// The process-wide bus that tasks publish to by default.
    pub fn global() -> &'static EventBus {
        &GLOBAL
    }

    /// Register `callback` for `event_type`.
    ///
    /// Subscribing the same `Arc` twice for the same event type is a no-op.
    pub fn subscribe(&self, event_type: &str, callback: EventCallback) {
        let mut entry = self
            .inner
            .subscribers
            .entry(event_type.to_string())
            .or_default();
        if entry.iter().any(|cb| Arc::ptr_eq(cb, &callback)) {
            return;
        }
        entry.push(callback);
        tracing::debug!(
            event_type,
            subscribers = entry.len(),
            "event subscriber registered"
        );
    }

    /// Remove `callback` from `event_type`.
    ///
    /// Returns whether a subscriber was actually removed.
    pub fn unsubscribe(&self, event_type: &str, callback: &EventCallback) -> bool {
        let Some(mut entry) = self.inner.subscribers.get_mut(event_type) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|cb| !Arc::ptr_eq(cb, callback));
        let removed = entry.len() < before;
        if removed {
            tracing::debug!(
                event_type,
                subscribers = entry.len(),
                "event subscriber removed"
            );
        }
        removed
    }

    /// Publish `event` to every subscriber of `event_type`.
    ///
    /// Returns the number of subscribers at publish time.  When
    /// `async_mode` is set, callbacks run on the dispatch pool and the
    /// publisher does not block on them; otherwise they run inline in
    /// registration order.
    pub fn publish(&self, event_type: &str, event: TaskEvent, async_mode: bool) -> usize {
        let snapshot: Vec<EventCallback> = match self.inner.subscribers.get(event_type) {
            Some(entry) => entry.clone(),
            None => return 0,
        };
        if snapshot.is_empty() {
            return 0;
        }

        let event = Arc::new(event);
        if async_mode {
            let guard = self
                .inner
                .sender
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let Some(sender) = guard.as_ref() else {
                tracing::debug!(event_type, "event dropped: bus is shut down");
                return 0;
            };
            for callback in &snapshot {
                let job = DispatchJob {
                    event_type: event_type.to_string(),
                    callback: Arc::clone(callback),
                    event: Arc::clone(&event),
                };
                if sender.send(job).is_err() {
                    tracing::debug!(event_type, "event dropped: bus is shut down");
                    return 0;
                }
            }
        } else {
            for callback in &snapshot {
                invoke(event_type, callback, &event);
            }
        }

        tracing::trace!(event_type, receivers = snapshot.len(), "event published");
        snapshot.len()
    }

    /// Clear subscribers for one event type, or for all types when `None`.
    pub fn clear(&self, event_type: Option<&str>) {
        match event_type {
            Some(ty) => {
                if let Some((_, subs)) = self.inner.subscribers.remove(ty) {
                    tracing::debug!(event_type = ty, cleared = subs.len(), "subscribers cleared");
                }
            }
            None => {
                self.inner.subscribers.clear();
                tracing::debug!("all subscribers cleared");
            }
        }
    }

    /// Number of subscribers currently registered for `event_type`.
    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.inner
            .subscribers
            .get(event_type)
            .map_or(0, |entry| entry.len())
    }

    /// Shut the bus down.
    ///
    /// Stops accepting asynchronous publishes.  When `wait_for_inflight` is
    /// set, blocks until the dispatch threads have drained every job already
    /// queued.  Shutting down twice is a no-op.
    pub fn shutdown(&self, wait_for_inflight: bool) {
        let sender = self
            .inner
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }
        drop(sender);
        tracing::info!("event bus shut down");

        if wait_for_inflight {
            let handles = {
                let mut guard = self
                    .inner
                    .workers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *guard)
            };
            for handle in handles {
                let _ = handle.join();
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke(event_type: &str, callback: &EventCallback, event: &TaskEvent) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic>".to_string());
        tracing::error!(event_type, panic = %message, "event subscriber panicked");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
