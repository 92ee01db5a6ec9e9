//! Queue-wait timeout scanner.
//!
//! A single background loop that wakes once per second, takes the scheduler
//! lock, and force-fails every queued task whose `queue_timeout` has
//! elapsed since it entered the queue.  Expired tasks transition
//! `Queued -> Failed` with a populated `timeout_reason` and leave the heap
//! without ever running.
//!
//! Execution timeouts are not handled here: they are enforced per attempt
//! by the worker that holds the deadline timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;

use taskmill_core::{Task, TaskEvent, TaskStatus, topics};

use crate::scheduler::SchedulerInner;

/// How often the scanner sweeps the heap.
pub const SCAN_PERIOD: Duration = Duration::from_secs(1);

pub(crate) async fn run(inner: Arc<SchedulerInner>) {
    let mut ticker = tokio::time::interval(SCAN_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let stopped = inner.stop.notified();
    tokio::pin!(stopped);

    tracing::debug!("queue-timeout scanner started");
    loop {
        tokio::select! {
            () = &mut stopped => break,
            _ = ticker.tick() => {
                if inner.shutdown.load(std::sync::atomic::Ordering::Acquire) {
                    break;
                }
                sweep(&inner);
            }
        }
    }
    tracing::debug!("queue-timeout scanner stopped");
}

fn sweep(inner: &SchedulerInner) {
    let now = Utc::now();
    let mut state = inner.lock_state();

    let expired: Vec<String> = state
        .heap
        .iter()
        .filter(|task| is_expired(task, now))
        .map(|task| task.id().to_string())
        .collect();

    for id in expired {
        let Some(task) = state.heap.remove_by_id(&id) else {
            continue;
        };
        inner.positions.invalidate();

        let limit = task.queue_timeout().map_or(0, |d| d.as_secs());
        let reason = format!("queue-wait timeout: {limit}s");
        task.set_timeout_reason(reason.clone());
        if task.atomic_set_status(TaskStatus::Failed, true) {
            let event = TaskEvent::new(&task).with("timeout_reason", reason.as_str());
            inner.bus.publish(topics::TASK_FAILED, event, true);
            tracing::warn!(task_id = %id, limit, "task failed queue-wait timeout");
        }
    }
}

fn is_expired(task: &Task, now: DateTime<Utc>) -> bool {
    let Some(limit) = task.queue_timeout() else {
        return false;
    };
    let Some(started) = task.queue_started_at() else {
        return false;
    };
    match (now - started).to_std() {
        Ok(waited) => waited > limit,
        Err(_) => false,
    }
}
