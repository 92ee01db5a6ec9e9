//! Per-execution result records.
//!
//! Each execution attempt produces one [`TaskResult`]: the final status,
//! start/finish instants, an insertion-ordered timeline of named instants,
//! numeric metrics, the executor's returned value, and a structured error
//! detail when the attempt failed.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::task::{Task, TaskStatus};

/// Broad classification of an execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    System,
    Timeout,
    Network,
    Unknown,
}

/// Structured description of an execution failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Broad failure class.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Free-form context attached by the reporter.
    #[serde(default)]
    pub context: serde_json::Map<String, Value>,
}

/// Outcome record for one execution attempt of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    /// The task this attempt belongs to.
    pub task_id: String,
    /// Unique id of this attempt.
    pub execution_id: String,
    /// Status the task ended the attempt in.
    pub status: TaskStatus,
    /// When this record was created.
    pub created_at: DateTime<Utc>,
    /// When the attempt started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the attempt finished (any outcome).
    pub completed_at: Option<DateTime<Utc>>,
    /// Named instants in insertion order.
    #[serde(default)]
    pub timeline: IndexMap<String, DateTime<Utc>>,
    /// Numeric performance metrics.
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    /// The executor's returned value, when the attempt produced one.
    pub value: Option<Value>,
    /// Failure detail, when the attempt failed.
    pub error: Option<ErrorDetail>,
}

impl TaskResult {
    /// Open a record for an attempt that is starting now.
    #[must_use]
    pub fn started(task: &Task) -> Self {
        let now = Utc::now();
        Self {
            task_id: task.id().to_string(),
            execution_id: Uuid::now_v7().to_string(),
            status: task.status(),
            created_at: now,
            started_at: Some(now),
            completed_at: None,
            timeline: IndexMap::new(),
            metrics: HashMap::new(),
            value: None,
            error: None,
        }
    }

    /// Record a named instant.  Each name may appear once.
    pub fn record_timeline_event(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.timeline.contains_key(&name) {
            return Err(CoreError::InvalidInput {
                field: "timeline",
                reason: format!("event `{name}` already recorded"),
            });
        }
        self.timeline.insert(name, Utc::now());
        Ok(())
    }

    /// Record a non-negative numeric metric.
    pub fn add_metric(&mut self, name: impl Into<String>, value: f64) -> Result<()> {
        if !value.is_finite() || value < 0.0 {
            return Err(CoreError::InvalidInput {
                field: "metrics",
                reason: format!("{value} is not a non-negative number"),
            });
        }
        self.metrics.insert(name.into(), value);
        Ok(())
    }

    /// Attach failure detail.
    pub fn set_error(&mut self, kind: ErrorKind, message: impl Into<String>) {
        self.error = Some(ErrorDetail {
            kind,
            message: message.into(),
            context: serde_json::Map::new(),
        });
    }

    /// Close the record with the status the task ended in.
    pub fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Wall-clock duration of the attempt, when both instants are known.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}
