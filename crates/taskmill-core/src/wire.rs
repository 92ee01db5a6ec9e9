//! Wire-format serialization for [`Task`].
//!
//! A task serializes to a flat record: `progress` is emitted in percent form
//! with two decimals, `status` as its lowercase name, `priority` as its
//! integer value, and timestamps as RFC 3339 with an explicit offset.
//!
//! Deserialization is lenient about representations (`status` by name or
//! wire integer, `priority` by integer, digit string, or name) but strict
//! about values: out-of-range fields and timestamps without a timezone are
//! rejected.  Percent-to-fraction conversion of `progress` is the caller's
//! responsibility; the record carries a fraction in `[0.0, 1.0]`.

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::bus::EventBus;
use crate::error::{CoreError, Result};
use crate::task::{
    MAX_DESCRIPTION_LEN, MAX_TITLE_LEN, RestoredTask, Task, TaskPriority, TaskStatus,
};

impl Serialize for Task {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let snap = self.snapshot();
        let percent = (snap.progress * 10_000.0).round() / 100.0;

        let mut record = serializer.serialize_struct("Task", 10)?;
        record.serialize_field("id", &snap.id)?;
        record.serialize_field("title", &snap.title)?;
        record.serialize_field("description", &snap.description)?;
        record.serialize_field("progress", &percent)?;
        record.serialize_field("queue_position", &snap.queue_position)?;
        record.serialize_field("queue_total", &snap.queue_total)?;
        record.serialize_field("status", snap.status.as_str())?;
        record.serialize_field("priority", &(snap.priority as u8))?;
        record.serialize_field("created_at", &snap.created_at.to_rfc3339())?;
        record.serialize_field("updated_at", &snap.updated_at.to_rfc3339())?;
        record.end()
    }
}

impl<'de> Deserialize<'de> for Task {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let record = TaskRecord::deserialize(deserializer)?;
        record
            .into_task(EventBus::global().clone())
            .map_err(D::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Lenient record
// ---------------------------------------------------------------------------

/// The raw wire record, before value validation.
///
/// [`TaskRecord::into_task`] normalizes the lenient fields and attaches the
/// bus the restored task will publish to; the derived [`Deserialize`] on
/// [`Task`] uses the process-wide bus.
#[derive(Debug, Deserialize)]
pub struct TaskRecord {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    queue_position: Option<usize>,
    #[serde(default)]
    queue_total: Option<usize>,
    #[serde(default)]
    status: Option<StatusField>,
    #[serde(default)]
    priority: Option<PriorityField>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    updated_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StatusField {
    Code(i64),
    Name(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriorityField {
    Code(i64),
    Text(String),
}

impl TaskRecord {
    /// Validate the record and restore a [`Task`] publishing to `bus`.
    pub fn into_task(self, bus: EventBus) -> Result<Task> {
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
        if !(0.0..=1.0).contains(&self.progress) {
            return Err(CoreError::InvalidInput {
                field: "progress",
                reason: format!("{} is outside [0.0, 1.0]", self.progress),
            });
        }

        let status = match self.status {
            None => TaskStatus::Pending,
            Some(field) => parse_status(&field)?,
        };
        let priority = match self.priority {
            None => TaskPriority::default(),
            Some(field) => parse_priority(&field)?,
        };

        let now = Utc::now();
        let created_at = match self.created_at {
            Some(raw) => parse_timestamp("created_at", &raw)?,
            None => now,
        };
        let updated_at = match self.updated_at {
            Some(raw) => parse_timestamp("updated_at", &raw)?,
            None => now,
        };
        if updated_at < created_at {
            return Err(CoreError::InvalidInput {
                field: "updated_at",
                reason: "earlier than created_at".to_string(),
            });
        }

        Ok(Task::restore(RestoredTask {
            id: self.id,
            title: self.title,
            description: self.description,
            status,
            priority,
            progress: self.progress,
            queue_position: self.queue_position,
            queue_total: self.queue_total,
            created_at,
            updated_at,
            bus,
        }))
    }
}

fn parse_status(field: &StatusField) -> Result<TaskStatus> {
    match field {
        StatusField::Code(code) => {
            TaskStatus::from_wire(*code).ok_or_else(|| CoreError::InvalidInput {
                field: "status",
                reason: format!("unknown status value {code}"),
            })
        }
        StatusField::Name(name) => {
            TaskStatus::from_name(name).ok_or_else(|| CoreError::InvalidInput {
                field: "status",
                reason: format!("unknown status name `{name}`"),
            })
        }
    }
}

fn parse_priority(field: &PriorityField) -> Result<TaskPriority> {
    let invalid = |repr: &str| CoreError::InvalidInput {
        field: "priority",
        reason: format!("unknown priority `{repr}`"),
    };
    match field {
        PriorityField::Code(code) => TaskPriority::from_wire(*code)
            .ok_or_else(|| invalid(&code.to_string())),
        PriorityField::Text(text) => {
            if text.chars().all(|c| c.is_ascii_digit()) && !text.is_empty() {
                let code: i64 = text.parse().map_err(|_| invalid(text))?;
                TaskPriority::from_wire(code).ok_or_else(|| invalid(text))
            } else {
                TaskPriority::from_name(text).ok_or_else(|| invalid(text))
            }
        }
    }
}

fn parse_timestamp(field: &'static str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoreError::InvalidInput {
            field,
            reason: format!("`{raw}` is not an RFC 3339 timestamp with timezone: {e}"),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus() -> EventBus {
        EventBus::with_workers(1)
    }

    fn record(value: serde_json::Value) -> Result<Task> {
        let record: TaskRecord = serde_json::from_value(value).expect("record shape");
        record.into_task(bus())
    }

    #[test]
    fn serializes_to_the_wire_record() {
        let task = Task::builder("wire")
            .description("roundtrip")
            .priority(TaskPriority::High)
            .bus(bus())
            .build()
            .expect("build");
        task.update_progress(0.4242);

        let value = serde_json::to_value(&task).expect("serialize");
        assert_eq!(value["id"], task.id());
        assert_eq!(value["title"], "wire");
        assert_eq!(value["description"], "roundtrip");
        assert_eq!(value["progress"], 42.42);
        assert_eq!(value["status"], "pending");
        assert_eq!(value["priority"], 1);
        assert_eq!(value["queue_position"], serde_json::Value::Null);
        // Timestamps carry an explicit offset.
        let created = value["created_at"].as_str().expect("created_at");
        assert!(DateTime::parse_from_rfc3339(created).is_ok());
    }

    #[test]
    fn round_trip_preserves_fields() {
        let task = Task::builder("round")
            .description("trip")
            .priority(TaskPriority::Critical)
            .bus(bus())
            .build()
            .expect("build");
        task.atomic_set_status(TaskStatus::Queued, true);
        task.update_progress(0.25);

        let mut value = serde_json::to_value(&task).expect("serialize");
        // Percent-to-fraction conversion is the caller's responsibility.
        let percent = value["progress"].as_f64().expect("progress");
        value["progress"] = json!(percent / 100.0);

        let restored = record(value).expect("deserialize");
        assert_eq!(restored.id(), task.id());
        assert_eq!(restored.title(), task.title());
        assert_eq!(restored.description(), task.description());
        assert_eq!(restored.status(), TaskStatus::Queued);
        assert_eq!(restored.priority(), TaskPriority::Critical);
        assert_eq!(restored.progress(), 0.25);
        assert_eq!(restored.created_at(), task.created_at());
    }

    #[test]
    fn status_accepts_name_and_wire_integer() {
        let by_name = record(json!({"id": "task_a", "title": "t", "status": "RUNNING"}))
            .expect("name form");
        assert_eq!(by_name.status(), TaskStatus::Running);

        let by_code =
            record(json!({"id": "task_b", "title": "t", "status": 6})).expect("integer form");
        assert_eq!(by_code.status(), TaskStatus::Cancelled);

        let unknown = record(json!({"id": "task_c", "title": "t", "status": "paused"}));
        assert!(matches!(
            unknown,
            Err(CoreError::InvalidInput { field: "status", .. })
        ));

        let out_of_range = record(json!({"id": "task_d", "title": "t", "status": 9}));
        assert!(out_of_range.is_err());
    }

    #[test]
    fn priority_accepts_integer_string_and_name() {
        let by_int = record(json!({"id": "a", "title": "t", "priority": 0})).expect("int");
        assert_eq!(by_int.priority(), TaskPriority::Critical);

        let by_digit_string =
            record(json!({"id": "b", "title": "t", "priority": "3"})).expect("digits");
        assert_eq!(by_digit_string.priority(), TaskPriority::Low);

        let by_name = record(json!({"id": "c", "title": "t", "priority": "high"})).expect("name");
        assert_eq!(by_name.priority(), TaskPriority::High);

        let bad = record(json!({"id": "d", "title": "t", "priority": "7"}));
        assert!(matches!(
            bad,
            Err(CoreError::InvalidInput {
                field: "priority",
                ..
            })
        ));
    }

    #[test]
    fn timestamps_require_timezone() {
        let naive = record(json!({
            "id": "a",
            "title": "t",
            "created_at": "2026-03-01T10:00:00",
        }));
        assert!(matches!(
            naive,
            Err(CoreError::InvalidInput {
                field: "created_at",
                ..
            })
        ));

        let offset = record(json!({
            "id": "b",
            "title": "t",
            "created_at": "2026-03-01T10:00:00+08:00",
            "updated_at": "2026-03-01T02:30:00Z",
        }))
        .expect("offset forms are accepted and normalized to UTC");
        assert_eq!(
            offset.created_at(),
            "2026-03-01T02:00:00Z".parse::<DateTime<Utc>>().expect("utc")
        );
    }

    #[test]
    fn updated_before_created_is_rejected() {
        let result = record(json!({
            "id": "a",
            "title": "t",
            "created_at": "2026-03-01T10:00:00Z",
            "updated_at": "2026-03-01T09:59:59Z",
        }));
        assert!(matches!(
            result,
            Err(CoreError::InvalidInput {
                field: "updated_at",
                ..
            })
        ));
    }

    #[test]
    fn out_of_range_progress_is_rejected() {
        let result = record(json!({"id": "a", "title": "t", "progress": 1.2}));
        assert!(matches!(
            result,
            Err(CoreError::InvalidInput {
                field: "progress",
                ..
            })
        ));
    }
}
