//! Line-delimited progress events derived from task status updates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::coordinator::{TaskPhase, TaskStatus};
use crate::task::TaskId;

pub const OPERATION: &str = "BATCH_EXEC_TASK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Started,
    Progress,
    Success,
    Failure,
}

/// One progress event, serialized as a single JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub operation: String,
    pub status: EventStatus,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    /// Event for a status snapshot; enqueued tasks produce none.
    pub fn for_status(status: &TaskStatus) -> Option<Self> {
        let repo = &status.repository;
        let (event, message) = match status.phase() {
            TaskPhase::Enqueued => return None,
            TaskPhase::Running if status.current_step == 0 => {
                (EventStatus::Started, format!("executing steps in {repo}"))
            }
            TaskPhase::Running => (
                EventStatus::Progress,
                format!(
                    "{repo}: step {}/{}",
                    status.current_step, status.step_count
                ),
            ),
            TaskPhase::Cached => (EventStatus::Success, format!("{repo}: cached result")),
            TaskPhase::Succeeded => (EventStatus::Success, format!("{repo}: done")),
            TaskPhase::Failed => {
                let reason = status
                    .error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("unknown error");
                (EventStatus::Failure, format!("{repo}: {reason}"))
            }
        };

        let mut metadata = json!({
            "task": status.task_id,
            "repository": repo.name,
            "rev": repo.rev,
        });
        if let Some(key) = &status.cache_key {
            metadata["cacheKey"] = json!(key);
        }
        if status.current_step != 0 {
            metadata["step"] = json!(status.current_step);
            metadata["steps"] = json!(status.step_count);
        }
        if let Some(stat) = &status.diff_stat {
            metadata["added"] = json!(stat.added);
            metadata["changed"] = json!(stat.changed);
            metadata["deleted"] = json!(stat.deleted);
        }
        if let Some(log) = &status.log_file {
            metadata["logFile"] = json!(log.display().to_string());
        }
        if let Some(error) = &status.error {
            metadata["kind"] = json!(error.kind);
        }

        Some(Self {
            operation: OPERATION.to_string(),
            status: event,
            message,
            metadata,
            timestamp: Utc::now(),
        })
    }
}

/// Turns the status stream into events, dropping repeats.
///
/// A task's record is republished on every merge, so several snapshots can
/// map to the same event (for example a log file being attached while the
/// same step is still running).
#[derive(Debug, Default)]
pub struct EventFeed {
    last: HashMap<TaskId, (EventStatus, usize)>,
}

impl EventFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self, status: &TaskStatus) -> Option<LogEvent> {
        let event = LogEvent::for_status(status)?;
        let mark = (event.status, status.current_step);
        if self.last.get(&status.task_id) == Some(&mark) {
            return None;
        }
        self.last.insert(status.task_id, mark);
        Some(event)
    }
}
