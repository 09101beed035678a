//! Task status registry.
//!
//! One record per task, guarded by a single mutex. Workers never write a
//! record directly; they send deltas which are merged field by field with
//! "last non-zero value wins": `Some(_)`, `true` and non-zero counters
//! overwrite, `None`, `false` and zero leave the field as it was. Every
//! merge is published to subscribers while the lock is held, so each
//! subscriber sees a task's updates in order.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::diff::DiffStat;
use crate::error::TaskErrorInfo;
use crate::task::{Patch, Repository, Task, TaskId};

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPhase {
    Enqueued,
    Running,
    Cached,
    Succeeded,
    Failed,
}

impl TaskPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskPhase::Cached | TaskPhase::Succeeded | TaskPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub repository: Repository,
    pub cache_key: Option<String>,
    pub cached: bool,
    pub log_file: Option<PathBuf>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// 1-based index of the step currently running; 0 before the first.
    pub current_step: usize,
    pub step_count: usize,
    pub patch: Option<Patch>,
    pub diff_stat: Option<DiffStat>,
    pub error: Option<TaskErrorInfo>,
}

impl TaskStatus {
    pub fn new(task: &Task) -> Self {
        Self {
            task_id: task.id,
            repository: task.repository.clone(),
            cache_key: None,
            cached: false,
            log_file: None,
            enqueued_at: None,
            started_at: None,
            finished_at: None,
            current_step: 0,
            step_count: task.steps.len(),
            patch: None,
            diff_stat: None,
            error: None,
        }
    }

    pub fn phase(&self) -> TaskPhase {
        if self.finished_at.is_some() {
            if self.error.is_some() {
                TaskPhase::Failed
            } else if self.cached {
                TaskPhase::Cached
            } else {
                TaskPhase::Succeeded
            }
        } else if self.started_at.is_some() {
            TaskPhase::Running
        } else {
            TaskPhase::Enqueued
        }
    }

    /// Merge a delta into this record.
    pub fn merge(&mut self, delta: StatusDelta) {
        fn take<T>(field: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *field = value;
            }
        }

        take(&mut self.cache_key, delta.cache_key);
        self.cached |= delta.cached;
        take(&mut self.log_file, delta.log_file);
        take(&mut self.enqueued_at, delta.enqueued_at);
        take(&mut self.started_at, delta.started_at);
        take(&mut self.finished_at, delta.finished_at);
        if delta.current_step != 0 {
            self.current_step = delta.current_step;
        }
        if delta.step_count != 0 {
            self.step_count = delta.step_count;
        }
        take(&mut self.patch, delta.patch);
        take(&mut self.diff_stat, delta.diff_stat);
        take(&mut self.error, delta.error);
    }
}

/// Partial status update.
#[derive(Debug, Clone, Default)]
pub struct StatusDelta {
    pub cache_key: Option<String>,
    pub cached: bool,
    pub log_file: Option<PathBuf>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub current_step: usize,
    pub step_count: usize,
    pub patch: Option<Patch>,
    pub diff_stat: Option<DiffStat>,
    pub error: Option<TaskErrorInfo>,
}

#[derive(Default)]
struct Inner {
    statuses: BTreeMap<TaskId, TaskStatus>,
    subscribers: Vec<Sender<TaskStatus>>,
}

/// All task statuses of a run.
#[derive(Default)]
pub struct StatusRegistry {
    inner: Mutex<Inner>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive a snapshot after every change.
    pub fn subscribe(&self) -> Receiver<TaskStatus> {
        let (tx, rx) = unbounded();
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.push(tx);
        }
        rx
    }

    /// Drop all subscribers, ending their receive loops.
    pub fn close(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.subscribers.clear();
        }
    }

    pub fn enqueue(&self, task: &Task) {
        let mut status = TaskStatus::new(task);
        status.enqueued_at = Some(Utc::now());
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.statuses.insert(task.id, status.clone());
        publish(&mut inner.subscribers, &status);
    }

    pub fn update(&self, id: TaskId, delta: StatusDelta) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let Inner {
            statuses,
            subscribers,
        } = &mut *inner;
        if let Some(status) = statuses.get_mut(&id) {
            status.merge(delta);
            publish(subscribers, status);
        }
    }

    pub fn get(&self, id: TaskId) -> Option<TaskStatus> {
        self.inner.lock().ok()?.statuses.get(&id).cloned()
    }

    /// All statuses ordered by task id.
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        self.inner
            .lock()
            .map(|inner| inner.statuses.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn publish(subscribers: &mut Vec<Sender<TaskStatus>>, status: &TaskStatus) {
    subscribers.retain(|tx| tx.send(status.clone()).is_ok());
}
