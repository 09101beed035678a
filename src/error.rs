//! Task and run errors, failure taxonomy and exit codes.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use step_spec::ValidationError;
use thiserror::Error;

use crate::cache::CacheError;
use crate::diff::DiffError;
use crate::runner::StepError;
use crate::task::{KeyError, Repository};
use crate::workspace::WorkspaceError;

/// Failure category of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Archive fetch, extraction, volume or image preparation
    Provisioning,
    /// A step exited non-zero or could not be run
    Execution,
    Timeout,
    Diff,
    Cancelled,
    Cache,
}

impl ErrorKind {
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Provisioning => "Workspace provisioning failed",
            ErrorKind::Execution => "Step execution failed",
            ErrorKind::Timeout => "Task timed out",
            ErrorKind::Diff => "Diff computation failed",
            ErrorKind::Cancelled => "Task cancelled",
            ErrorKind::Cache => "Cache access failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Error attached to a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("computing cache key: {0}")]
    Key(#[from] KeyError),

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("preparing image for step {step}: {message}")]
    Image { step: usize, message: String },

    #[error("workspace: {0}")]
    Provisioning(#[from] WorkspaceError),

    #[error("creating task log: {0}")]
    Log(#[source] std::io::Error),

    #[error(transparent)]
    Step(StepError),

    #[error("step {step} timed out after {timeout:?}")]
    Timeout { step: usize, timeout: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("diff: {0}")]
    Diff(#[from] DiffError),

    #[error("identical task {key} failed: {reason}")]
    DuplicateOf { key: String, reason: String },
}

impl From<StepError> for TaskError {
    fn from(e: StepError) -> Self {
        match e {
            StepError::TimedOut { step, timeout } => TaskError::Timeout { step, timeout },
            StepError::Cancelled { .. } => TaskError::Cancelled,
            other => TaskError::Step(other),
        }
    }
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Key(_) | TaskError::Cache(_) => ErrorKind::Cache,
            TaskError::Image { .. } | TaskError::Provisioning(_) | TaskError::Log(_) => {
                ErrorKind::Provisioning
            }
            TaskError::Step(_) | TaskError::DuplicateOf { .. } => ErrorKind::Execution,
            TaskError::Timeout { .. } => ErrorKind::Timeout,
            TaskError::Cancelled => ErrorKind::Cancelled,
            TaskError::Diff(_) => ErrorKind::Diff,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout { .. })
    }
}

/// Serializable error summary attached to task status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&TaskError> for TaskErrorInfo {
    fn from(e: &TaskError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// A failed task in the run aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub repository: Repository,
    #[serde(flatten)]
    pub error: TaskErrorInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<String>,
}

/// Every task failure of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailures(pub Vec<TaskFailure>);

impl TaskFailures {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaskFailure> {
        self.0.iter()
    }
}

impl fmt::Display for TaskFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed:", self.0.len())?;
        for failure in &self.0 {
            write!(
                f,
                "\n  {} [{:?}]: {}",
                failure.repository, failure.error.kind, failure.error.message
            )?;
            if let Some(log) = &failure.log_file {
                write!(f, " (log: {})", log)?;
            }
        }
        Ok(())
    }
}

/// Run-scoped errors.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid steps: {0}")]
    Validation(#[from] ValidationError),

    #[error("workspace mode `volume` cannot run host command steps ({repository})")]
    VolumeWithHostSteps { repository: String },

    #[error("cache: {0}")]
    Cache(#[from] CacheError),

    #[error("{0}")]
    Tasks(TaskFailures),

    #[error("run cancelled")]
    Cancelled,

    #[error("worker thread panicked")]
    WorkerPanicked,
}

impl RunError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            RunError::Validation(_) | RunError::VolumeWithHostSteps { .. } => ExitCode::Config,
            RunError::Cancelled => ExitCode::Cancelled,
            RunError::Cache(_) | RunError::Tasks(_) | RunError::WorkerPanicked => {
                ExitCode::TaskFailed
            }
        }
    }
}

/// Process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    /// Configuration or validation error before any task ran
    Config = 1,
    /// One or more tasks failed
    TaskFailed = 2,
    Cancelled = 80,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }
}
