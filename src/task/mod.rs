//! Tasks: one repository bound to an ordered list of steps.
//!
//! A task is the unit of scheduling, caching and status reporting. Tasks are
//! produced by [`TaskBuilder`] from a [`TaskFile`] and never change once
//! built.

mod builder;
mod key;

pub use builder::TaskBuilder;
pub use key::{short_digest, CacheKey, KeyError};

use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use step_spec::Step;
use thiserror::Error;

/// A resolved repository reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Repository {
    /// Opaque code-host identifier.
    pub id: String,
    /// Display name, e.g. `github.com/acme/api`.
    pub name: String,
    /// Revision to check out. Expected to be a resolved commit.
    pub rev: String,
}

impl Repository {
    pub fn new(id: &str, name: &str, rev: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            rev: rev.to_string(),
        }
    }

    /// Same repository at a different revision.
    pub fn at_revision(&self, rev: &str) -> Self {
        Self {
            rev: rev.to_string(),
            ..self.clone()
        }
    }

    /// Template context value for `${{ repository.* }}`.
    pub fn template_value(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "rev": self.rev,
        })
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.rev)
    }
}

/// Position of a task in the resolved task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// A repository bound to its pruned step list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub repository: Repository,
    pub steps: Vec<Step>,
}

impl Task {
    pub fn has_host_steps(&self) -> bool {
        self.steps.iter().any(Step::is_host_command)
    }
}

/// A produced change for one repository. An empty diff means "no changes".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub repository: Repository,
    /// Revision the diff applies to.
    pub base_revision: String,
    /// Unified diff relative to the repository root.
    pub diff: String,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.diff.is_empty()
    }
}

/// Errors loading a task file.
#[derive(Debug, Error)]
pub enum TaskFileError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Input document: repositories to run against and the steps to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskFile {
    pub repositories: Vec<Repository>,
    pub steps: Vec<Step>,
}

impl TaskFile {
    pub fn from_file(path: &Path) -> Result<Self, TaskFileError> {
        let content = fs::read_to_string(path).map_err(|source| TaskFileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| TaskFileError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
