//! Per-task workspaces.
//!
//! A workspace holds two extractions of the same snapshot: `pristine/`, the
//! diff baseline that no step ever touches, and the mutable tree the steps
//! run against. With the bind strategy the mutable tree is `workspace/` on
//! the host and is bind-mounted into containers. With the volume strategy it
//! lives in a docker volume and is copied out to `export/` for diffing.
//!
//! Cleanup is idempotent and also runs on drop, so every exit path
//! (including a failure halfway through provisioning) releases the
//! workspace.

mod archive;
mod volume;

pub use archive::{extract, ArchiveSource, COMMIT_HEADER};

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

use crate::docker::{DockerCli, DockerError};
use crate::signal::CancelToken;
use crate::task::{Repository, Task};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("fetching archive for {repository}: {message}")]
    Fetch { repository: String, message: String },

    #[error("extracting {archive}: {source}")]
    Extract {
        archive: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("docker volume: {0}")]
    Volume(#[from] DockerError),

    #[error("invalid workspace mode `{0}` (expected auto, bind or volume)")]
    InvalidMode(String),

    #[error("workspace has already been cleaned up")]
    Released,
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> WorkspaceError + '_ {
    move |source| WorkspaceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// User-facing workspace selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    #[default]
    Auto,
    Bind,
    Volume,
}

impl FromStr for WorkspaceMode {
    type Err = WorkspaceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(WorkspaceMode::Auto),
            "bind" => Ok(WorkspaceMode::Bind),
            "volume" => Ok(WorkspaceMode::Volume),
            other => Err(WorkspaceError::InvalidMode(other.to_string())),
        }
    }
}

impl fmt::Display for WorkspaceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkspaceMode::Auto => write!(f, "auto"),
            WorkspaceMode::Bind => write!(f, "bind"),
            WorkspaceMode::Volume => write!(f, "volume"),
        }
    }
}

/// Concrete strategy used for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceStrategy {
    Bind,
    Volume,
}

impl WorkspaceMode {
    /// Pick the strategy for a task. Host steps need the tree on the host,
    /// so they always get a bind workspace; otherwise volumes are preferred
    /// where bind mounts are slow (docker on macOS).
    ///
    /// Returns `None` when the mode cannot serve the task (explicit volume
    /// mode with host steps).
    pub fn strategy_for(&self, task: &Task) -> Option<WorkspaceStrategy> {
        match self {
            WorkspaceMode::Bind => Some(WorkspaceStrategy::Bind),
            WorkspaceMode::Volume if task.has_host_steps() => None,
            WorkspaceMode::Volume => Some(WorkspaceStrategy::Volume),
            WorkspaceMode::Auto if task.has_host_steps() => Some(WorkspaceStrategy::Bind),
            WorkspaceMode::Auto if cfg!(target_os = "macos") => Some(WorkspaceStrategy::Volume),
            WorkspaceMode::Auto => Some(WorkspaceStrategy::Bind),
        }
    }
}

/// Where the mutable tree lives.
#[derive(Debug)]
pub enum Mutable {
    Dir(PathBuf),
    Volume { name: String, docker: DockerCli },
}

/// A materialized repository snapshot owned by one task.
#[derive(Debug)]
pub struct Workspace {
    root: Option<TempDir>,
    pristine: PathBuf,
    mutable: Mutable,
    repository: Repository,
    released: bool,
}

impl Workspace {
    pub fn pristine(&self) -> &Path {
        &self.pristine
    }

    pub fn mutable(&self) -> &Mutable {
        &self.mutable
    }

    pub fn strategy(&self) -> WorkspaceStrategy {
        match self.mutable {
            Mutable::Dir(_) => WorkspaceStrategy::Bind,
            Mutable::Volume { .. } => WorkspaceStrategy::Volume,
        }
    }

    /// Host directory of the mutable tree (bind strategy only).
    pub fn host_dir(&self) -> Option<&Path> {
        match &self.mutable {
            Mutable::Dir(dir) => Some(dir),
            Mutable::Volume { .. } => None,
        }
    }

    /// The repository as materialized, with the revision that was actually
    /// checked out.
    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// `--mount` argument that places the mutable tree at `target`.
    pub fn mount_arg(&self, target: &str) -> String {
        match &self.mutable {
            Mutable::Dir(dir) => format!("type=bind,source={},target={}", dir.display(), target),
            Mutable::Volume { name, .. } => format!("type=volume,source={},target={}", name, target),
        }
    }

    /// A host directory holding the current mutable tree, for diffing.
    pub fn snapshot_dir(&self, cancel: Option<&CancelToken>) -> WorkspaceResult<PathBuf> {
        let root = self.root.as_ref().ok_or(WorkspaceError::Released)?;
        match &self.mutable {
            Mutable::Dir(dir) => Ok(dir.clone()),
            Mutable::Volume { name, docker } => {
                let export = root.path().join("export");
                if export.exists() {
                    fs::remove_dir_all(&export).map_err(io_err(&export))?;
                }
                fs::create_dir(&export).map_err(io_err(&export))?;
                volume::export(docker, name, &export, cancel)?;
                Ok(export)
            }
        }
    }

    /// Release the workspace. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Mutable::Volume { name, docker } = &self.mutable {
            docker.volume_remove(name);
        }
        if let Some(root) = self.root.take() {
            let path = root.path().to_path_buf();
            match root.close() {
                Ok(()) => debug!(path = %path.display(), "workspace removed"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove workspace"),
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Creates workspaces from snapshot archives.
#[derive(Debug, Clone)]
pub struct Provisioner {
    source: ArchiveSource,
    temp_dir: PathBuf,
    docker: DockerCli,
}

impl Provisioner {
    pub fn new(source: ArchiveSource, temp_dir: impl Into<PathBuf>, docker: DockerCli) -> Self {
        Self {
            source,
            temp_dir: temp_dir.into(),
            docker,
        }
    }

    pub fn provision(
        &self,
        repository: &Repository,
        strategy: WorkspaceStrategy,
        cancel: Option<&CancelToken>,
    ) -> WorkspaceResult<Workspace> {
        fs::create_dir_all(&self.temp_dir).map_err(io_err(&self.temp_dir))?;
        let root = tempfile::Builder::new()
            .prefix("batch-exec-workspace-")
            .tempdir_in(&self.temp_dir)
            .map_err(io_err(&self.temp_dir))?;

        let archive = root.path().join("snapshot.tar");
        let materialized = self.source.fetch(repository, &archive)?;

        let pristine = root.path().join("pristine");
        fs::create_dir(&pristine).map_err(io_err(&pristine))?;
        extract(&archive, &pristine)?;

        // From here on the workspace owns the root dir, so any failure below
        // is cleaned up by drop.
        let mut workspace = Workspace {
            root: Some(root),
            pristine,
            mutable: Mutable::Dir(PathBuf::new()),
            repository: repository.at_revision(&materialized),
            released: false,
        };
        let root_path = workspace
            .root
            .as_ref()
            .map(|r| r.path().to_path_buf())
            .ok_or(WorkspaceError::Released)?;

        match strategy {
            WorkspaceStrategy::Bind => {
                let dir = root_path.join("workspace");
                fs::create_dir(&dir).map_err(io_err(&dir))?;
                extract(&archive, &dir)?;
                workspace.mutable = Mutable::Dir(dir);
            }
            WorkspaceStrategy::Volume => {
                let name = self.docker.volume_create()?;
                workspace.mutable = Mutable::Volume {
                    name: name.clone(),
                    docker: self.docker.clone(),
                };
                let seed = root_path.join("seed");
                fs::create_dir(&seed).map_err(io_err(&seed))?;
                extract(&archive, &seed)?;
                volume::seed(&self.docker, &name, &seed, cancel)?;
                fs::remove_dir_all(&seed).map_err(io_err(&seed))?;
            }
        }

        fs::remove_file(&archive).map_err(io_err(&archive))?;
        debug!(
            repository = %workspace.repository,
            strategy = ?strategy,
            path = %root_path.display(),
            "workspace provisioned"
        );
        Ok(workspace)
    }
}
