//! Thin wrapper around the `docker` command line.
//!
//! Only the handful of subcommands the executor needs are exposed. All of
//! them run through the process supervisor.

mod image;

pub use image::{ImageError, ImageResolver, ImageSource};

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::process::{self, ProcessError, ProcessOutput, Supervision};
use crate::signal::CancelToken;

/// Timeout for cleanup commands (`docker rm -f`, `docker volume rm`).
pub const CLEANUP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DockerError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("docker {operation} failed (exit {code:?}): {stderr}")]
    Failed {
        operation: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("docker {operation} produced no output")]
    EmptyOutput { operation: &'static str },

    #[error("preparing build context: {0}")]
    BuildContext(#[source] std::io::Error),
}

pub type DockerResult<T> = Result<T, DockerError>;

#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: PathBuf,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl DockerCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// True when the daemon answers `docker version`.
    pub fn is_available(&self) -> bool {
        let mut cmd = self.command();
        cmd.args(["version", "--format", "{{.Server.Version}}"]);
        matches!(process::run_with_timeout(&mut cmd, CLEANUP_TIMEOUT), Ok(out) if out.success())
    }

    fn checked(
        &self,
        operation: &'static str,
        cmd: &mut Command,
        cancel: Option<&CancelToken>,
    ) -> DockerResult<ProcessOutput> {
        let output = process::run_supervised(
            cmd,
            Supervision {
                cancel,
                ..Supervision::default()
            },
            None,
        )?;
        if !output.success() {
            return Err(DockerError::Failed {
                operation,
                code: output.exit_code(),
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    fn first_line(operation: &'static str, output: &ProcessOutput) -> DockerResult<String> {
        output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
            .ok_or(DockerError::EmptyOutput { operation })
    }

    /// Build an inline Dockerfile and return the image ID.
    pub fn build(&self, dockerfile: &str, cancel: Option<&CancelToken>) -> DockerResult<String> {
        let context = tempfile::Builder::new()
            .prefix("batch-exec-build-")
            .tempdir()
            .map_err(DockerError::BuildContext)?;
        let recipe = context.path().join("Dockerfile");
        fs::write(&recipe, dockerfile).map_err(DockerError::BuildContext)?;

        let mut cmd = self.command();
        cmd.args(["build", "--quiet", "--file"])
            .arg(&recipe)
            .arg(context.path());
        let output = self.checked("build", &mut cmd, cancel)?;
        Self::first_line("build", &output)
    }

    /// Content ID of a local image, or `None` when it is not present.
    pub fn image_id(&self, image: &str) -> DockerResult<Option<String>> {
        let mut cmd = self.command();
        cmd.args(["image", "inspect", "--format", "{{.Id}}", image]);
        let output = process::run_captured(&mut cmd)?;
        if !output.success() {
            debug!(image, "image not present locally");
            return Ok(None);
        }
        Self::first_line("image inspect", &output).map(Some)
    }

    pub fn pull(&self, image: &str, cancel: Option<&CancelToken>) -> DockerResult<()> {
        let mut cmd = self.command();
        cmd.args(["image", "pull", "--quiet", image]);
        self.checked("pull", &mut cmd, cancel)?;
        Ok(())
    }

    /// Content ID of an image, pulling it first when missing.
    pub fn resolve_image(&self, image: &str, cancel: Option<&CancelToken>) -> DockerResult<String> {
        if let Some(id) = self.image_id(image)? {
            return Ok(id);
        }
        self.pull(image, cancel)?;
        self.image_id(image)?.ok_or(DockerError::EmptyOutput {
            operation: "image inspect",
        })
    }

    pub fn volume_create(&self) -> DockerResult<String> {
        let mut cmd = self.command();
        cmd.args(["volume", "create"]);
        let output = self.checked("volume create", &mut cmd, None)?;
        Self::first_line("volume create", &output)
    }

    /// Best-effort volume removal.
    pub fn volume_remove(&self, name: &str) {
        let mut cmd = self.command();
        cmd.args(["volume", "rm", "--force", name]);
        match process::run_with_timeout(&mut cmd, CLEANUP_TIMEOUT) {
            Ok(out) if out.success() => debug!(volume = name, "volume removed"),
            Ok(out) => warn!(volume = name, stderr = %out.stderr.trim(), "failed to remove volume"),
            Err(e) => warn!(volume = name, error = %e, "failed to remove volume"),
        }
    }

    /// Best-effort forced container removal.
    pub fn remove_container(&self, container_id: &str) {
        let mut cmd = self.command();
        cmd.args(["rm", "--force", container_id]);
        match process::run_with_timeout(&mut cmd, CLEANUP_TIMEOUT) {
            Ok(out) if out.success() => debug!(container = container_id, "container removed"),
            Ok(out) => {
                warn!(container = container_id, stderr = %out.stderr.trim(), "failed to remove container")
            }
            Err(e) => warn!(container = container_id, error = %e, "failed to remove container"),
        }
    }
}
