//! Step definition and validation.

use std::collections::BTreeMap;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Step discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Argument vector executed on the host with the workspace as cwd.
    Command,
    /// Argument vector executed in a container with the workspace mounted.
    Docker,
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Command => write!(f, "command"),
            StepKind::Docker => write!(f, "docker"),
        }
    }
}

/// Skip condition: a literal or a template rendered before the step runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Bool(bool),
    Template(String),
}

/// Decoding applied to a rendered output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

/// A declared step output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputSpec {
    /// Template rendered after the step has run.
    pub value: String,
    #[serde(default)]
    pub format: OutputFormat,
}

/// A read-only host path mounted into a container step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mount {
    /// Host path.
    pub path: String,
    /// Absolute path inside the container.
    pub mountpoint: String,
}

/// A single step.
///
/// Field names follow the batch-spec wire format (`type`, `cacheDirs`,
/// `if`, ...). Maps are ordered so that serialization is stable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Step {
    #[serde(rename = "type")]
    pub kind: StepKind,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Inline Dockerfile contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cache_dirs: Vec<String>,

    /// Environment. A `null` value inherits the variable from the host.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, Option<String>>,

    /// In-container path -> file contents.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mount: Vec<Mount>,

    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputSpec>,

    /// Content digest of the resolved image. Set by the executor only; it is
    /// part of the cache key so that retagged but identical images hash the
    /// same.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_content_digest: Option<String>,
}

/// Errors found while validating steps.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("step {step}: command step requires a non-empty args list")]
    EmptyArgs { step: usize },

    #[error("step {step}: docker step must set exactly one of `image` or `dockerfile`")]
    ImageSource { step: usize },

    #[error("step {step}: `{field}` is only valid on docker steps")]
    DockerOnlyField { step: usize, field: &'static str },

    #[error("step {step}: `imageContentDigest` is internal and cannot be set")]
    InternalField { step: usize },

    #[error("step {step}: invalid cache dir `{dir}`")]
    InvalidCacheDir { step: usize, dir: String },

    #[error("step {step}: invalid environment variable name `{name}`")]
    InvalidEnvName { step: usize, name: String },

    #[error("step {step}: file path `{path}` must be absolute")]
    RelativeFilePath { step: usize, path: String },

    #[error("step {step}: mountpoint `{path}` must be absolute")]
    RelativeMountpoint { step: usize, path: String },

    #[error("step {step}: output name must not be empty")]
    EmptyOutputName { step: usize },

    #[error("no steps given")]
    NoSteps,
}

/// Result type for validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

impl Step {
    /// Create a host command step.
    pub fn command<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::bare(StepKind::Command, args.into_iter().map(Into::into).collect())
    }

    /// Create a container step from an image reference.
    pub fn docker_image<I, S>(image: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut step = Self::bare(StepKind::Docker, args.into_iter().map(Into::into).collect());
        step.image = Some(image.to_string());
        step
    }

    /// Create a container step from an inline Dockerfile.
    pub fn docker_build<I, S>(dockerfile: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut step = Self::bare(StepKind::Docker, args.into_iter().map(Into::into).collect());
        step.dockerfile = Some(dockerfile.to_string());
        step
    }

    fn bare(kind: StepKind, args: Vec<String>) -> Self {
        Self {
            kind,
            args,
            image: None,
            dockerfile: None,
            cache_dirs: Vec::new(),
            env: BTreeMap::new(),
            files: BTreeMap::new(),
            mount: Vec::new(),
            condition: None,
            outputs: BTreeMap::new(),
            image_content_digest: None,
        }
    }

    pub fn is_host_command(&self) -> bool {
        self.kind == StepKind::Command
    }

    /// Validate a user-supplied step. `index` is used in error messages.
    pub fn validate(&self, index: usize) -> ValidationResult<()> {
        if self.image_content_digest.is_some() {
            return Err(ValidationError::InternalField { step: index });
        }

        match self.kind {
            StepKind::Command => {
                if self.args.is_empty() || self.args[0].trim().is_empty() {
                    return Err(ValidationError::EmptyArgs { step: index });
                }
                let docker_only = [
                    ("image", self.image.is_some()),
                    ("dockerfile", self.dockerfile.is_some()),
                    ("cacheDirs", !self.cache_dirs.is_empty()),
                    ("files", !self.files.is_empty()),
                    ("mount", !self.mount.is_empty()),
                ];
                if let Some(&(field, _)) = docker_only.iter().find(|(_, set)| *set) {
                    return Err(ValidationError::DockerOnlyField { step: index, field });
                }
            }
            StepKind::Docker => {
                let image = self.image.as_deref().map(str::trim).filter(|s| !s.is_empty());
                let recipe = self.dockerfile.as_deref().map(str::trim).filter(|s| !s.is_empty());
                if image.is_some() == recipe.is_some() {
                    return Err(ValidationError::ImageSource { step: index });
                }
                for dir in &self.cache_dirs {
                    if !is_valid_cache_dir(dir) {
                        return Err(ValidationError::InvalidCacheDir {
                            step: index,
                            dir: dir.clone(),
                        });
                    }
                }
                for path in self.files.keys() {
                    if !path.starts_with('/') {
                        return Err(ValidationError::RelativeFilePath {
                            step: index,
                            path: path.clone(),
                        });
                    }
                }
                for mount in &self.mount {
                    if !mount.mountpoint.starts_with('/') {
                        return Err(ValidationError::RelativeMountpoint {
                            step: index,
                            path: mount.mountpoint.clone(),
                        });
                    }
                }
            }
        }

        for name in self.env.keys() {
            if name.is_empty() || name.contains('=') || name.contains('\0') {
                return Err(ValidationError::InvalidEnvName {
                    step: index,
                    name: name.clone(),
                });
            }
        }

        if self.outputs.keys().any(|name| name.trim().is_empty()) {
            return Err(ValidationError::EmptyOutputName { step: index });
        }

        Ok(())
    }

    /// Validate an ordered list of steps, stopping at the first error.
    pub fn validate_all(steps: &[Step]) -> ValidationResult<()> {
        if steps.is_empty() {
            return Err(ValidationError::NoSteps);
        }
        steps
            .iter()
            .enumerate()
            .try_for_each(|(index, step)| step.validate(index))
    }
}

fn is_valid_cache_dir(dir: &str) -> bool {
    let trimmed = dir.trim();
    if trimmed.is_empty() || trimmed == "/" {
        return false;
    }
    Path::new(trimmed)
        .components()
        .all(|c| !matches!(c, Component::ParentDir | Component::Prefix(_)))
}
