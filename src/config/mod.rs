//! Layered configuration.
//!
//! Three layers, later ones winning:
//! 1. Built-in defaults
//! 2. Config file (`--config`, or `~/.config/batch-exec/config.toml` when present)
//! 3. CLI flags
//!
//! Layers are merged as JSON values and the result is deserialized into
//! [`ExecConfig`], which rejects unknown keys.

mod defaults;
mod merge;

pub use defaults::{default_config_path, BuiltinDefaults};
pub use merge::{deep_merge, merge_layers};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::cache::{DiskCache, ExecutionCache};
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::diff::DiffTool;
use crate::docker::{DockerCli, ImageResolver};
use crate::runner::StepRunner;
use crate::timeout::{TaskTimeout, MAX_TIMEOUT};
use crate::workspace::{ArchiveSource, Provisioner, WorkspaceMode};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Where the repository archives come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Base URL of the archive endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Local directory of `<name>@<rev>.tar` archives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store: Option<PathBuf>,
}

/// Fully merged configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecConfig {
    pub parallelism: usize,
    pub timeout_seconds: u64,
    pub cache_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub keep_logs: bool,
    /// Remove every cache entry before dispatch
    pub clear_cache: bool,
    /// Neither read nor write cached results
    pub no_cache: bool,
    pub skip_errors: bool,
    pub workspace: WorkspaceMode,
    pub docker_binary: String,
    pub diff_binary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceConfig>,
}

/// Origin of a configuration layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigLayer {
    pub origin: ConfigOrigin,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl ExecConfig {
    /// Merge the layers and validate the result.
    ///
    /// `file` is read when given; otherwise the default path is used if it
    /// exists. `cli` holds only the flags that were passed.
    pub fn load(file: Option<&Path>, cli: Value) -> ConfigResult<(Self, Vec<ConfigLayer>)> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut origins = vec![ConfigLayer {
            origin: ConfigOrigin::Builtin,
            path: None,
        }];

        let file = match file {
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|p| p.is_file()),
        };
        if let Some(path) = file {
            layers.push(Self::load_toml_file(&path)?);
            origins.push(ConfigLayer {
                origin: ConfigOrigin::File,
                path: Some(path),
            });
        }

        layers.push(cli);
        origins.push(ConfigLayer {
            origin: ConfigOrigin::Cli,
            path: None,
        });

        let config: ExecConfig = serde_json::from_value(merge_layers(layers))?;
        config.validate()?;
        Ok((config, origins))
    }

    fn load_toml_file(path: &Path) -> ConfigResult<Value> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let table: toml::Table = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::to_value(table)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.parallelism == 0 {
            return Err(ConfigError::Validation(
                "parallelism must be at least 1".to_string(),
            ));
        }
        if self.timeout_seconds == 0 || self.timeout_seconds > MAX_TIMEOUT.as_secs() {
            return Err(ConfigError::Validation(format!(
                "timeout_seconds must be in (0, {}]",
                MAX_TIMEOUT.as_secs()
            )));
        }
        if let Some(source) = &self.source {
            match (&source.endpoint, &source.store) {
                (Some(_), Some(_)) => {
                    return Err(ConfigError::Validation(
                        "source: set either `endpoint` or `store`, not both".to_string(),
                    ))
                }
                (None, None) => {
                    return Err(ConfigError::Validation(
                        "source: one of `endpoint` or `store` is required".to_string(),
                    ))
                }
                _ => {}
            }
        }
        Ok(())
    }

    pub fn timeout(&self) -> TaskTimeout {
        // validated to be within bounds
        TaskTimeout::new(Duration::from_secs(self.timeout_seconds)).unwrap_or_default()
    }

    pub fn cache(&self) -> ExecutionCache {
        if self.no_cache {
            ExecutionCache::NoOp
        } else {
            ExecutionCache::Disk(DiskCache::new(&self.cache_dir))
        }
    }

    pub fn archive_source(&self) -> ConfigResult<ArchiveSource> {
        let source = self.source.as_ref().ok_or_else(|| {
            ConfigError::Validation(
                "no archive source configured; pass --endpoint or --store".to_string(),
            )
        })?;
        match (&source.endpoint, &source.store) {
            (Some(endpoint), None) => ArchiveSource::remote(endpoint, source.token.clone())
                .map_err(|e| ConfigError::Validation(e.to_string())),
            (None, Some(store)) => Ok(ArchiveSource::store(store)),
            _ => Err(ConfigError::Validation(
                "source: set exactly one of `endpoint` or `store`".to_string(),
            )),
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            parallelism: self.parallelism,
            timeout: self.timeout(),
            keep_logs: self.keep_logs,
            skip_errors: self.skip_errors,
            workspace_mode: self.workspace,
            log_dir: self.temp_dir.clone(),
        }
    }

    /// Wire up a coordinator from this configuration.
    pub fn coordinator(&self) -> ConfigResult<Coordinator> {
        let docker = DockerCli::new(&self.docker_binary);
        Ok(Coordinator::new(
            self.coordinator_config(),
            self.cache(),
            Provisioner::new(self.archive_source()?, &self.temp_dir, docker.clone()),
            StepRunner::new(docker.clone(), &self.cache_dir, &self.temp_dir),
            ImageResolver::new(docker),
            DiffTool::new(&self.diff_binary),
        ))
    }

    /// The configuration as JSON with the access token masked.
    pub fn redacted(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or(Value::Null);
        if let Some(token) = value.pointer_mut("/source/token") {
            *token = Value::String("[REDACTED]".to_string());
        }
        value
    }
}
