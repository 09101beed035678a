//! Built-in defaults (layer 1).

use std::env;
use std::path::PathBuf;

use serde_json::{json, Value};

use crate::timeout::DEFAULT_TIMEOUT;

/// Built-in default configuration values.
#[derive(Debug, Clone)]
pub struct BuiltinDefaults {
    /// One worker per CPU
    pub parallelism: usize,
    pub timeout_seconds: u64,
    pub cache_dir: PathBuf,
    pub temp_dir: PathBuf,
    pub workspace: &'static str,
    pub docker_binary: &'static str,
    pub diff_binary: &'static str,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        let temp_dir = env::temp_dir();
        let cache_dir = home_dir()
            .map(|home| home.join(".cache").join("batch-exec"))
            .unwrap_or_else(|| temp_dir.join("batch-exec-cache"));
        Self {
            parallelism: num_cpus::get().max(1),
            timeout_seconds: DEFAULT_TIMEOUT.as_secs(),
            cache_dir,
            temp_dir,
            workspace: "auto",
            docker_binary: "docker",
            diff_binary: "diff",
        }
    }
}

impl BuiltinDefaults {
    /// As a JSON layer for merging.
    pub fn to_value(&self) -> Value {
        json!({
            "parallelism": self.parallelism,
            "timeout_seconds": self.timeout_seconds,
            "cache_dir": self.cache_dir,
            "temp_dir": self.temp_dir,
            "keep_logs": false,
            "clear_cache": false,
            "no_cache": false,
            "skip_errors": false,
            "workspace": self.workspace,
            "docker_binary": self.docker_binary,
            "diff_binary": self.diff_binary,
        })
    }
}

pub(crate) fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// `~/.config/batch-exec/config.toml`, if `HOME` is set.
pub fn default_config_path() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".config").join("batch-exec").join("config.toml"))
}
