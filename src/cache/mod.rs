//! Execution result cache.
//!
//! One JSON file per cache key: `<cache_dir>/<key>.json`. Entries are
//! written once and never updated in place. Writes go through a temp file in
//! the same directory followed by a rename, so concurrent writers for the
//! same key never leave a torn file behind.
//!
//! An entry that fails to decode is deleted and reported as a miss.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, warn};

use crate::task::{CacheKey, Patch};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("encoding cache entry: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of executing one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    /// `None` when the steps produced no changes.
    pub patch: Option<Patch>,
    /// Step outputs accumulated over the task.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, Value>,
}

impl CachedResult {
    pub fn no_changes() -> Self {
        Self {
            patch: None,
            outputs: BTreeMap::new(),
        }
    }
}

/// On-disk cache rooted at a directory.
#[derive(Debug, Clone)]
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    pub fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedResult>> {
        let path = self.path_for(key);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(key = %key, "cache miss");
                return Ok(None);
            }
            Err(e) => return Err(io_err(&path)(e)),
        };

        match serde_json::from_slice::<CachedResult>(&content) {
            Ok(result) => {
                debug!(key = %key, "cache hit");
                Ok(Some(result))
            }
            Err(e) => {
                warn!(key = %key, path = %path.display(), error = %e, "discarding corrupt cache entry");
                match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(io_err(&path)(e)),
                }
                Ok(None)
            }
        }
    }

    pub fn set(&self, key: &CacheKey, result: &CachedResult) -> CacheResult<()> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let path = self.path_for(key);
        let json = serde_json::to_vec_pretty(result)?;

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
        tmp.write_all(&json).map_err(io_err(tmp.path()))?;
        tmp.persist(&path).map_err(|e| CacheError::Io {
            path: path.clone(),
            source: e.error,
        })?;
        debug!(key = %key, path = %path.display(), "cache entry written");
        Ok(())
    }

    /// Remove every cache entry. Returns the number of entries removed.
    pub fn clear(&self) -> CacheResult<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_err(&self.dir)(e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path).map_err(io_err(&path))?;
                removed += 1;
            }
        }
        debug!(dir = %self.dir.display(), removed, "cache cleared");
        Ok(removed)
    }
}

/// Execution cache. `NoOp` always misses and silently drops writes.
#[derive(Debug, Clone)]
pub enum ExecutionCache {
    Disk(DiskCache),
    NoOp,
}

impl ExecutionCache {
    pub fn get(&self, key: &CacheKey) -> CacheResult<Option<CachedResult>> {
        match self {
            ExecutionCache::Disk(cache) => cache.get(key),
            ExecutionCache::NoOp => Ok(None),
        }
    }

    pub fn set(&self, key: &CacheKey, result: &CachedResult) -> CacheResult<()> {
        match self {
            ExecutionCache::Disk(cache) => cache.set(key, result),
            ExecutionCache::NoOp => Ok(()),
        }
    }

    pub fn clear(&self) -> CacheResult<usize> {
        match self {
            ExecutionCache::Disk(cache) => cache.clear(),
            ExecutionCache::NoOp => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Repository;
    use step_spec::Step;
    use tempfile::TempDir;

    fn key(name: &str) -> CacheKey {
        CacheKey::compute(
            &Repository::new("r1", name, "abc"),
            &[Step::command(["true"])],
        )
        .unwrap()
    }

    fn patch_result() -> CachedResult {
        CachedResult {
            patch: Some(Patch {
                repository: Repository::new("r1", "github.com/acme/api", "abc"),
                base_revision: "abc".into(),
                diff: "diff --unified a/README.md b/README.md\n".into(),
            }),
            outputs: BTreeMap::from([("count".to_string(), serde_json::json!(3))]),
        }
    }

    #[test]
    fn test_missing_entry_is_miss() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::new(temp.path().join("does-not-exist"));
        assert_eq!(cache.get(&key("a")).unwrap(), None);
    }

    #[test]
    fn test_set_then_get() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::new(temp.path().join("cache"));
        let k = key("a");

        cache.set(&k, &patch_result()).unwrap();
        assert!(cache.path_for(&k).exists());
        assert_eq!(cache.get(&k).unwrap(), Some(patch_result()));

        cache.set(&key("b"), &CachedResult::no_changes()).unwrap();
        assert_eq!(
            cache.get(&key("b")).unwrap(),
            Some(CachedResult::no_changes())
        );
    }

    #[test]
    fn test_corrupt_entry_deleted() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::new(temp.path());
        let k = key("a");
        fs::write(cache.path_for(&k), b"{ not json").unwrap();

        assert_eq!(cache.get(&k).unwrap(), None);
        assert!(!cache.path_for(&k).exists());
    }

    #[test]
    fn test_clear_removes_entries_only() {
        let temp = TempDir::new().unwrap();
        let cache = DiskCache::new(temp.path());
        cache.set(&key("a"), &CachedResult::no_changes()).unwrap();
        cache.set(&key("b"), &CachedResult::no_changes()).unwrap();
        fs::create_dir(temp.path().join("action-exec-cache-dir")).unwrap();

        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.get(&key("a")).unwrap(), None);
        assert!(temp.path().join("action-exec-cache-dir").exists());
    }

    #[test]
    fn test_noop_cache() {
        let cache = ExecutionCache::NoOp;
        cache.set(&key("a"), &patch_result()).unwrap();
        assert_eq!(cache.get(&key("a")).unwrap(), None);
        assert_eq!(cache.clear().unwrap(), 0);
    }
}
