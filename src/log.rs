//! Per-task log files.
//!
//! Each task writes the combined output of its steps to
//! `<log_dir>/batch-exec-<repo>-<ulid>.log`. The file is removed when the
//! task finishes unless logs are kept.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::warn;

#[derive(Debug)]
pub struct TaskLog {
    path: PathBuf,
    file: Mutex<File>,
    keep: bool,
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

impl TaskLog {
    pub fn create(dir: &Path, repository_name: &str, keep: bool) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "batch-exec-{}-{}.log",
            sanitize(repository_name),
            ulid::Ulid::new()
        ));
        let file = OpenOptions::new().create_new(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
            keep,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_kept(&self) -> bool {
        self.keep
    }

    /// Append one line. Write failures are logged and otherwise ignored so
    /// that a full disk does not fail the step being logged.
    pub fn line(&self, prefix: &str, text: &str) {
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = writeln!(file, "{}: {}", prefix, text.trim_end_matches('\n')) {
            warn!(path = %self.path.display(), error = %e, "failed to write task log");
        }
    }

    /// Append a block of text verbatim.
    pub fn block(&self, text: &str) {
        let Ok(mut file) = self.file.lock() else {
            return;
        };
        if let Err(e) = file.write_all(text.as_bytes()) {
            warn!(path = %self.path.display(), error = %e, "failed to write task log");
        }
    }

    /// Finish the log. Returns the path when the log is retained.
    pub fn close(self) -> Option<PathBuf> {
        if self.keep {
            if let Ok(mut file) = self.file.lock() {
                let _ = file.flush();
            }
            return Some(self.path);
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove task log");
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_kept() {
        let temp = TempDir::new().unwrap();
        let log = TaskLog::create(temp.path(), "github.com/acme/api", true).unwrap();
        let file_name = log.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("batch-exec-github.com_acme_api-"));
        assert!(file_name.ends_with(".log"));

        log.line("stdout", "hello\n");
        log.line("stderr", "oops");
        let path = log.close().unwrap();
        assert_eq!(fs::read_to_string(path).unwrap(), "stdout: hello\nstderr: oops\n");
    }

    #[test]
    fn test_log_removed_when_not_kept() {
        let temp = TempDir::new().unwrap();
        let log = TaskLog::create(temp.path(), "repo", false).unwrap();
        let path = log.path().to_path_buf();
        log.block("partial diff\n");
        assert!(path.exists());
        assert_eq!(log.close(), None);
        assert!(!path.exists());
    }
}
