//! Workspace diffing.
//!
//! Runs the system `diff` over the pristine and mutated trees and rewrites
//! the result into a patch relative to the repository root:
//!
//! - temporary directory prefixes become `a/` and `b/`
//! - header timestamps are dropped, so identical changes produce
//!   byte-identical patches
//! - a side that does not exist becomes `/dev/null`
//!
//! Only header lines outside hunks are rewritten. Hunk bodies are copied
//! byte for byte (line endings included) and checked against their `@@`
//! line counts; a patch that does not add up is a [`DiffError::Parse`].
//! Output that is not UTF-8 is rejected rather than decoded lossily.

mod stats;

pub use stats::{DiffStat, FileStat, HunkHeader, BAR_WIDTH};

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use thiserror::Error;
use tracing::{debug, warn};

use crate::process::{self, ProcessError, Supervision};
use crate::signal::CancelToken;

#[derive(Debug, Error)]
pub enum DiffError {
    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("diff failed (exit {code:?}): {stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("malformed diff at line {line}: {content}")]
    Parse { line: usize, content: String },

    #[error("diff output is not valid UTF-8 (invalid byte at offset {offset})")]
    Encoding { offset: usize },

    #[error("resolving {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type DiffResult<T> = Result<T, DiffError>;

/// Optional flags supported by the installed `diff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffFlags {
    pub no_dereference: bool,
    pub color_never: bool,
}

impl DiffFlags {
    /// Detect supported flags from `diff --help` output.
    pub fn from_help(help: &str) -> Self {
        Self {
            no_dereference: help.contains("--no-dereference"),
            color_never: help.contains("--color"),
        }
    }
}

/// The `diff` binary plus its probed capabilities.
#[derive(Debug)]
pub struct DiffTool {
    binary: PathBuf,
    flags: OnceLock<DiffFlags>,
}

impl Default for DiffTool {
    fn default() -> Self {
        Self::new("diff")
    }
}

impl DiffTool {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            flags: OnceLock::new(),
        }
    }

    /// Flags are probed on first use and remembered.
    pub fn flags(&self) -> DiffFlags {
        *self.flags.get_or_init(|| {
            let mut cmd = Command::new(&self.binary);
            cmd.arg("--help");
            let help = match process::run_captured(&mut cmd) {
                Ok(out) => out.stdout,
                Err(e) => {
                    warn!(error = %e, "could not probe diff flags");
                    String::new()
                }
            };
            let flags = DiffFlags::from_help(&help);
            if !flags.no_dereference {
                warn!("diff does not support --no-dereference; symlinks will be followed");
            }
            if !flags.color_never {
                debug!("diff does not support --color");
            }
            flags
        })
    }

    pub fn args(flags: DiffFlags, pristine: &Path, mutated: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--unified".into(), "--new-file".into(), "--recursive".into()];
        if flags.no_dereference {
            args.push("--no-dereference".into());
        }
        if flags.color_never {
            args.push("--color=never".into());
        }
        args.push(pristine.as_os_str().to_owned());
        args.push(mutated.as_os_str().to_owned());
        args
    }

    /// Diff two trees. An empty string means no changes.
    pub fn diff(
        &self,
        pristine: &Path,
        mutated: &Path,
        cancel: Option<&CancelToken>,
    ) -> DiffResult<String> {
        let pristine = canonical(pristine)?;
        let mutated = canonical(mutated)?;

        let mut cmd = Command::new(&self.binary);
        cmd.args(Self::args(self.flags(), &pristine, &mutated));
        let output = process::run_supervised_raw(
            &mut cmd,
            Supervision {
                cancel,
                ..Supervision::default()
            },
            None,
        )?;

        match output.exit_code() {
            Some(0) => Ok(String::new()),
            Some(1) => {
                let raw = String::from_utf8(output.stdout).map_err(|e| DiffError::Encoding {
                    offset: e.utf8_error().valid_up_to(),
                })?;
                normalize(&raw, &pristine, &mutated)
            }
            code => Err(DiffError::Failed {
                code,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }
}

fn canonical(path: &Path) -> DiffResult<PathBuf> {
    path.canonicalize().map_err(|source| DiffError::Io {
        path: path.to_path_buf(),
        source,
    })
}

struct Prefixes {
    pristine: String,
    mutated: String,
}

impl Prefixes {
    fn new(pristine: &Path, mutated: &Path) -> Self {
        Self {
            pristine: format!("{}/", pristine.display()),
            mutated: format!("{}/", mutated.display()),
        }
    }

    fn strip(&self, line: &str) -> String {
        line.replace(&self.pristine, "a/").replace(&self.mutated, "b/")
    }
}

/// `--- <path>\t<timestamp>` to `--- a/<rel>` (or `/dev/null`).
fn file_header(marker: &str, rest: &str, root: &Path, prefix: &str, side: &str) -> String {
    let path = rest.split('\t').next().unwrap_or(rest);
    let Some(rel) = path.strip_prefix(prefix) else {
        return format!("{} {}", marker, path);
    };
    if root.join(rel).symlink_metadata().is_err() {
        return format!("{} /dev/null", marker);
    }
    format!("{} {}{}", marker, side, rel)
}

/// Rewrite raw `diff` output into a repository-relative patch.
pub fn normalize(raw: &str, pristine: &Path, mutated: &Path) -> DiffResult<String> {
    let prefixes = Prefixes::new(pristine, mutated);
    let mut out = String::with_capacity(raw.len());
    let mut old_left = 0usize;
    let mut new_left = 0usize;
    let mut count = 0;

    for (index, line) in raw.split_inclusive('\n').enumerate() {
        count = index + 1;
        let content = line.strip_suffix('\n').unwrap_or(line);
        let content = content.strip_suffix('\r').unwrap_or(content);
        let parse_err = || DiffError::Parse {
            line: index + 1,
            content: content.to_string(),
        };

        if old_left > 0 || new_left > 0 {
            match content.as_bytes().first() {
                Some(b' ') | None => {
                    old_left = old_left.checked_sub(1).ok_or_else(parse_err)?;
                    new_left = new_left.checked_sub(1).ok_or_else(parse_err)?;
                }
                Some(b'-') => old_left = old_left.checked_sub(1).ok_or_else(parse_err)?,
                Some(b'+') => new_left = new_left.checked_sub(1).ok_or_else(parse_err)?,
                Some(b'\\') => {}
                _ => return Err(parse_err()),
            }
            out.push_str(line);
            if !line.ends_with('\n') {
                out.push('\n');
            }
            continue;
        }

        let rewritten = if content.starts_with("@@") {
            let header = HunkHeader::parse(content).ok_or_else(parse_err)?;
            old_left = header.old_count;
            new_left = header.new_count;
            content.to_string()
        } else if let Some(rest) = content.strip_prefix("--- ") {
            file_header("---", rest, pristine, &prefixes.pristine, "a/")
        } else if let Some(rest) = content.strip_prefix("+++ ") {
            file_header("+++", rest, mutated, &prefixes.mutated, "b/")
        } else if matches!(content.as_bytes().first(), Some(b'+' | b'-' | b' ')) {
            return Err(parse_err());
        } else {
            prefixes.strip(content)
        };
        out.push_str(&rewritten);
        out.push('\n');
    }

    if old_left > 0 || new_left > 0 {
        return Err(DiffError::Parse {
            line: count,
            content: "unexpected end of hunk".to_string(),
        });
    }
    Ok(out)
}
