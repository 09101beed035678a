//! Patch statistics.
//!
//! Counting follows the usual diffstat convention for "changed" lines: in a
//! run of removals immediately followed by additions, `min(removed, added)`
//! lines count as changed and the rest as plain additions or deletions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Width of the `+~-` bar.
pub const BAR_WIDTH: usize = 30;

/// Line counts from a `@@ -l,s +l,s @@` hunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HunkHeader {
    pub old_count: usize,
    pub new_count: usize,
}

impl HunkHeader {
    pub fn parse(line: &str) -> Option<Self> {
        let body = line.strip_prefix("@@ ")?;
        let end = body.find(" @@")?;
        let mut ranges = body[..end].split(' ');
        let old = ranges.next()?.strip_prefix('-')?;
        let new = ranges.next()?.strip_prefix('+')?;
        if ranges.next().is_some() {
            return None;
        }
        Some(Self {
            old_count: range_count(old)?,
            new_count: range_count(new)?,
        })
    }
}

fn range_count(range: &str) -> Option<usize> {
    match range.split_once(',') {
        Some((start, count)) => {
            start.parse::<usize>().ok()?;
            count.parse().ok()
        }
        None => {
            range.parse::<usize>().ok()?;
            Some(1)
        }
    }
}

/// Counts for one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub path: String,
    pub added: usize,
    pub changed: usize,
    pub deleted: usize,
}

impl FileStat {
    fn flush(&mut self, removed: &mut usize, added: &mut usize) {
        let changed = (*removed).min(*added);
        self.changed += changed;
        self.added += *added - changed;
        self.deleted += *removed - changed;
        *removed = 0;
        *added = 0;
    }
}

/// Totals over a whole patch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStat {
    pub files: Vec<FileStat>,
    pub added: usize,
    pub changed: usize,
    pub deleted: usize,
}

impl DiffStat {
    /// Compute statistics for a normalized patch.
    pub fn from_patch(patch: &str) -> Self {
        let mut files: Vec<FileStat> = Vec::new();
        let mut old_left = 0usize;
        let mut new_left = 0usize;
        let mut removed = 0usize;
        let mut added = 0usize;
        let mut pending_old_path: Option<String> = None;

        for line in patch.lines() {
            if old_left > 0 || new_left > 0 {
                let Some(file) = files.last_mut() else {
                    break;
                };
                match line.as_bytes().first() {
                    Some(b'-') => {
                        if added > 0 {
                            file.flush(&mut removed, &mut added);
                        }
                        removed += 1;
                        old_left = old_left.saturating_sub(1);
                    }
                    Some(b'+') => {
                        added += 1;
                        new_left = new_left.saturating_sub(1);
                    }
                    Some(b'\\') => {}
                    _ => {
                        file.flush(&mut removed, &mut added);
                        old_left = old_left.saturating_sub(1);
                        new_left = new_left.saturating_sub(1);
                    }
                }
                if old_left == 0 && new_left == 0 {
                    file.flush(&mut removed, &mut added);
                }
                continue;
            }

            if let Some(path) = line.strip_prefix("--- ") {
                pending_old_path = Some(path.strip_prefix("a/").unwrap_or(path).to_string());
            } else if let Some(path) = line.strip_prefix("+++ ") {
                let path = match path.strip_prefix("b/") {
                    Some(rel) => rel.to_string(),
                    None => pending_old_path.take().unwrap_or_else(|| path.to_string()),
                };
                files.push(FileStat {
                    path,
                    ..FileStat::default()
                });
            } else if let Some(header) = HunkHeader::parse(line) {
                old_left = header.old_count;
                new_left = header.new_count;
            }
        }

        let (added, changed, deleted) = files.iter().fold((0, 0, 0), |(a, c, d), f| {
            (a + f.added, c + f.changed, d + f.deleted)
        });
        Self {
            files,
            added,
            changed,
            deleted,
        }
    }

    pub fn total(&self) -> usize {
        self.added + self.changed + self.deleted
    }

    /// Proportional `+~-` bar at most `width` characters wide.
    pub fn bar(&self, width: usize) -> String {
        let total = self.total();
        let counts = [self.added, self.changed, self.deleted];
        let mut scaled = if total <= width {
            counts
        } else {
            counts.map(|n| if n == 0 { 0 } else { (n * width / total).max(1) })
        };
        while scaled.iter().sum::<usize>() > width {
            if let Some(max) = scaled.iter_mut().max() {
                *max -= 1;
            }
        }
        format!(
            "{}{}{}",
            "+".repeat(scaled[0]),
            "~".repeat(scaled[1]),
            "-".repeat(scaled[2])
        )
    }
}

impl fmt::Display for DiffStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} file(s), {} added, {} changed, {} deleted {}",
            self.files.len(),
            self.added,
            self.changed,
            self.deleted,
            self.bar(BAR_WIDTH)
        )
    }
}
