//! Repository snapshot archives.
//!
//! A snapshot is an uncompressed tar of the repository tree at a revision.
//! It is either downloaded from the code host's raw endpoint or read from a
//! local store directory laid out as `<store>/<repo name>@<rev>.tar`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::{WorkspaceError, WorkspaceResult};
use crate::task::Repository;

/// Response header carrying the commit the archive was produced from.
pub const COMMIT_HEADER: &str = "X-Commit";

/// Where snapshot archives come from.
#[derive(Debug, Clone)]
pub enum ArchiveSource {
    Remote {
        endpoint: String,
        token: Option<String>,
        client: reqwest::blocking::Client,
    },
    Store(PathBuf),
}

impl ArchiveSource {
    pub fn remote(endpoint: &str, token: Option<String>) -> WorkspaceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(None)
            .build()
            .map_err(|e| WorkspaceError::Fetch {
                repository: String::new(),
                message: e.to_string(),
            })?;
        Ok(ArchiveSource::Remote {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn store(dir: impl Into<PathBuf>) -> Self {
        ArchiveSource::Store(dir.into())
    }

    /// Path of a repository's archive inside a local store.
    pub fn store_path(dir: &Path, repository: &Repository) -> PathBuf {
        dir.join(format!("{}@{}.tar", repository.name, repository.rev))
    }

    /// Fetch the archive for `repository` into `dest` (a file path).
    ///
    /// Returns the revision the archive was produced from, which differs
    /// from `repository.rev` when the remote resolved a moving reference.
    pub fn fetch(&self, repository: &Repository, dest: &Path) -> WorkspaceResult<String> {
        match self {
            ArchiveSource::Store(dir) => {
                let src = Self::store_path(dir, repository);
                debug!(repository = %repository, archive = %src.display(), "copying archive from store");
                fs::copy(&src, dest).map_err(|source| WorkspaceError::Fetch {
                    repository: repository.to_string(),
                    message: format!("{}: {}", src.display(), source),
                })?;
                Ok(repository.rev.clone())
            }
            ArchiveSource::Remote {
                endpoint,
                token,
                client,
            } => {
                let url = format!("{}/{}@{}/-/raw", endpoint, repository.name, repository.rev);
                debug!(repository = %repository, url = %url, "downloading archive");

                let mut request = client.get(&url).header("Accept", "application/x-tar");
                if let Some(token) = token {
                    request = request.header("Authorization", format!("token {}", token));
                }
                let fetch_err = |message: String| WorkspaceError::Fetch {
                    repository: repository.to_string(),
                    message,
                };

                let mut response = request.send().map_err(|e| fetch_err(e.to_string()))?;
                if !response.status().is_success() {
                    return Err(fetch_err(format!("{} returned {}", url, response.status())));
                }
                let materialized = response
                    .headers()
                    .get(COMMIT_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .unwrap_or_else(|| repository.rev.clone());

                let mut file = File::create(dest).map_err(|source| WorkspaceError::Io {
                    path: dest.to_path_buf(),
                    source,
                })?;
                response
                    .copy_to(&mut file)
                    .map_err(|e| fetch_err(e.to_string()))?;
                Ok(materialized)
            }
        }
    }
}

/// Extract a tar archive into `dest`, which must exist.
pub fn extract(archive: &Path, dest: &Path) -> WorkspaceResult<()> {
    let extract_err = |source: io::Error| WorkspaceError::Extract {
        archive: archive.to_path_buf(),
        source,
    };
    let file = File::open(archive).map_err(extract_err)?;

    let mut tar = tar::Archive::new(file);
    tar.set_preserve_permissions(true);
    tar.set_overwrite(true);
    tar.unpack(dest).map_err(extract_err)
}
