//! Content-addressed cache keys.
//!
//! key = base64url(SHA-256(JCS({repository, steps}))[..16])
//!
//! JCS (RFC 8785) sorts object members, so the key does not depend on map
//! iteration order or on the field order of the serialized structs.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use step_spec::Step;
use thiserror::Error;

use super::{Repository, Task};

/// Number of digest bytes kept in a key.
const KEY_BYTES: usize = 16;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("canonical serialization failed: {0}")]
    Canonicalize(String),
}

#[derive(Serialize)]
struct KeyInputs<'a> {
    repository: &'a Repository,
    steps: &'a [Step],
}

/// Fingerprint of a repository at a revision plus its ordered steps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(repository: &Repository, steps: &[Step]) -> Result<Self, KeyError> {
        let inputs = KeyInputs { repository, steps };
        let jcs_bytes = serde_json_canonicalizer::to_vec(&inputs)
            .map_err(|e| KeyError::Canonicalize(e.to_string()))?;
        Ok(Self(short_digest(&jcs_bytes)))
    }

    pub fn for_task(task: &Task) -> Result<Self, KeyError> {
        Self::compute(&task.repository, &task.steps)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the cache file holding this key's result.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SHA-256 of `data`, truncated and URL-safe base64 encoded (no padding).
pub fn short_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let digest = hasher.finalize();
    URL_SAFE_NO_PAD.encode(&digest[..KEY_BYTES])
}
