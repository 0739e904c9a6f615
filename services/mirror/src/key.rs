//! Cache-safe encoding of bucket keys.
//!
//! Every cached object is stored on disk under its *formatted key*: the bucket
//! key with each `/` replaced by [`SENTINEL`]. The encoding is only bijective
//! for keys that never contain the sentinel, so such keys are rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Character substituted for path separators in formatted keys
pub const SENTINEL: char = '@';

/// Errors raised while encoding a bucket key
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("Bucket key {0:?} contains the reserved character '@'")]
    ContainsSentinel(String),

    #[error("Bucket key is empty")]
    Empty,
}

/// Flattened, disk-safe form of a bucket key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormattedKey(String);

impl FormattedKey {
    /// Encode a bucket key, refusing keys that would not decode back
    pub fn encode(s3_key: &str) -> Result<Self, KeyError> {
        if s3_key.is_empty() {
            return Err(KeyError::Empty);
        }
        if s3_key.contains(SENTINEL) {
            return Err(KeyError::ContainsSentinel(s3_key.to_string()));
        }

        Ok(Self(s3_key.replace('/', "@")))
    }

    /// Wrap an already formatted value (file names read back from disk, URL segments)
    pub fn from_formatted(formatted: impl Into<String>) -> Self {
        Self(formatted.into())
    }

    /// Decode back to the bucket key
    pub fn decode(&self) -> String {
        self.0.replace(SENTINEL, "/")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Formatted directory part, including the trailing sentinel
    ///
    /// `a@b@preview.jpg` -> `a@b@`; keys without a directory yield an empty string.
    pub fn dir_prefix(&self) -> &str {
        match self.0.rfind(SENTINEL) {
            Some(idx) => &self.0[..=idx],
            None => "",
        }
    }
}

impl fmt::Display for FormattedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FormattedKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Directory of a bucket key (everything before the last `/`)
pub fn parent_dir(s3_key: &str) -> Option<&str> {
    s3_key.rfind('/').map(|idx| &s3_key[..idx])
}

/// Last path component of a bucket key
pub fn file_name(s3_key: &str) -> &str {
    match s3_key.rfind('/') {
        Some(idx) => &s3_key[idx + 1..],
        None => s3_key,
    }
}
