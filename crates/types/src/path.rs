//! Logical storage keys.
//!
//! A [`StoragePath`] names an object inside a storage class, never a location on the local
//! filesystem. Its syntax is deliberately narrow so that joining it onto a class root can
//! never leave that root:
//!
//! - `/`-separated, non-empty segments (`workspace/job-42/input.csv` style)
//! - no leading `/`, no `.` or `..` segments (rejected as traversal)
//! - no backslashes or NUL bytes
//! - no segment starting with `.`; dot-names are reserved for in-flight temp and partial files
//!
//! A [`StoragePrefix`] follows the same rules but may be empty, meaning "the whole class".

use std::fmt;
use std::path::{Path, PathBuf};

/// Longest accepted logical path, in bytes.
pub const MAX_PATH_LEN: usize = 1024;

/// Reasons a logical path is rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path cannot be empty")]
    Empty,
    #[error("path exceeds {MAX_PATH_LEN} bytes")]
    TooLong,
    #[error("path escapes the storage root: {0}")]
    Traversal(String),
    #[error("invalid path: {0}")]
    Invalid(String),
    #[error("path segment is reserved: {0}")]
    Reserved(String),
}

impl PathError {
    pub fn is_traversal(&self) -> bool {
        matches!(self, PathError::Traversal(_))
    }
}

fn validate_segments(raw: &str) -> Result<(), PathError> {
    if raw.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong);
    }
    if raw.contains('\0') || raw.contains('\\') {
        return Err(PathError::Invalid(raw.to_owned()));
    }
    if raw.starts_with('/') {
        return Err(PathError::Traversal(raw.to_owned()));
    }

    for segment in raw.split('/') {
        match segment {
            "" => return Err(PathError::Invalid(raw.to_owned())),
            "." | ".." => return Err(PathError::Traversal(raw.to_owned())),
            s if s.starts_with('.') => return Err(PathError::Reserved(s.to_owned())),
            _ => {}
        }
    }

    Ok(())
}

/// A validated, non-empty logical storage key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoragePath(String);

impl StoragePath {
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, PathError> {
        let raw = raw.as_ref();
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        validate_segments(raw)?;
        Ok(Self(raw.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// The final segment.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Joins this key onto `root` segment by segment.
    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        self.segments().fold(root.to_path_buf(), |acc, s| acc.join(s))
    }

    /// True when this path lies under `prefix`, compared segment-wise so `job-4` does not
    /// match `job-42/...`.
    pub fn has_prefix(&self, prefix: &StoragePrefix) -> bool {
        if prefix.is_root() {
            return true;
        }
        let p = prefix.as_str();
        self.0 == p || (self.0.starts_with(p) && self.0.as_bytes().get(p.len()) == Some(&b'/'))
    }
}

impl fmt::Display for StoragePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StoragePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for StoragePath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for StoragePath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for StoragePath {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A validated logical prefix. The empty prefix addresses the whole storage class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct StoragePrefix(String);

impl StoragePrefix {
    /// Parses a prefix; a single trailing `/` is accepted and dropped.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, PathError> {
        let raw = raw.as_ref();
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        if trimmed.is_empty() {
            if raw.is_empty() {
                return Ok(Self::root());
            }
            // A bare "/" is an absolute path, not the class root.
            return Err(PathError::Traversal(raw.to_owned()));
        }
        validate_segments(trimmed)?;
        Ok(Self(trimmed.to_owned()))
    }

    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_fs_path(&self, root: &Path) -> PathBuf {
        if self.is_root() {
            return root.to_path_buf();
        }
        self.0.split('/').fold(root.to_path_buf(), |acc, s| acc.join(s))
    }
}

impl fmt::Display for StoragePrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<StoragePath> for StoragePrefix {
    fn from(path: StoragePath) -> Self {
        Self(path.0)
    }
}

impl serde::Serialize for StoragePrefix {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for StoragePrefix {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
