//! PHI Store Disk Layer
//!
//! This crate owns every byte PHI Store writes to disk. Nothing else in the workspace opens,
//! renames or removes files under a storage root directly.
//!
//! ## Design Principles
//!
//! - One [`DiskStore`] per storage class, rooted at that class's mount directory
//! - Logical keys ([`phistore_types::StoragePath`]) are joined segment by segment and the
//!   result is re-checked against the canonical root, so symlinks cannot escape it
//! - Writes land in a hidden sibling temp file and are renamed into place, so readers never
//!   observe a partial object
//! - Dot-prefixed names are internal (temp files, upload partials, health markers) and are
//!   never listed
//!
//! ## Layout
//!
//! ```text
//! <class root>/
//! ├── .uploads/                 # partial files of chunked upload sessions
//! │   └── <session-id>.part
//! └── job-42/
//!     ├── .input.csv.<uuid>.tmp # in-flight save, renamed on commit
//!     └── input.csv
//! ```
//!
//! The API is synchronous; async callers run it on a blocking pool.

mod constants;
mod digest;
mod disk;

pub use constants::{PARTIAL_SUFFIX, TEMP_SUFFIX, UPLOADS_DIR_NAME};
pub use digest::{detect_media_type, ContentDigest};
pub use disk::DiskStore;

/// Errors that can occur during disk operations
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// Root directory could not be created or is not a directory
    #[error("Invalid root directory: {0}")]
    InvalidRootDirectory(String),

    /// A resolved path would fall outside the root directory
    #[error("Path escapes storage root: {0}")]
    PathTraversal(String),

    /// The target does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation is not valid for the target (for example deleting a directory as a file)
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// I/O error with the path it happened on
    #[error("I/O error on {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl DiskError {
    pub(crate) fn io(context: impl std::fmt::Display, source: std::io::Error) -> Self {
        DiskError::Io {
            context: context.to_string(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DiskError::NotFound(_))
    }
}

pub type DiskResult<T> = Result<T, DiskError>;
