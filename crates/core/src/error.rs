use crate::ledger::LedgerError;
use crate::sessions::SessionStoreError;
use phistore_files::DiskError;
use phistore_types::{IdentError, PathError};

/// Every failure a storage driver or the storage manager can report.
///
/// Raw OS errors never reach callers; disk failures are folded into `WriteError` or
/// `NotFound` with a human-readable message.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("write failed: {0}")]
    WriteError(String),
    #[error("authentication failed: {0}")]
    AuthenticationError(String),
    #[error("storage service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("out-of-order chunk: expected sequence {expected}, received {received}")]
    OutOfOrderChunk { expected: u64, received: u64 },
    #[error("an upload session is already active for {0}")]
    SessionConflict(String),
    #[error("upload session not found or closed: {0}")]
    SessionNotFound(String),
    #[error("path rejected: {0}")]
    PathTraversalRejected(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("audit ledger write failed: {0}")]
    Audit(#[from] LedgerError),
    #[error("session store failed: {0}")]
    SessionStore(#[source] SessionStoreError),
}

impl StorageError {
    /// Short stable code recorded in ledger metadata when an operation fails.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::NotFound(_) => "not-found",
            StorageError::WriteError(_) => "write-error",
            StorageError::AuthenticationError(_) => "auth-error",
            StorageError::ServiceUnavailable(_) => "service-unavailable",
            StorageError::OutOfOrderChunk { .. } => "out-of-order-chunk",
            StorageError::SessionConflict(_) => "session-conflict",
            StorageError::SessionNotFound(_) => "session-not-found",
            StorageError::PathTraversalRejected(_) => "path-rejected",
            StorageError::InvalidInput(_) => "bad-request",
            StorageError::Config(_) => "config",
            StorageError::Audit(_) => "audit",
            StorageError::SessionStore(_) => "session-store",
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<PathError> for StorageError {
    fn from(err: PathError) -> Self {
        if err.is_traversal() {
            StorageError::PathTraversalRejected(err.to_string())
        } else {
            StorageError::InvalidInput(err.to_string())
        }
    }
}

impl From<SessionStoreError> for StorageError {
    fn from(err: SessionStoreError) -> Self {
        match err {
            SessionStoreError::ActiveSessionExists { path, .. } => {
                StorageError::SessionConflict(path)
            }
            SessionStoreError::UnknownSession(id) => StorageError::SessionNotFound(id),
            other => StorageError::SessionStore(other),
        }
    }
}

impl From<IdentError> for StorageError {
    fn from(err: IdentError) -> Self {
        StorageError::InvalidInput(err.to_string())
    }
}

impl From<DiskError> for StorageError {
    fn from(err: DiskError) -> Self {
        match err {
            DiskError::NotFound(what) => StorageError::NotFound(what),
            DiskError::PathTraversal(what) => StorageError::PathTraversalRejected(what),
            DiskError::InvalidTarget(what) => StorageError::InvalidInput(what),
            DiskError::InvalidRootDirectory(what) => StorageError::Config(what),
            io @ DiskError::Io { .. } => StorageError::WriteError(io.to_string()),
        }
    }
}
