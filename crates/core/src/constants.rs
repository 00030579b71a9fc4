//! Constants used throughout the PHI Store core crate.
//!
//! Defaults for every tunable, ledger metadata keys and database file names live here so the
//! config loader, drivers and reaper agree on them.

use std::time::Duration;

/// Default root for the submission class when no directory is configured.
pub const DEFAULT_SUBMISSION_DIR: &str = "storage_data/submission";

/// Default root for the workspace class when no directory is configured.
pub const DEFAULT_WORKSPACE_DIR: &str = "storage_data/workspace";

/// Default directory holding the ledger and session databases.
pub const DEFAULT_LEDGER_DIR: &str = "storage_data/ledger";

/// SQLite file of the audit ledger inside the ledger directory.
pub const LEDGER_DB_FILENAME: &str = "operations.sqlite3";

/// SQLite file of the upload sessions inside the ledger directory.
pub const SESSION_DB_FILENAME: &str = "upload-sessions.sqlite3";

/// Payloads at or below this size are sent to the storage owner in one request.
pub const DEFAULT_CHUNK_THRESHOLD_BYTES: usize = 10 * 1024 * 1024;

pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 1024 * 1024;

/// Buffer size used when streaming a stored object back to a caller.
pub const READ_BUFFER_BYTES: usize = 64 * 1024;

pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(600);
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(3600);
pub const DEFAULT_CLEANUP_AFTER: Duration = Duration::from_secs(86_400);
pub const DEFAULT_ABANDONED_AFTER: Duration = Duration::from_secs(86_400);

/// Completed and aborted sessions are kept this long for diagnostics, then purged by the reaper.
pub const CLOSED_SESSION_RETENTION: Duration = Duration::from_secs(7 * 86_400);

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_IN_FLIGHT: usize = 16;
pub const DEFAULT_POOL_IDLE_PER_HOST: usize = 8;

/// Upper bound on a single request body accepted by the storage service.
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 64 * 1024 * 1024;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";

/// Ledger metadata keys.
pub mod meta {
    pub const SESSION_ID: &str = "session-id";
    pub const ERROR: &str = "error";
    pub const REASON: &str = "reason";
    pub const SHA256: &str = "sha256";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DETECTED_MEDIA_TYPE: &str = "detected-media-type";
    pub const EXISTED: &str = "existed";
    pub const COUNT: &str = "count";
    pub const SOURCE_RECORD: &str = "source-record";
    pub const ABORTED_BY: &str = "aborted-by";
}

/// Values recorded under [`meta::REASON`].
pub mod reason {
    pub const ABANDONED: &str = "abandoned";
    pub const IDLE_TIMEOUT: &str = "idle-timeout";
    pub const CALLER_ABORT: &str = "caller-abort";
    pub const ORPHAN: &str = "orphan";
    pub const DEADLINE: &str = "cleanup-deadline";
}
