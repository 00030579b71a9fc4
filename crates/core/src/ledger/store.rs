//! Record stores behind the audit ledger.
//!
//! Records live in one SQLite table. The columns the queries filter on are kept next to the
//! full record, which is stored as JSON, so the reaper's per-path questions hit an index
//! instead of walking the whole history.

use super::{LedgerError, OperationAction, StorageOperationRecord};
use crate::constants::meta;
use chrono::{DateTime, Utc};
use phistore_types::StorageClass;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS operations (
    seq               INTEGER PRIMARY KEY AUTOINCREMENT,
    id                TEXT    NOT NULL UNIQUE,
    storage_class     TEXT    NOT NULL,
    path              TEXT    NOT NULL,
    action            TEXT    NOT NULL,
    session_owned     INTEGER NOT NULL,
    stream_started_at INTEGER,
    cleanup_deadline  INTEGER,
    cleaned_up        INTEGER NOT NULL DEFAULT 0,
    body              TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS operations_by_key ON operations (storage_class, path, seq);
CREATE INDEX IF NOT EXISTS operations_by_action ON operations (action, stream_started_at);
CREATE INDEX IF NOT EXISTS operations_by_deadline ON operations (cleaned_up, cleanup_deadline);
";

/// Repository interface for ledger records.
///
/// Implementations serialise their own writes. Every query returns records in the order they
/// were inserted.
pub trait LedgerStore: Send + Sync {
    fn insert(&self, record: &StorageOperationRecord) -> Result<(), LedgerError>;

    /// Replaces the stored record with the same id.
    fn update(&self, record: &StorageOperationRecord) -> Result<(), LedgerError>;

    fn get(&self, id: Uuid) -> Result<Option<StorageOperationRecord>, LedgerError>;

    fn history(
        &self,
        class: &StorageClass,
        path: &str,
    ) -> Result<Vec<StorageOperationRecord>, LedgerError>;

    /// `created` and `cleanup-scheduled` records past their deadline and not yet cleaned up.
    fn due_for_cleanup(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StorageOperationRecord>, LedgerError>;

    /// In-flight records started before `cutoff` that no upload session owns.
    fn abandoned(&self, cutoff: DateTime<Utc>)
        -> Result<Vec<StorageOperationRecord>, LedgerError>;

    fn in_flight_since(
        &self,
        class: &StorageClass,
        path: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Whether the bytes at `path` belong to a `created` record that nothing removed since:
    /// no later `deleted` or `cleanup-completed` record for the path, no later prefix delete
    /// covering it, and not flagged `cleaned_up`.
    fn has_live_creation(&self, class: &StorageClass, path: &str) -> Result<bool, LedgerError>;

    /// Whether a `created` record for the same key was written after `record_id` and still
    /// owns the object.
    fn has_newer_creation(
        &self,
        class: &StorageClass,
        path: &str,
        record_id: Uuid,
    ) -> Result<bool, LedgerError>;
}

/// Ledger store in a SQLite database, or in an in-memory database for the test role.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteLedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedgerStore").finish_non_exhaustive()
    }
}

impl SqliteLedgerStore {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LedgerError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::initialize(conn)
    }

    /// A store that forgets everything when dropped.
    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA_SQL)?;
        let records: i64 = conn.query_row("SELECT COUNT(*) FROM operations", [], |row| row.get(0))?;
        tracing::debug!(records, "Opened audit ledger store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }

    fn query_records(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<StorageOperationRecord>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        let bodies = stmt
            .query_map(params, |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies.iter().map(|body| decode(body)).collect()
    }

    fn query_flag(&self, sql: &str, params: impl rusqlite::Params) -> Result<bool, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(sql)?;
        Ok(stmt.query_row(params, |row| row.get::<_, bool>(0))?)
    }
}

fn micros(at: DateTime<Utc>) -> i64 {
    at.timestamp_micros()
}

fn decode(body: &str) -> Result<StorageOperationRecord, LedgerError> {
    Ok(serde_json::from_str(body)?)
}

impl LedgerStore for SqliteLedgerStore {
    fn insert(&self, record: &StorageOperationRecord) -> Result<(), LedgerError> {
        let body = serde_json::to_string(record)?;
        let conn = self.lock()?;
        let inserted = conn.execute(
            "INSERT INTO operations
                (id, storage_class, path, action, session_owned, stream_started_at,
                 cleanup_deadline, cleaned_up, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id.to_string(),
                record.storage_class.as_str(),
                record.path,
                record.action.as_str(),
                record.metadata.contains_key(meta::SESSION_ID),
                record.stream_started_at.map(micros),
                record.cleanup_deadline.map(micros),
                record.cleaned_up,
                body,
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(LedgerError::DuplicateRecord(record.id))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn update(&self, record: &StorageOperationRecord) -> Result<(), LedgerError> {
        let body = serde_json::to_string(record)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE operations
                SET action = ?2, cleanup_deadline = ?3, cleaned_up = ?4, body = ?5
              WHERE id = ?1",
            params![
                record.id.to_string(),
                record.action.as_str(),
                record.cleanup_deadline.map(micros),
                record.cleaned_up,
                body,
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::RecordNotFound(record.id));
        }
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<StorageOperationRecord>, LedgerError> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM operations WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        body.as_deref().map(decode).transpose()
    }

    fn history(
        &self,
        class: &StorageClass,
        path: &str,
    ) -> Result<Vec<StorageOperationRecord>, LedgerError> {
        self.query_records(
            "SELECT body FROM operations
              WHERE storage_class = ?1 AND path = ?2
              ORDER BY seq",
            params![class.as_str(), path],
        )
    }

    fn due_for_cleanup(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StorageOperationRecord>, LedgerError> {
        self.query_records(
            "SELECT body FROM operations
              WHERE cleaned_up = 0
                AND cleanup_deadline < ?1
                AND action IN (?2, ?3)
              ORDER BY seq",
            params![
                micros(now),
                OperationAction::Created.as_str(),
                OperationAction::CleanupScheduled.as_str(),
            ],
        )
    }

    fn abandoned(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StorageOperationRecord>, LedgerError> {
        self.query_records(
            "SELECT body FROM operations
              WHERE action = ?1 AND session_owned = 0 AND stream_started_at < ?2
              ORDER BY seq",
            params![OperationAction::StreamStarted.as_str(), micros(cutoff)],
        )
    }

    fn in_flight_since(
        &self,
        class: &StorageClass,
        path: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.query_flag(
            "SELECT EXISTS (
                SELECT 1 FROM operations
                 WHERE storage_class = ?1 AND path = ?2 AND action = ?3
                   AND stream_started_at >= ?4)",
            params![
                class.as_str(),
                path,
                OperationAction::StreamStarted.as_str(),
                micros(cutoff),
            ],
        )
    }

    fn has_live_creation(&self, class: &StorageClass, path: &str) -> Result<bool, LedgerError> {
        self.query_flag(
            "SELECT EXISTS (
                SELECT 1 FROM operations c
                 WHERE c.storage_class = ?1 AND c.path = ?2
                   AND c.action = ?3 AND c.cleaned_up = 0
                   AND NOT EXISTS (
                       SELECT 1 FROM operations d
                        WHERE d.storage_class = ?1 AND d.seq > c.seq
                          AND ((d.path = ?2 AND d.action IN (?4, ?5))
                               OR (d.action = ?4
                                   AND substr(?2, 1, length(d.path) + 1) = d.path || '/'))))",
            params![
                class.as_str(),
                path,
                OperationAction::Created.as_str(),
                OperationAction::Deleted.as_str(),
                OperationAction::CleanupCompleted.as_str(),
            ],
        )
    }

    fn has_newer_creation(
        &self,
        class: &StorageClass,
        path: &str,
        record_id: Uuid,
    ) -> Result<bool, LedgerError> {
        self.query_flag(
            "SELECT EXISTS (
                SELECT 1 FROM operations
                 WHERE storage_class = ?1 AND path = ?2 AND action = ?3 AND cleaned_up = 0
                   AND seq > (SELECT seq FROM operations WHERE id = ?4))",
            params![
                class.as_str(),
                path,
                OperationAction::Created.as_str(),
                record_id.to_string(),
            ],
        )
    }
}
