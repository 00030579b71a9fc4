use super::UploadSession;
use chrono::{DateTime, Utc};
use phistore_types::{StorageClass, StoragePath};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS upload_sessions (
    id               TEXT    PRIMARY KEY,
    storage_class    TEXT    NOT NULL,
    path             TEXT    NOT NULL,
    active           INTEGER NOT NULL,
    created_at       INTEGER NOT NULL,
    last_activity_at INTEGER NOT NULL,
    body             TEXT    NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS upload_sessions_one_active_per_key
    ON upload_sessions (storage_class, path) WHERE active = 1;
CREATE INDEX IF NOT EXISTS upload_sessions_by_activity
    ON upload_sessions (active, last_activity_at);
";

#[derive(Debug, thiserror::Error)]
pub enum SessionStoreError {
    #[error("session {existing} is already active for {path}")]
    ActiveSessionExists { existing: String, path: String },
    #[error("unknown upload session {0}")]
    UnknownSession(String),
    #[error("session store lock poisoned")]
    Poisoned,
    #[error("session database failed: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("session could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("session store I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Repository interface for upload sessions.
pub trait SessionStore: Send + Sync {
    /// Stores a new session unless an active one already targets the same class and path.
    /// The check and the insert happen in one transaction.
    fn insert_exclusive(&self, session: &UploadSession) -> Result<(), SessionStoreError>;

    fn update(&self, session: &UploadSession) -> Result<(), SessionStoreError>;

    fn get(&self, id: &str) -> Result<Option<UploadSession>, SessionStoreError>;

    /// Open sessions, oldest first.
    fn active(&self) -> Result<Vec<UploadSession>, SessionStoreError>;

    fn find_active(
        &self,
        class: &StorageClass,
        path: &StoragePath,
    ) -> Result<Option<UploadSession>, SessionStoreError>;

    /// Drops closed sessions last touched before `before`. Returns how many went.
    fn purge_closed(&self, before: DateTime<Utc>) -> Result<u64, SessionStoreError>;
}

/// Session store in a SQLite database, or in an in-memory database for the test role.
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSessionStore").finish_non_exhaustive()
    }
}

impl SqliteSessionStore {
    pub fn open(path: &Path) -> Result<Self, SessionStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| SessionStoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        let store = Self::initialize(conn)?;
        tracing::debug!(
            database = %path.display(),
            active = store.active()?.len(),
            "Opened upload session store"
        );
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, SessionStoreError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, SessionStoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, SessionStoreError> {
        self.conn.lock().map_err(|_| SessionStoreError::Poisoned)
    }
}

fn decode(body: &str) -> Result<UploadSession, SessionStoreError> {
    Ok(serde_json::from_str(body)?)
}

impl SessionStore for SqliteSessionStore {
    fn insert_exclusive(&self, session: &UploadSession) -> Result<(), SessionStoreError> {
        let body = serde_json::to_string(session)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM upload_sessions
                  WHERE storage_class = ?1 AND path = ?2 AND active = 1",
                params![session.storage_class.as_str(), session.path.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            return Err(SessionStoreError::ActiveSessionExists {
                existing,
                path: session.path.to_string(),
            });
        }

        tx.execute(
            "INSERT INTO upload_sessions
                (id, storage_class, path, active, created_at, last_activity_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                session.id,
                session.storage_class.as_str(),
                session.path.as_str(),
                session.status.is_active(),
                session.created_at.timestamp_micros(),
                session.last_activity_at.timestamp_micros(),
                body,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn update(&self, session: &UploadSession) -> Result<(), SessionStoreError> {
        let body = serde_json::to_string(session)?;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE upload_sessions
                SET active = ?2, last_activity_at = ?3, body = ?4
              WHERE id = ?1",
            params![
                session.id,
                session.status.is_active(),
                session.last_activity_at.timestamp_micros(),
                body,
            ],
        )?;
        if changed == 0 {
            return Err(SessionStoreError::UnknownSession(session.id.clone()));
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<UploadSession>, SessionStoreError> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM upload_sessions WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        body.as_deref().map(decode).transpose()
    }

    fn active(&self) -> Result<Vec<UploadSession>, SessionStoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT body FROM upload_sessions WHERE active = 1 ORDER BY created_at",
        )?;
        let bodies = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        bodies.iter().map(|body| decode(body)).collect()
    }

    fn find_active(
        &self,
        class: &StorageClass,
        path: &StoragePath,
    ) -> Result<Option<UploadSession>, SessionStoreError> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM upload_sessions
                  WHERE storage_class = ?1 AND path = ?2 AND active = 1",
                params![class.as_str(), path.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        body.as_deref().map(decode).transpose()
    }

    fn purge_closed(&self, before: DateTime<Utc>) -> Result<u64, SessionStoreError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM upload_sessions WHERE active = 0 AND last_activity_at < ?1",
            params![before.timestamp_micros()],
        )?;
        Ok(removed as u64)
    }
}
