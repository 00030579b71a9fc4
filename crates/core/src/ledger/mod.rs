//! Audit ledger.
//!
//! Every storage operation writes a [`StorageOperationRecord`]. Mutating operations write a
//! `stream-started` record before they touch the disk and complete it exactly once when they
//! finish, so a crash leaves an in-flight record behind rather than nothing at all.
//!
//! Records are never deleted. After a record is terminal the only change allowed is flipping
//! `cleaned_up`; anything else is expressed as a new record.

mod record;
mod store;

pub use record::{OperationAction, RecordDraft, StorageOperationRecord};
pub use store::{LedgerStore, SqliteLedgerStore};

use chrono::{DateTime, Utc};
use phistore_types::{Actor, RuntimeRole, StorageClass, StoragePath};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger record not found: {0}")]
    RecordNotFound(Uuid),
    #[error("ledger record {0} already exists")]
    DuplicateRecord(Uuid),
    #[error("ledger record {id} is already terminal ({action})")]
    AlreadyTerminal { id: Uuid, action: OperationAction },
    #[error("{0} is not a terminal action")]
    NotTerminal(OperationAction),
    #[error("ledger lock poisoned")]
    Poisoned,
    #[error("ledger database failed: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("ledger record could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("ledger I/O failed on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Write path and queries over the ledger for one process.
#[derive(Clone)]
pub struct AuditLedger {
    store: Arc<dyn LedgerStore>,
    role: RuntimeRole,
    /// Serialises read-modify-write transitions so a record cannot be completed twice.
    transition: Arc<Mutex<()>>,
}

impl std::fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLedger")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

impl AuditLedger {
    pub fn new(store: Arc<dyn LedgerStore>, role: RuntimeRole) -> Self {
        Self {
            store,
            role,
            transition: Arc::new(Mutex::new(())),
        }
    }

    /// A ledger in an in-memory database. Used by the test role.
    pub fn in_memory(role: RuntimeRole) -> Result<Self, LedgerError> {
        Ok(Self::new(Arc::new(SqliteLedgerStore::in_memory()?), role))
    }

    pub fn role(&self) -> RuntimeRole {
        self.role
    }

    /// Writes a `stream-started` record ahead of the operation it describes.
    pub fn begin(&self, draft: RecordDraft) -> Result<StorageOperationRecord, LedgerError> {
        let now = Utc::now();
        let record = self.build(OperationAction::StreamStarted, draft, now, Some(now), None);
        self.store.insert(&record)?;
        Ok(record)
    }

    /// Writes a record that is terminal from the start.
    pub fn append(
        &self,
        action: OperationAction,
        draft: RecordDraft,
    ) -> Result<StorageOperationRecord, LedgerError> {
        if !action.is_terminal() {
            return Err(LedgerError::NotTerminal(action));
        }
        let record = self.build(action, draft, Utc::now(), None, None);
        self.store.insert(&record)?;
        Ok(record)
    }

    /// Moves an in-flight record to its terminal action.
    ///
    /// `extra` is merged into the record metadata. Fails with
    /// [`LedgerError::AlreadyTerminal`] if the record was already completed.
    pub fn complete(
        &self,
        id: Uuid,
        action: OperationAction,
        byte_size: Option<u64>,
        extra: BTreeMap<String, String>,
    ) -> Result<StorageOperationRecord, LedgerError> {
        if !action.is_terminal() {
            return Err(LedgerError::NotTerminal(action));
        }

        let _guard = self.transition.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut record = self.store.get(id)?.ok_or(LedgerError::RecordNotFound(id))?;
        if record.action.is_terminal() {
            return Err(LedgerError::AlreadyTerminal {
                id,
                action: record.action,
            });
        }

        record.action = action;
        record.stream_completed_at = Some(Utc::now());
        if byte_size.is_some() {
            record.byte_size = byte_size;
        }
        record.metadata.extend(extra);
        self.store.update(&record)?;
        Ok(record)
    }

    /// Flags a terminal record as removed by the reaper.
    pub fn mark_cleaned_up(&self, id: Uuid) -> Result<StorageOperationRecord, LedgerError> {
        let _guard = self.transition.lock().map_err(|_| LedgerError::Poisoned)?;
        let mut record = self.store.get(id)?.ok_or(LedgerError::RecordNotFound(id))?;
        if !record.action.is_terminal() {
            return Err(LedgerError::NotTerminal(record.action));
        }
        if !record.cleaned_up {
            record.cleaned_up = true;
            self.store.update(&record)?;
        }
        Ok(record)
    }

    /// Asks the reaper to remove `path` once `deadline` has passed.
    pub fn schedule_cleanup(
        &self,
        class: &StorageClass,
        path: &StoragePath,
        deadline: DateTime<Utc>,
        actor: Actor,
    ) -> Result<StorageOperationRecord, LedgerError> {
        self.append(
            OperationAction::CleanupScheduled,
            RecordDraft::new(actor, class.clone(), path.as_str())
                .with_cleanup_deadline(Some(deadline)),
        )
    }

    pub fn get(&self, id: Uuid) -> Result<Option<StorageOperationRecord>, LedgerError> {
        self.store.get(id)
    }

    /// All records for one key in the order they were written.
    pub fn history(
        &self,
        class: &StorageClass,
        path: &str,
    ) -> Result<Vec<StorageOperationRecord>, LedgerError> {
        self.store.history(class, path)
    }

    /// Records whose cleanup deadline has passed and that have not been cleaned up yet.
    pub fn due_for_cleanup(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<StorageOperationRecord>, LedgerError> {
        self.store.due_for_cleanup(now)
    }

    /// Whether the object at `path` is accounted for by a creation that has not since been
    /// deleted or cleaned up.
    pub fn has_live_creation(
        &self,
        class: &StorageClass,
        path: &str,
    ) -> Result<bool, LedgerError> {
        self.store.has_live_creation(class, path)
    }

    /// Whether a later creation of the same key owns the object now.
    pub fn is_superseded(&self, record: &StorageOperationRecord) -> Result<bool, LedgerError> {
        self.store
            .has_newer_creation(&record.storage_class, &record.path, record.id)
    }

    /// Whether an operation on this key started at or after `cutoff` and is still running.
    pub fn in_flight_since(
        &self,
        class: &StorageClass,
        path: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        self.store.in_flight_since(class, path, cutoff)
    }

    /// In-flight records started before `cutoff` that no upload session owns. Sessions are
    /// closed by the idle-timeout path instead.
    pub fn abandoned(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StorageOperationRecord>, LedgerError> {
        self.store.abandoned(cutoff)
    }

    fn build(
        &self,
        action: OperationAction,
        draft: RecordDraft,
        now: DateTime<Utc>,
        stream_started_at: Option<DateTime<Utc>>,
        stream_completed_at: Option<DateTime<Utc>>,
    ) -> StorageOperationRecord {
        StorageOperationRecord {
            id: Uuid::new_v4(),
            actor: draft.actor,
            action,
            storage_class: draft.storage_class,
            path: draft.path,
            byte_size: draft.byte_size,
            runtime_role: self.role,
            created_at: now,
            stream_started_at,
            stream_completed_at,
            cleanup_deadline: draft.cleanup_deadline,
            cleaned_up: false,
            metadata: draft.metadata,
        }
    }
}
