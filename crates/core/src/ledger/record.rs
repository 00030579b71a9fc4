use chrono::{DateTime, Utc};
use phistore_types::{Actor, RuntimeRole, StorageClass};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// What a ledger record says happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationAction {
    Created,
    Read,
    Deleted,
    StreamStarted,
    StreamCompleted,
    StreamFailed,
    CleanupScheduled,
    CleanupCompleted,
    CleanupFailed,
}

impl OperationAction {
    /// `stream-started` is the only action a record can move on from.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationAction::StreamStarted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationAction::Created => "created",
            OperationAction::Read => "read",
            OperationAction::Deleted => "deleted",
            OperationAction::StreamStarted => "stream-started",
            OperationAction::StreamCompleted => "stream-completed",
            OperationAction::StreamFailed => "stream-failed",
            OperationAction::CleanupScheduled => "cleanup-scheduled",
            OperationAction::CleanupCompleted => "cleanup-completed",
            OperationAction::CleanupFailed => "cleanup-failed",
        }
    }
}

impl fmt::Display for OperationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit ledger entry.
///
/// `path` is a logical object key, or a prefix for aggregate `delete-prefix` records, so it
/// is kept as plain text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageOperationRecord {
    pub id: Uuid,
    pub actor: Actor,
    pub action: OperationAction,
    pub storage_class: StorageClass,
    pub path: String,
    pub byte_size: Option<u64>,
    pub runtime_role: RuntimeRole,
    pub created_at: DateTime<Utc>,
    pub stream_started_at: Option<DateTime<Utc>>,
    pub stream_completed_at: Option<DateTime<Utc>>,
    pub cleanup_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cleaned_up: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl StorageOperationRecord {
    pub fn is_in_flight(&self) -> bool {
        !self.action.is_terminal()
    }
}

/// The caller-supplied part of a new record. The ledger fills in id, role and timestamps.
#[derive(Debug, Clone)]
pub struct RecordDraft {
    pub actor: Actor,
    pub storage_class: StorageClass,
    pub path: String,
    pub byte_size: Option<u64>,
    pub cleanup_deadline: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
}

impl RecordDraft {
    pub fn new(actor: Actor, storage_class: StorageClass, path: impl Into<String>) -> Self {
        Self {
            actor,
            storage_class,
            path: path.into(),
            byte_size: None,
            cleanup_deadline: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn with_entry(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_byte_size(mut self, byte_size: u64) -> Self {
        self.byte_size = Some(byte_size);
        self
    }

    pub fn with_cleanup_deadline(mut self, deadline: Option<DateTime<Utc>>) -> Self {
        self.cleanup_deadline = deadline;
        self
    }
}
