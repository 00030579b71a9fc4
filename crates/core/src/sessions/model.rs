use chrono::{DateTime, Utc};
use phistore_types::{Actor, StorageClass, StoragePath};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Initiated,
    Receiving,
    Completed,
    Aborted,
}

impl SessionStatus {
    /// Initiated and receiving sessions still accept chunks and block new sessions for the
    /// same path.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Initiated | SessionStatus::Receiving)
    }
}

/// Server-side state of one chunked upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
    pub storage_class: StorageClass,
    pub path: StoragePath,
    pub actor: Actor,
    pub expected_total_bytes: Option<u64>,
    pub bytes_received: u64,
    /// Sequence number of the last accepted chunk; `None` before the first.
    pub chunk_sequence_number: Option<u64>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub ledger_record_id: Uuid,
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl UploadSession {
    /// Sequence number the next chunk must carry. Numbering starts at zero.
    pub fn next_sequence(&self) -> u64 {
        self.chunk_sequence_number.map_or(0, |last| last + 1)
    }

    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: chrono::Duration) -> bool {
        self.status.is_active()
            && self
                .last_activity_at
                .checked_add_signed(idle_timeout)
                .is_some_and(|deadline| deadline < now)
    }

    pub(crate) fn new_id() -> String {
        Uuid::new_v4().to_string()
    }
}
