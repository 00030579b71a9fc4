//! Chunked upload sessions on the storage-owner side.
//!
//! A session moves `initiated -> receiving -> completed | aborted`. Chunks are numbered from
//! zero and must arrive strictly in order; anything else is rejected without changing state,
//! so a client that lost track can resume from the `expected` value in the error.
//!
//! Bytes accumulate in `<class root>/.uploads/<session id>.part` and are renamed into place
//! only when the session completes. The session's ledger record is written when the session
//! opens and completed when it closes, either way.

mod model;
mod store;

pub use model::{SessionStatus, UploadSession};
pub use store::{SessionStore, SessionStoreError, SqliteSessionStore};

use crate::constants::{meta, reason};
use crate::driver::{ChunkReceipt, CompletedUpload, OperationContext};
use crate::ledger::{AuditLedger, OperationAction, RecordDraft};
use crate::{blocking, StorageError, StorageResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use phistore_files::DiskStore;
use phistore_types::{Actor, StorageClass, StoragePath};
use std::collections::{BTreeMap, HashMap};
use std::io::SeekFrom;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// Parameters for opening a session.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub storage_class: StorageClass,
    pub path: StoragePath,
    pub actor: Actor,
    pub expected_total_bytes: Option<u64>,
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
    pub cleanup_deadline: Option<DateTime<Utc>>,
}

/// Owns every upload session of one process.
pub struct UploadSessionTracker {
    store: Arc<dyn SessionStore>,
    ledger: Arc<AuditLedger>,
    idle_timeout: chrono::Duration,
    /// One async lock per open session so chunks for the same session are applied one at a
    /// time while different sessions proceed in parallel. Only active sessions get an entry.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for UploadSessionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSessionTracker")
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl UploadSessionTracker {
    pub fn new(
        store: Arc<dyn SessionStore>,
        ledger: Arc<AuditLedger>,
        idle_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            idle_timeout: chrono::Duration::from_std(idle_timeout)
                .unwrap_or(chrono::Duration::MAX),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, session_id: &str) -> StorageResult<Option<UploadSession>> {
        Ok(self.store.get(session_id)?)
    }

    /// Opens a session and its partial file.
    ///
    /// Fails with `SessionConflict` if another session is still open for the same class and
    /// path.
    pub async fn initiate(
        &self,
        disk: &Arc<DiskStore>,
        request: NewUpload,
    ) -> StorageResult<UploadSession> {
        if let Some(existing) = self.find_active(&request.storage_class, &request.path)? {
            tracing::debug!(
                existing = %existing.id,
                path = %request.path,
                "Rejecting upload, session already open"
            );
            return Err(StorageError::SessionConflict(request.path.to_string()));
        }

        let id = UploadSession::new_id();
        let mut draft = RecordDraft::new(
            request.actor.clone(),
            request.storage_class.clone(),
            request.path.as_str(),
        )
        .with_metadata(request.metadata.clone())
        .with_entry(meta::SESSION_ID, id.clone())
        .with_cleanup_deadline(request.cleanup_deadline);
        if let Some(content_type) = &request.content_type {
            draft = draft.with_entry(meta::CONTENT_TYPE, content_type.clone());
        }
        let record = self.ledger.begin(draft)?;

        let now = Utc::now();
        let mut session = UploadSession {
            id: id.clone(),
            storage_class: request.storage_class,
            path: request.path,
            actor: request.actor,
            expected_total_bytes: request.expected_total_bytes,
            bytes_received: 0,
            chunk_sequence_number: None,
            status: SessionStatus::Initiated,
            created_at: now,
            last_activity_at: now,
            ledger_record_id: record.id,
            content_type: request.content_type,
            metadata: request.metadata,
        };

        if let Err(err) = self.store.insert_exclusive(&session) {
            let err = StorageError::from(err);
            self.fail_record(record.id, &err);
            return Err(err);
        }

        let store = Arc::clone(disk);
        let partial_id = id.clone();
        if let Err(err) = blocking::run(move || store.create_partial(&partial_id)).await {
            session.status = SessionStatus::Aborted;
            if let Err(update_err) = self.store.update(&session) {
                tracing::error!(session = %id, "Failed to close session: {update_err}");
            }
            self.fail_record(record.id, &err);
            return Err(err);
        }

        tracing::info!(
            session = %id,
            class = %session.storage_class,
            path = %session.path,
            expected_total_bytes = ?session.expected_total_bytes,
            "Upload session initiated"
        );
        Ok(session)
    }

    /// Appends one chunk to the session's partial file.
    pub async fn accept_chunk(
        &self,
        disk: &DiskStore,
        class: &StorageClass,
        session_id: &str,
        sequence: u64,
        chunk: Bytes,
    ) -> StorageResult<ChunkReceipt> {
        let (_guard, mut session) = self.lock_active(class, session_id).await?;
        let expected = session.next_sequence();
        if sequence != expected {
            return Err(StorageError::OutOfOrderChunk {
                expected,
                received: sequence,
            });
        }

        let new_total = session.bytes_received + chunk.len() as u64;
        if let Some(total) = session.expected_total_bytes {
            if new_total > total {
                return Err(StorageError::InvalidInput(format!(
                    "chunk {sequence} would take the upload to {new_total} bytes, \
                     {total} were declared"
                )));
            }
        }

        let partial = disk.partial_path(&session.id)?;
        let write_err =
            |e: std::io::Error| StorageError::WriteError(format!("upload {session_id}: {e}"));
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&partial)
            .await
            .map_err(write_err)?;
        // Drop any tail left by an append that failed part way through.
        file.set_len(session.bytes_received)
            .await
            .map_err(write_err)?;
        file.seek(SeekFrom::Start(session.bytes_received))
            .await
            .map_err(write_err)?;
        file.write_all(&chunk).await.map_err(write_err)?;
        file.sync_data().await.map_err(write_err)?;

        session.bytes_received = new_total;
        session.chunk_sequence_number = Some(sequence);
        session.status = SessionStatus::Receiving;
        session.last_activity_at = Utc::now();
        self.store.update(&session)?;

        tracing::debug!(
            session = %session_id,
            sequence,
            bytes_received = new_total,
            "Chunk accepted"
        );
        Ok(ChunkReceipt {
            sequence,
            bytes_received: new_total,
        })
    }

    /// Moves the assembled partial file onto the session path.
    pub async fn finalize(
        &self,
        disk: &Arc<DiskStore>,
        class: &StorageClass,
        session_id: &str,
    ) -> StorageResult<CompletedUpload> {
        let (_guard, mut session) = self.lock_active(class, session_id).await?;
        if let Some(total) = session.expected_total_bytes {
            if total != session.bytes_received {
                return Err(StorageError::InvalidInput(format!(
                    "upload incomplete: {} of {} bytes received",
                    session.bytes_received, total
                )));
            }
        }

        let store = Arc::clone(disk);
        let id = session.id.clone();
        let fingerprint = blocking::run(move || store.fingerprint_partial(&id)).await;

        let store = Arc::clone(disk);
        let id = session.id.clone();
        let path = session.path.clone();
        if let Err(err) = blocking::run(move || store.commit_partial(&id, &path)).await {
            self.close_failed(disk, &mut session, &err).await;
            return Err(err);
        }

        let mut extra = BTreeMap::new();
        match fingerprint {
            Ok((sha256, media_type)) => {
                extra.insert(meta::SHA256.to_owned(), sha256);
                if let Some(media_type) = media_type {
                    extra.insert(meta::DETECTED_MEDIA_TYPE.to_owned(), media_type.to_owned());
                }
            }
            Err(err) => {
                tracing::warn!(session = %session_id, "Could not fingerprint upload: {err}")
            }
        }

        self.ledger.complete(
            session.ledger_record_id,
            OperationAction::Created,
            Some(session.bytes_received),
            extra,
        )?;

        session.status = SessionStatus::Completed;
        session.last_activity_at = Utc::now();
        self.store.update(&session)?;
        self.forget_lock(session_id);

        tracing::info!(
            session = %session_id,
            path = %session.path,
            byte_size = session.bytes_received,
            "Upload session completed"
        );
        Ok(CompletedUpload {
            path: session.path,
            byte_size: session.bytes_received,
        })
    }

    /// Cancels a session and discards its partial file.
    ///
    /// Aborting an already aborted session succeeds; aborting a completed or unknown one
    /// fails with `SessionNotFound`.
    pub async fn abort(
        &self,
        disk: &Arc<DiskStore>,
        class: &StorageClass,
        session_id: &str,
        ctx: &OperationContext,
    ) -> StorageResult<()> {
        match self.store.get(session_id)? {
            Some(s) if &s.storage_class == class && s.status == SessionStatus::Aborted => {
                return Ok(())
            }
            Some(s) if &s.storage_class == class && s.status.is_active() => {}
            _ => return Err(StorageError::SessionNotFound(session_id.to_owned())),
        }
        let (_guard, mut session) = match self.lock_active(class, session_id).await {
            Ok(locked) => locked,
            // Closed by a concurrent caller while we waited.
            Err(StorageError::SessionNotFound(_))
                if self
                    .store
                    .get(session_id)?
                    .is_some_and(|s| s.status == SessionStatus::Aborted) =>
            {
                return Ok(())
            }
            Err(e) => return Err(e),
        };

        let why = ctx
            .metadata
            .get(meta::REASON)
            .map(String::as_str)
            .unwrap_or(reason::CALLER_ABORT);

        let store = Arc::clone(disk);
        let id = session.id.clone();
        blocking::run(move || store.remove_partial(&id)).await?;

        session.status = SessionStatus::Aborted;
        session.last_activity_at = Utc::now();
        self.store.update(&session)?;

        let mut extra = BTreeMap::new();
        extra.insert(meta::REASON.to_owned(), why.to_owned());
        extra.insert(meta::ABORTED_BY.to_owned(), ctx.actor.to_string());
        self.ledger.complete(
            session.ledger_record_id,
            OperationAction::StreamFailed,
            Some(session.bytes_received),
            extra,
        )?;
        self.forget_lock(session_id);

        tracing::info!(session = %session_id, reason = why, "Upload session aborted");
        Ok(())
    }

    /// Open sessions with no activity for longer than the idle timeout.
    pub fn idle_sessions(&self, now: DateTime<Utc>) -> StorageResult<Vec<UploadSession>> {
        Ok(self
            .store
            .active()?
            .into_iter()
            .filter(|s| s.is_idle(now, self.idle_timeout))
            .collect())
    }

    /// Drops completed and aborted sessions last touched before `before`.
    pub fn purge_closed(&self, before: DateTime<Utc>) -> StorageResult<u64> {
        let purged = self.store.purge_closed(before)?;
        if purged > 0 {
            tracing::debug!(purged, "Purged closed upload sessions");
        }
        Ok(purged)
    }

    /// Removes partial files in `disk` that no open session owns. Returns how many went.
    pub async fn sweep_orphan_partials(&self, disk: &Arc<DiskStore>) -> StorageResult<u64> {
        let store = Arc::clone(disk);
        let on_disk = blocking::run(move || store.partial_session_ids()).await?;
        let mut removed = 0;
        for id in on_disk {
            let open = self
                .store
                .get(&id)?
                .is_some_and(|s| s.status.is_active());
            if open {
                continue;
            }
            let store = Arc::clone(disk);
            if blocking::run(move || store.remove_partial(&id)).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn find_active(
        &self,
        class: &StorageClass,
        path: &StoragePath,
    ) -> StorageResult<Option<UploadSession>> {
        Ok(self.store.find_active(class, path)?)
    }

    fn load_active(&self, class: &StorageClass, session_id: &str) -> StorageResult<UploadSession> {
        match self.store.get(session_id)? {
            Some(s) if &s.storage_class == class && s.status.is_active() => Ok(s),
            _ => Err(StorageError::SessionNotFound(session_id.to_owned())),
        }
    }

    async fn close_failed(
        &self,
        disk: &Arc<DiskStore>,
        session: &mut UploadSession,
        err: &StorageError,
    ) {
        let store = Arc::clone(disk);
        let id = session.id.clone();
        if let Err(e) = blocking::run(move || store.remove_partial(&id)).await {
            tracing::warn!(session = %session.id, "Failed to remove partial file: {e}");
        }
        session.status = SessionStatus::Aborted;
        session.last_activity_at = Utc::now();
        if let Err(e) = self.store.update(session) {
            tracing::error!(session = %session.id, "Failed to close session: {e}");
        }
        self.fail_record(session.ledger_record_id, err);
        self.forget_lock(&session.id);
    }

    fn fail_record(&self, record_id: Uuid, err: &StorageError) {
        let mut extra = BTreeMap::new();
        extra.insert(meta::ERROR.to_owned(), err.code().to_owned());
        if let Err(ledger_err) =
            self.ledger
                .complete(record_id, OperationAction::StreamFailed, None, extra)
        {
            tracing::error!(record = %record_id, "Failed to record upload failure: {ledger_err}");
        }
    }

    /// Takes the session's lock and returns it with the session, which is active while the
    /// guard is held. Unknown and closed ids never get a lock table entry.
    async fn lock_active(
        &self,
        class: &StorageClass,
        session_id: &str,
    ) -> StorageResult<(tokio::sync::OwnedMutexGuard<()>, UploadSession)> {
        self.load_active(class, session_id)?;
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| StorageError::WriteError("session lock table poisoned".into()))?;
            Arc::clone(locks.entry(session_id.to_owned()).or_default())
        };
        let guard = lock.lock_owned().await;

        match self.load_active(class, session_id) {
            Ok(session) => Ok((guard, session)),
            Err(e) => {
                drop(guard);
                self.forget_lock(session_id);
                Err(e)
            }
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or_default()
    }

    fn forget_lock(&self, session_id: &str) {
        if let Ok(mut locks) = self.locks.lock() {
            locks.remove(session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phistore_types::RuntimeRole;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        disk: Arc<DiskStore>,
        ledger: Arc<AuditLedger>,
        tracker: UploadSessionTracker,
    }

    fn fixture(idle: Duration) -> Fixture {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let disk = Arc::new(DiskStore::open(temp.path()).unwrap());
        let ledger = Arc::new(AuditLedger::in_memory(RuntimeRole::Test).unwrap());
        let tracker = UploadSessionTracker::new(
            Arc::new(SqliteSessionStore::in_memory().unwrap()),
            Arc::clone(&ledger),
            idle,
        );
        Fixture {
            _temp: temp,
            disk,
            ledger,
            tracker,
        }
    }

    fn request(path: &str, total: Option<u64>) -> NewUpload {
        NewUpload {
            storage_class: StorageClass::workspace(),
            path: StoragePath::parse(path).unwrap(),
            actor: Actor::user("clinician-1").unwrap(),
            expected_total_bytes: total,
            content_type: Some("application/octet-stream".into()),
            metadata: BTreeMap::new(),
            cleanup_deadline: None,
        }
    }

    #[tokio::test]
    async fn test_three_chunks_complete_with_one_record() {
        let f = fixture(Duration::from_secs(600));
        let class = StorageClass::workspace();
        let session = f
            .tracker
            .initiate(&f.disk, request("job-1/scan.bin", Some(3 * 1024 * 1024)))
            .await
            .unwrap();

        for seq in 0..3u64 {
            let chunk = Bytes::from(vec![seq as u8; 1024 * 1024]);
            let receipt = f
                .tracker
                .accept_chunk(&f.disk, &class, &session.id, seq, chunk)
                .await
                .unwrap();
            assert_eq!(receipt.bytes_received, (seq + 1) * 1024 * 1024);
        }

        let done = f
            .tracker
            .finalize(&f.disk, &class, &session.id)
            .await
            .unwrap();
        assert_eq!(done.byte_size, 3_145_728);
        assert_eq!(
            f.disk.file_len(&StoragePath::parse("job-1/scan.bin").unwrap()).unwrap(),
            3_145_728
        );

        let history = f.ledger.history(&class, "job-1/scan.bin").unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, OperationAction::Created);
        assert_eq!(history[0].byte_size, Some(3_145_728));
        assert!(history[0].metadata.contains_key(meta::SHA256));
        assert!(f.disk.partial_session_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_chunk_leaves_state_unchanged() {
        let f = fixture(Duration::from_secs(600));
        let class = StorageClass::workspace();
        let session = f
            .tracker
            .initiate(&f.disk, request("job-2/a.bin", None))
            .await
            .unwrap();

        f.tracker
            .accept_chunk(&f.disk, &class, &session.id, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let err = f
            .tracker
            .accept_chunk(&f.disk, &class, &session.id, 2, Bytes::from_static(b"zzz"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::OutOfOrderChunk {
                expected: 1,
                received: 2
            }
        ));

        let replay = f
            .tracker
            .accept_chunk(&f.disk, &class, &session.id, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap_err();
        assert!(matches!(replay, StorageError::OutOfOrderChunk { expected: 1, .. }));

        let current = f.tracker.get(&session.id).unwrap().unwrap();
        assert_eq!(current.bytes_received, 3);
        assert_eq!(current.chunk_sequence_number, Some(0));
        assert_eq!(current.status, SessionStatus::Receiving);
    }

    #[tokio::test]
    async fn test_second_session_for_same_path_conflicts() {
        let f = fixture(Duration::from_secs(600));
        f.tracker
            .initiate(&f.disk, request("job-3/a.bin", None))
            .await
            .unwrap();

        let err = f
            .tracker
            .initiate(&f.disk, request("job-3/a.bin", None))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SessionConflict(_)));

        f.tracker
            .initiate(&f.disk, request("job-3/b.bin", None))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_finalize_rejects_short_upload() {
        let f = fixture(Duration::from_secs(600));
        let class = StorageClass::workspace();
        let session = f
            .tracker
            .initiate(&f.disk, request("job-4/a.bin", Some(10)))
            .await
            .unwrap();
        f.tracker
            .accept_chunk(&f.disk, &class, &session.id, 0, Bytes::from_static(b"12345"))
            .await
            .unwrap();

        let err = f
            .tracker
            .finalize(&f.disk, &class, &session.id)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));

        let overflow = f
            .tracker
            .accept_chunk(&f.disk, &class, &session.id, 1, Bytes::from_static(b"123456"))
            .await
            .unwrap_err();
        assert!(matches!(overflow, StorageError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_abort_discards_partial_and_fails_record() {
        let f = fixture(Duration::from_secs(600));
        let class = StorageClass::workspace();
        let session = f
            .tracker
            .initiate(&f.disk, request("job-5/a.bin", None))
            .await
            .unwrap();
        f.tracker
            .accept_chunk(&f.disk, &class, &session.id, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let ctx = OperationContext::system();
        f.tracker
            .abort(&f.disk, &class, &session.id, &ctx)
            .await
            .unwrap();
        // Idempotent.
        f.tracker
            .abort(&f.disk, &class, &session.id, &ctx)
            .await
            .unwrap();

        assert!(f.disk.partial_session_ids().unwrap().is_empty());
        let record = f.ledger.get(session.ledger_record_id).unwrap().unwrap();
        assert_eq!(record.action, OperationAction::StreamFailed);
        assert_eq!(
            record.metadata.get(meta::REASON).map(String::as_str),
            Some(reason::CALLER_ABORT)
        );

        let err = f
            .tracker
            .accept_chunk(&f.disk, &class, &session.id, 1, Bytes::from_static(b"d"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_idle_sessions_and_orphan_partials() {
        let f = fixture(Duration::from_secs(0));
        let session = f
            .tracker
            .initiate(&f.disk, request("job-6/a.bin", None))
            .await
            .unwrap();
        f.disk.create_partial("stray-session").unwrap();

        let later = Utc::now() + chrono::Duration::seconds(1);
        let idle = f.tracker.idle_sessions(later).unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id, session.id);

        assert_eq!(f.tracker.sweep_orphan_partials(&f.disk).await.unwrap(), 1);
        assert_eq!(f.disk.partial_session_ids().unwrap(), vec![session.id]);
    }

    #[tokio::test]
    async fn test_session_from_other_class_is_not_found() {
        let f = fixture(Duration::from_secs(600));
        let session = f
            .tracker
            .initiate(&f.disk, request("job-7/a.bin", None))
            .await
            .unwrap();

        let err = f
            .tracker
            .accept_chunk(
                &f.disk,
                &StorageClass::submission(),
                &session.id,
                0,
                Bytes::from_static(b"x"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_unknown_session_ids_leave_no_locks_behind() {
        let f = fixture(Duration::from_secs(600));
        let class = StorageClass::workspace();
        for i in 0..1000u64 {
            let err = f
                .tracker
                .accept_chunk(&f.disk, &class, &format!("no-such-{i}"), 0, Bytes::from_static(b"x"))
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::SessionNotFound(_)));
        }
        assert_eq!(f.tracker.lock_count(), 0);

        let session = f
            .tracker
            .initiate(&f.disk, request("job-8/a.bin", None))
            .await
            .unwrap();
        f.tracker
            .accept_chunk(&f.disk, &class, &session.id, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(f.tracker.lock_count(), 1);

        f.tracker
            .finalize(&f.disk, &class, &session.id)
            .await
            .unwrap();
        assert_eq!(f.tracker.lock_count(), 0);

        // Chunks sent after completion do not bring the lock back.
        let err = f
            .tracker
            .accept_chunk(&f.disk, &class, &session.id, 1, Bytes::from_static(b"d"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::SessionNotFound(_)));
        assert_eq!(f.tracker.lock_count(), 0);
    }
}
