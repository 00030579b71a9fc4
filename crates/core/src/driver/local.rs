//! Local disk driver.
//!
//! Runs wherever the process has mount access to a class root: on the storage owner, in
//! tests, and for non-PHI classes on the edge. Every operation except `exists`, `list` and
//! `url` leaves one ledger record; mutating operations write it before touching the disk.

use super::{
    ByteStream, ChunkReceipt, CompletedUpload, DriverKind, Housekeeping, OperationContext,
    StorageDriver,
};
use crate::constants::{meta, READ_BUFFER_BYTES};
use crate::ledger::{AuditLedger, OperationAction, RecordDraft};
use crate::sessions::{NewUpload, UploadSessionTracker};
use crate::{blocking, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use phistore_files::{detect_media_type, ContentDigest, DiskStore};
use phistore_types::{StorageClass, StoragePath, StoragePrefix};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

#[derive(Debug)]
pub struct LocalDiskDriver {
    class: StorageClass,
    disk: Arc<DiskStore>,
    ledger: Arc<AuditLedger>,
    sessions: Arc<UploadSessionTracker>,
    cleanup_after: Option<Duration>,
}

struct Written {
    byte_size: u64,
    sha256: String,
    media_type: Option<&'static str>,
}

impl LocalDiskDriver {
    pub fn new(
        class: StorageClass,
        disk: Arc<DiskStore>,
        ledger: Arc<AuditLedger>,
        sessions: Arc<UploadSessionTracker>,
        cleanup_after: Option<Duration>,
    ) -> Self {
        Self {
            class,
            disk,
            ledger,
            sessions,
            cleanup_after,
        }
    }

    pub fn disk(&self) -> &Arc<DiskStore> {
        &self.disk
    }

    fn draft(&self, ctx: &OperationContext, path: impl Into<String>) -> RecordDraft {
        RecordDraft::new(ctx.actor.clone(), self.class.clone(), path)
            .with_metadata(ctx.metadata.clone())
    }

    fn cleanup_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let after = chrono::Duration::from_std(self.cleanup_after?).ok()?;
        now.checked_add_signed(after)
    }

    /// Completes a write-ahead record as failed. The caller is already returning `err`, so a
    /// ledger failure here is logged rather than returned.
    fn fail_record(&self, id: Uuid, err: &StorageError) {
        let mut extra = BTreeMap::new();
        extra.insert(meta::ERROR.to_owned(), err.code().to_owned());
        if let Err(ledger_err) = self
            .ledger
            .complete(id, OperationAction::StreamFailed, None, extra)
        {
            tracing::error!(record = %id, "Failed to record operation failure: {ledger_err}");
        }
    }

    async fn write_stream(
        &self,
        path: &StoragePath,
        mut content: ByteStream,
    ) -> StorageResult<Written> {
        let disk = Arc::clone(&self.disk);
        let target_path = path.clone();
        let (target, temp) = blocking::run(move || disk.prepare_write(&target_path)).await?;

        let result = async {
            let write_err =
                |e: std::io::Error| StorageError::WriteError(format!("writing {path}: {e}"));
            let mut file = tokio::fs::File::create(&temp).await.map_err(write_err)?;
            let mut digest = ContentDigest::new();
            let mut media_type = None;

            while let Some(chunk) = content.next().await {
                let chunk = chunk.map_err(|e| {
                    StorageError::WriteError(format!("reading content for {path}: {e}"))
                })?;
                if digest.bytes() == 0 && !chunk.is_empty() {
                    media_type = detect_media_type(&chunk);
                }
                digest.update(&chunk);
                file.write_all(&chunk).await.map_err(write_err)?;
            }
            file.sync_all().await.map_err(write_err)?;
            drop(file);

            let disk = Arc::clone(&self.disk);
            let (from, to) = (temp.clone(), target.clone());
            blocking::run(move || disk.commit(&from, &to)).await?;

            Ok::<_, StorageError>(Written {
                byte_size: digest.bytes(),
                sha256: digest.finish(),
                media_type,
            })
        }
        .await;

        if result.is_err() {
            self.discard_temp(temp).await;
        }
        result
    }

    async fn discard_temp(&self, temp: PathBuf) {
        let disk = Arc::clone(&self.disk);
        let shown = temp.display().to_string();
        if let Err(e) = blocking::run(move || disk.discard(&temp)).await {
            tracing::warn!(temp = %shown, "Failed to remove temp file: {e}");
        }
    }
}

#[async_trait]
impl StorageDriver for LocalDiskDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Local
    }

    fn storage_class(&self) -> &StorageClass {
        &self.class
    }

    async fn save(
        &self,
        path: &StoragePath,
        content: ByteStream,
        content_type: Option<String>,
        ctx: &OperationContext,
    ) -> StorageResult<StoragePath> {
        let mut draft = self
            .draft(ctx, path.as_str())
            .with_cleanup_deadline(self.cleanup_deadline(Utc::now()));
        if let Some(content_type) = content_type {
            draft = draft.with_entry(meta::CONTENT_TYPE, content_type);
        }
        let record = self.ledger.begin(draft)?;

        let written = match self.write_stream(path, content).await {
            Ok(written) => written,
            Err(err) => {
                tracing::warn!(class = %self.class, path = %path, "Save failed: {err}");
                self.fail_record(record.id, &err);
                return Err(err);
            }
        };

        let mut extra = BTreeMap::new();
        extra.insert(meta::SHA256.to_owned(), written.sha256);
        if let Some(media_type) = written.media_type {
            extra.insert(meta::DETECTED_MEDIA_TYPE.to_owned(), media_type.to_owned());
        }
        self.ledger.complete(
            record.id,
            OperationAction::Created,
            Some(written.byte_size),
            extra,
        )?;

        tracing::info!(
            class = %self.class,
            path = %path,
            byte_size = written.byte_size,
            actor = %ctx.actor,
            "Object saved"
        );
        Ok(path.clone())
    }

    async fn get(&self, path: &StoragePath, ctx: &OperationContext) -> StorageResult<ByteStream> {
        let record = self.ledger.begin(self.draft(ctx, path.as_str()))?;

        let opened = async {
            let disk = Arc::clone(&self.disk);
            let lookup = path.clone();
            let target = blocking::run(move || disk.resolve(&lookup)).await?;
            let not_found = || StorageError::NotFound(path.to_string());
            let file = tokio::fs::File::open(&target).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => not_found(),
                _ => StorageError::WriteError(format!("opening {path}: {e}")),
            })?;
            let info = file
                .metadata()
                .await
                .map_err(|e| StorageError::WriteError(format!("reading {path}: {e}")))?;
            if !info.is_file() {
                return Err(not_found());
            }
            Ok::<_, StorageError>((file, info.len()))
        }
        .await;

        match opened {
            Ok((file, len)) => {
                self.ledger
                    .complete(record.id, OperationAction::Read, Some(len), BTreeMap::new())?;
                tracing::debug!(class = %self.class, path = %path, byte_size = len, "Object read");
                Ok(Box::pin(ReaderStream::with_capacity(file, READ_BUFFER_BYTES)))
            }
            Err(err) => {
                self.fail_record(record.id, &err);
                Err(err)
            }
        }
    }

    async fn delete(&self, path: &StoragePath, ctx: &OperationContext) -> StorageResult<()> {
        let record = self.ledger.begin(self.draft(ctx, path.as_str()))?;

        let disk = Arc::clone(&self.disk);
        let target = path.clone();
        match blocking::run(move || disk.remove(&target)).await {
            Ok(existed) => {
                let mut extra = BTreeMap::new();
                extra.insert(meta::EXISTED.to_owned(), existed.to_string());
                self.ledger
                    .complete(record.id, OperationAction::Deleted, None, extra)?;
                tracing::info!(class = %self.class, path = %path, existed, "Object deleted");
                Ok(())
            }
            Err(err) => {
                self.fail_record(record.id, &err);
                Err(err)
            }
        }
    }

    async fn delete_prefix(
        &self,
        prefix: &StoragePrefix,
        ctx: &OperationContext,
    ) -> StorageResult<u64> {
        if prefix.is_root() {
            return Err(StorageError::InvalidInput(
                "delete-prefix requires a non-empty prefix".into(),
            ));
        }

        let record = self.ledger.begin(self.draft(ctx, prefix.as_str()))?;

        let disk = Arc::clone(&self.disk);
        let target = prefix.clone();
        match blocking::run(move || disk.remove_prefix(&target)).await {
            Ok(count) => {
                let mut extra = BTreeMap::new();
                extra.insert(meta::COUNT.to_owned(), count.to_string());
                self.ledger
                    .complete(record.id, OperationAction::Deleted, None, extra)?;
                tracing::info!(class = %self.class, prefix = %prefix, count, "Prefix deleted");
                Ok(count)
            }
            Err(err) => {
                self.fail_record(record.id, &err);
                Err(err)
            }
        }
    }

    async fn exists(&self, path: &StoragePath) -> StorageResult<bool> {
        let disk = Arc::clone(&self.disk);
        let target = path.clone();
        blocking::run(move || disk.exists(&target)).await
    }

    async fn list(&self, prefix: &StoragePrefix) -> StorageResult<Vec<StoragePath>> {
        let disk = Arc::clone(&self.disk);
        let target = prefix.clone();
        blocking::run(move || disk.list(&target)).await
    }

    async fn init_upload(
        &self,
        path: &StoragePath,
        expected_total_bytes: Option<u64>,
        content_type: Option<String>,
        ctx: &OperationContext,
    ) -> StorageResult<String> {
        let session = self
            .sessions
            .initiate(
                &self.disk,
                NewUpload {
                    storage_class: self.class.clone(),
                    path: path.clone(),
                    actor: ctx.actor.clone(),
                    expected_total_bytes,
                    content_type,
                    metadata: ctx.metadata.clone(),
                    cleanup_deadline: self.cleanup_deadline(Utc::now()),
                },
            )
            .await?;
        Ok(session.id)
    }

    async fn upload_chunk(
        &self,
        session_id: &str,
        sequence: u64,
        chunk: Bytes,
    ) -> StorageResult<ChunkReceipt> {
        self.sessions
            .accept_chunk(&self.disk, &self.class, session_id, sequence, chunk)
            .await
    }

    async fn complete_upload(
        &self,
        session_id: &str,
        _ctx: &OperationContext,
    ) -> StorageResult<CompletedUpload> {
        self.sessions
            .finalize(&self.disk, &self.class, session_id)
            .await
    }

    async fn abort_upload(&self, session_id: &str, ctx: &OperationContext) -> StorageResult<()> {
        self.sessions
            .abort(&self.disk, &self.class, session_id, ctx)
            .await
    }

    async fn health(&self) -> StorageResult<()> {
        let disk = Arc::clone(&self.disk);
        blocking::run(move || disk.check_writable()).await
    }

    async fn housekeeping(&self, cutoff: DateTime<Utc>) -> StorageResult<Housekeeping> {
        let disk = Arc::clone(&self.disk);
        let before = SystemTime::from(cutoff);
        let temp_files_removed = blocking::run(move || disk.sweep_stale_temp(before)).await?;
        let partials_removed = self.sessions.sweep_orphan_partials(&self.disk).await?;
        if temp_files_removed + partials_removed > 0 {
            tracing::info!(
                class = %self.class,
                temp_files_removed,
                partials_removed,
                "Removed leftovers of interrupted writes"
            );
        }
        Ok(Housekeeping {
            temp_files_removed,
            partials_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{collect_stream, stream_from_bytes};
    use crate::sessions::SqliteSessionStore;
    use phistore_types::{Actor, RuntimeRole};
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        ledger: Arc<AuditLedger>,
        driver: LocalDiskDriver,
    }

    fn fixture(cleanup_after: Option<Duration>) -> Fixture {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let disk = Arc::new(DiskStore::open(temp.path()).unwrap());
        let ledger = Arc::new(AuditLedger::in_memory(RuntimeRole::Test).unwrap());
        let sessions = Arc::new(UploadSessionTracker::new(
            Arc::new(SqliteSessionStore::in_memory().unwrap()),
            Arc::clone(&ledger),
            Duration::from_secs(600),
        ));
        let driver = LocalDiskDriver::new(
            StorageClass::workspace(),
            disk,
            Arc::clone(&ledger),
            sessions,
            cleanup_after,
        );
        Fixture {
            _temp: temp,
            ledger,
            driver,
        }
    }

    fn path(raw: &str) -> StoragePath {
        StoragePath::parse(raw).unwrap()
    }

    fn ctx() -> OperationContext {
        OperationContext::new(Actor::user("clinician-1").unwrap())
            .with_metadata("request-id", "r-1")
    }

    fn failing_stream() -> ByteStream {
        Box::pin(futures::stream::iter(vec![
            Ok(Bytes::from_static(b"first part")),
            Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "client went away",
            )),
        ]))
    }

    #[tokio::test]
    async fn test_save_then_get_returns_same_bytes() {
        let f = fixture(None);
        let key = path("job-1/input.csv");

        let stored = f
            .driver
            .save(
                &key,
                stream_from_bytes("id,value\n1,2\n"),
                Some("text/csv".into()),
                &ctx(),
            )
            .await
            .unwrap();
        assert_eq!(stored, key);

        let bytes = collect_stream(f.driver.get(&key, &ctx()).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"id,value\n1,2\n");

        let history = f
            .ledger
            .history(&StorageClass::workspace(), "job-1/input.csv")
            .unwrap();
        let actions: Vec<_> = history.iter().map(|r| r.action).collect();
        assert_eq!(actions, vec![OperationAction::Created, OperationAction::Read]);
        assert_eq!(history[0].byte_size, Some(13));
        assert_eq!(
            history[0].metadata.get(meta::CONTENT_TYPE).map(String::as_str),
            Some("text/csv")
        );
        assert_eq!(
            history[0].metadata.get("request-id").map(String::as_str),
            Some("r-1")
        );
        assert!(history[0].metadata.contains_key(meta::SHA256));
        assert_eq!(history[1].byte_size, Some(13));
        assert_eq!(history[0].actor.to_string(), "user:clinician-1");
    }

    #[tokio::test]
    async fn test_get_missing_records_failure() {
        let f = fixture(None);
        let err = match f.driver.get(&path("nope.bin"), &ctx()).await {
            Err(e) => e,
            Ok(_) => panic!("called `Result::unwrap_err()` on an `Ok` value"),
        };
        assert!(matches!(err, StorageError::NotFound(_)));

        let history = f
            .ledger
            .history(&StorageClass::workspace(), "nope.bin")
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, OperationAction::StreamFailed);
        assert_eq!(
            history[0].metadata.get(meta::ERROR).map(String::as_str),
            Some("not-found")
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_audited_twice() {
        let f = fixture(None);
        let key = path("job-2/out.json");
        f.driver
            .save(&key, stream_from_bytes("{}"), None, &ctx())
            .await
            .unwrap();

        f.driver.delete(&key, &ctx()).await.unwrap();
        f.driver.delete(&key, &ctx()).await.unwrap();
        assert!(!f.driver.exists(&key).await.unwrap());

        let deletes: Vec<_> = f
            .ledger
            .history(&StorageClass::workspace(), "job-2/out.json")
            .unwrap()
            .into_iter()
            .filter(|r| r.action == OperationAction::Deleted)
            .collect();
        assert_eq!(deletes.len(), 2);
        assert_eq!(
            deletes[0].metadata.get(meta::EXISTED).map(String::as_str),
            Some("true")
        );
        assert_eq!(
            deletes[1].metadata.get(meta::EXISTED).map(String::as_str),
            Some("false")
        );
    }

    #[tokio::test]
    async fn test_delete_prefix_removes_subtree_with_one_record() {
        let f = fixture(None);
        for key in ["job-42/a.csv", "job-42/b.csv", "job-42/out/c.json", "job-43/keep.csv"] {
            f.driver
                .save(&path(key), stream_from_bytes("x"), None, &ctx())
                .await
                .unwrap();
        }

        let prefix = StoragePrefix::parse("job-42/").unwrap();
        assert_eq!(f.driver.delete_prefix(&prefix, &ctx()).await.unwrap(), 3);
        assert!(f.driver.list(&prefix).await.unwrap().is_empty());
        assert_eq!(
            f.driver.list(&StoragePrefix::root()).await.unwrap(),
            vec![path("job-43/keep.csv")]
        );

        let records = f
            .ledger
            .history(&StorageClass::workspace(), "job-42")
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, OperationAction::Deleted);
        assert_eq!(records[0].metadata.get(meta::COUNT).map(String::as_str), Some("3"));

        // Nothing left to remove.
        assert_eq!(f.driver.delete_prefix(&prefix, &ctx()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_prefix_rejects_root() {
        let f = fixture(None);
        let err = f
            .driver
            .delete_prefix(&StoragePrefix::root(), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_object_or_temp() {
        let f = fixture(None);
        let key = path("job-3/broken.bin");

        let err = f
            .driver
            .save(&key, failing_stream(), None, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::WriteError(_)));
        assert!(!f.driver.exists(&key).await.unwrap());

        let leftovers = f
            .driver
            .housekeeping(Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(leftovers.temp_files_removed, 0);

        let history = f
            .ledger
            .history(&StorageClass::workspace(), "job-3/broken.bin")
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, OperationAction::StreamFailed);
    }

    #[tokio::test]
    async fn test_cleanup_policy_sets_deadline() {
        let f = fixture(Some(Duration::from_secs(3600)));
        let key = path("job-4/tmp.bin");
        let before = Utc::now();
        f.driver
            .save(&key, stream_from_bytes("tmp"), None, &ctx())
            .await
            .unwrap();

        let record = &f
            .ledger
            .history(&StorageClass::workspace(), "job-4/tmp.bin")
            .unwrap()[0];
        let deadline = record.cleanup_deadline.expect("deadline set");
        assert!(deadline >= before + chrono::Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_chunked_upload_through_driver() {
        let f = fixture(None);
        let key = path("job-5/scan.dcm");
        let session = f
            .driver
            .init_upload(&key, Some(6), None, &ctx())
            .await
            .unwrap();
        f.driver
            .upload_chunk(&session, 0, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        f.driver
            .upload_chunk(&session, 1, Bytes::from_static(b"def"))
            .await
            .unwrap();
        let done = f.driver.complete_upload(&session, &ctx()).await.unwrap();
        assert_eq!(done.byte_size, 6);

        let bytes = collect_stream(f.driver.get(&key, &ctx()).await.unwrap())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"abcdef");
    }

    #[tokio::test]
    async fn test_health_and_url() {
        let f = fixture(None);
        f.driver.health().await.unwrap();
        assert_eq!(f.driver.url(&path("a"), None).await.unwrap(), None);
        assert_eq!(f.driver.kind(), DriverKind::Local);
    }
}
