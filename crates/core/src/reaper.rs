//! Workspace reaper.
//!
//! Periodic cleanup for every class this process serves from local disk. One pass:
//!
//! 1. aborts upload sessions that have gone idle and purges long-closed ones
//! 2. fails write-ahead records whose operation never finished
//! 3. deletes objects whose cleanup deadline has passed
//! 4. deletes orphans: objects in classes with a cleanup policy that no live creation record
//!    accounts for
//! 5. sweeps stale temp files and partials nobody owns
//!
//! A pass is idempotent. Failures on one object are logged, recorded and retried on the next
//! pass; they never stop the rest of the pass.

use crate::constants::{meta, reason, CLOSED_SESSION_RETENTION};
use crate::driver::{DriverKind, OperationContext, StorageDriver};
use crate::ledger::{AuditLedger, OperationAction, RecordDraft};
use crate::manager::StorageManager;
use crate::StorageResult;
use chrono::{DateTime, Utc};
use phistore_types::{Actor, StoragePath, StoragePrefix};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReaperReport {
    pub sessions_aborted: u64,
    pub sessions_purged: u64,
    pub records_abandoned: u64,
    pub cleanups_completed: u64,
    pub cleanups_failed: u64,
    pub orphans_removed: u64,
    pub temp_files_removed: u64,
    pub partials_removed: u64,
}

#[derive(Debug, Clone)]
pub struct WorkspaceReaper {
    manager: Arc<StorageManager>,
    interval: Duration,
    abandoned_after: chrono::Duration,
}

impl WorkspaceReaper {
    pub fn new(manager: Arc<StorageManager>) -> Self {
        let interval = manager.config().reaper_interval;
        let abandoned_after = chrono::Duration::from_std(manager.config().abandoned_after)
            .unwrap_or(chrono::Duration::MAX);
        Self {
            manager,
            interval,
            abandoned_after,
        }
    }

    /// Runs passes every `interval` until `shutdown` resolves. The first pass runs at once.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        tracing::info!(interval_secs = self.interval.as_secs(), "Workspace reaper started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(report) => tracing::info!(?report, "Reaper pass finished"),
                        Err(e) => tracing::error!("Reaper pass failed: {e}"),
                    }
                }
            }
        }
        tracing::info!("Workspace reaper stopped");
    }

    /// One full pass as of `now`.
    pub async fn run_once(&self, now: DateTime<Utc>) -> StorageResult<ReaperReport> {
        let mut report = ReaperReport::default();
        let Some(ledger) = self.manager.ledger().cloned() else {
            tracing::debug!("No local storage classes, nothing to reap");
            return Ok(report);
        };
        let cutoff = now
            .checked_sub_signed(self.abandoned_after)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        self.abort_idle_sessions(now, &mut report).await?;
        self.fail_abandoned(&ledger, cutoff, &mut report)?;
        self.run_due_cleanups(&ledger, now, &mut report).await?;
        self.remove_orphans(&ledger, cutoff, &mut report).await?;
        self.housekeeping(cutoff, &mut report).await;

        Ok(report)
    }

    async fn abort_idle_sessions(
        &self,
        now: DateTime<Utc>,
        report: &mut ReaperReport,
    ) -> StorageResult<()> {
        let Some(sessions) = self.manager.sessions() else {
            return Ok(());
        };
        let ctx = OperationContext::system().with_metadata(meta::REASON, reason::IDLE_TIMEOUT);

        for session in sessions.idle_sessions(now)? {
            let aborted = match self.manager.get_storage(&session.storage_class) {
                Ok(driver) => driver.abort_upload(&session.id, &ctx).await,
                Err(e) => Err(e),
            };
            match aborted {
                Ok(()) => {
                    report.sessions_aborted += 1;
                    tracing::info!(
                        session = %session.id,
                        path = %session.path,
                        "Aborted idle upload session"
                    );
                }
                Err(e) => tracing::warn!(session = %session.id, "Cannot abort idle session: {e}"),
            }
        }

        let retention =
            chrono::Duration::from_std(CLOSED_SESSION_RETENTION).unwrap_or(chrono::Duration::MAX);
        if let Some(before) = now.checked_sub_signed(retention) {
            report.sessions_purged += sessions.purge_closed(before)?;
        }
        Ok(())
    }

    fn fail_abandoned(
        &self,
        ledger: &AuditLedger,
        cutoff: DateTime<Utc>,
        report: &mut ReaperReport,
    ) -> StorageResult<()> {
        for record in ledger.abandoned(cutoff)? {
            let mut extra = BTreeMap::new();
            extra.insert(meta::REASON.to_owned(), reason::ABANDONED.to_owned());
            match ledger.complete(record.id, OperationAction::StreamFailed, None, extra) {
                Ok(_) => {
                    report.records_abandoned += 1;
                    tracing::warn!(
                        record = %record.id,
                        class = %record.storage_class,
                        path = %record.path,
                        "Closed abandoned operation"
                    );
                }
                // Finished on its own since the scan.
                Err(crate::ledger::LedgerError::AlreadyTerminal { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn run_due_cleanups(
        &self,
        ledger: &AuditLedger,
        now: DateTime<Utc>,
        report: &mut ReaperReport,
    ) -> StorageResult<()> {
        for record in ledger.due_for_cleanup(now)? {
            if record.action == OperationAction::Created && ledger.is_superseded(&record)? {
                ledger.mark_cleaned_up(record.id)?;
                tracing::debug!(record = %record.id, path = %record.path, "Cleanup superseded by a newer write");
                continue;
            }

            let ctx = OperationContext::system()
                .with_metadata(meta::REASON, reason::DEADLINE)
                .with_metadata(meta::SOURCE_RECORD, record.id.to_string());
            let deleted = match (
                StoragePath::parse(&record.path),
                self.manager.get_storage(&record.storage_class),
            ) {
                (Ok(path), Ok(driver)) => driver.delete(&path, &ctx).await,
                (Err(e), _) => Err(e.into()),
                (_, Err(e)) => Err(e),
            };

            let draft = RecordDraft::new(Actor::System, record.storage_class.clone(), &record.path)
                .with_entry(meta::SOURCE_RECORD, record.id.to_string());
            match deleted {
                Ok(()) => {
                    ledger.mark_cleaned_up(record.id)?;
                    ledger.append(
                        OperationAction::CleanupCompleted,
                        draft.with_entry(meta::REASON, reason::DEADLINE),
                    )?;
                    report.cleanups_completed += 1;
                    tracing::info!(class = %record.storage_class, path = %record.path, "Cleanup completed");
                }
                Err(e) => {
                    ledger.append(
                        OperationAction::CleanupFailed,
                        draft.with_entry(meta::ERROR, e.to_string()),
                    )?;
                    report.cleanups_failed += 1;
                    tracing::warn!(class = %record.storage_class, path = %record.path, "Cleanup failed: {e}");
                }
            }
        }
        Ok(())
    }

    async fn remove_orphans(
        &self,
        ledger: &AuditLedger,
        cutoff: DateTime<Utc>,
        report: &mut ReaperReport,
    ) -> StorageResult<()> {
        let classes: Vec<_> = self
            .manager
            .config()
            .classes()
            .iter()
            .filter(|c| c.cleanup_after.is_some())
            .map(|c| c.class.clone())
            .collect();

        for class in classes {
            let driver = self.manager.get_storage(&class)?;
            if driver.kind() != DriverKind::Local {
                continue;
            }
            for path in driver.list(&StoragePrefix::root()).await? {
                if ledger.has_live_creation(&class, path.as_str())?
                    || ledger.in_flight_since(&class, path.as_str(), cutoff)?
                {
                    continue;
                }

                let ctx = OperationContext::system().with_metadata(meta::REASON, reason::ORPHAN);
                let draft = RecordDraft::new(Actor::System, class.clone(), path.as_str());
                match driver.delete(&path, &ctx).await {
                    Ok(()) => {
                        ledger.append(
                            OperationAction::CleanupCompleted,
                            draft.with_entry(meta::REASON, reason::ORPHAN),
                        )?;
                        report.orphans_removed += 1;
                        tracing::warn!(class = %class, path = %path, "Removed orphaned object with no live creation record");
                    }
                    Err(e) => {
                        ledger.append(
                            OperationAction::CleanupFailed,
                            draft
                                .with_entry(meta::REASON, reason::ORPHAN)
                                .with_entry(meta::ERROR, e.to_string()),
                        )?;
                        report.cleanups_failed += 1;
                        tracing::warn!(class = %class, path = %path, "Cannot remove orphan: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    async fn housekeeping(&self, cutoff: DateTime<Utc>, report: &mut ReaperReport) {
        let classes: Vec<_> = self.manager.classes().cloned().collect();
        for class in classes {
            let driver = match self.manager.get_storage(&class) {
                Ok(driver) => driver,
                Err(e) => {
                    tracing::warn!(class = %class, "Skipping housekeeping: {e}");
                    continue;
                }
            };
            match driver.housekeeping(cutoff).await {
                Ok(done) => {
                    report.temp_files_removed += done.temp_files_removed;
                    report.partials_removed += done.partials_removed;
                }
                Err(e) => tracing::warn!(class = %class, "Housekeeping failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClassConfig, StorageConfig};
    use crate::driver::stream_from_bytes;
    use bytes::Bytes;
    use phistore_types::{RuntimeRole, StorageClass};
    use tempfile::TempDir;

    fn setup(temp_dir: &TempDir) -> (Arc<StorageManager>, WorkspaceReaper) {
        let classes = vec![
            ClassConfig {
                class: StorageClass::submission(),
                root: temp_dir.path().join("submission"),
                phi_bearing: true,
                cleanup_after: None,
            },
            ClassConfig {
                class: StorageClass::workspace(),
                root: temp_dir.path().join("workspace"),
                phi_bearing: true,
                cleanup_after: Some(Duration::from_secs(60)),
            },
        ];
        let config = StorageConfig::new(RuntimeRole::Test, classes, None, None, None).unwrap();
        let manager = Arc::new(StorageManager::new(config).unwrap());
        let reaper = WorkspaceReaper::new(Arc::clone(&manager));
        (manager, reaper)
    }

    fn ctx() -> OperationContext {
        OperationContext::new(Actor::user("analyst-1").unwrap())
    }

    #[tokio::test]
    async fn test_due_workspace_object_is_cleaned_up() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (manager, reaper) = setup(&temp_dir);
        let workspace = manager.get_storage(&StorageClass::workspace()).unwrap();
        let path = StoragePath::parse("job-1/derived.parquet").unwrap();
        workspace
            .save(&path, stream_from_bytes("rows"), None, &ctx())
            .await
            .unwrap();

        // Not due yet.
        let report = reaper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.cleanups_completed, 0);
        assert!(workspace.exists(&path).await.unwrap());

        let later = Utc::now() + chrono::Duration::minutes(5);
        let report = reaper.run_once(later).await.unwrap();
        assert_eq!(report.cleanups_completed, 1);
        assert!(!workspace.exists(&path).await.unwrap());

        let ledger = manager.ledger().unwrap();
        let history = ledger
            .history(&StorageClass::workspace(), path.as_str())
            .unwrap();
        let created = history
            .iter()
            .find(|r| r.action == OperationAction::Created)
            .unwrap();
        assert!(created.cleaned_up);
        assert!(history
            .iter()
            .any(|r| r.action == OperationAction::CleanupCompleted
                && r.metadata.get(meta::SOURCE_RECORD) == Some(&created.id.to_string())));

        // A second pass finds nothing left to do.
        let report = reaper.run_once(later).await.unwrap();
        assert_eq!(report, ReaperReport::default());
    }

    #[tokio::test]
    async fn test_submission_objects_are_never_orphan_reaped() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (manager, reaper) = setup(&temp_dir);
        let _ = manager.get_storage(&StorageClass::submission()).unwrap();
        std::fs::write(temp_dir.path().join("submission/dropped.csv"), b"x").unwrap();

        let report = reaper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.orphans_removed, 0);
        assert!(temp_dir.path().join("submission/dropped.csv").exists());
    }

    #[tokio::test]
    async fn test_orphaned_workspace_file_is_removed() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (manager, reaper) = setup(&temp_dir);
        let workspace = manager.get_storage(&StorageClass::workspace()).unwrap();
        let kept = StoragePath::parse("job-2/kept.bin").unwrap();
        workspace
            .save(&kept, stream_from_bytes("keep"), None, &ctx())
            .await
            .unwrap();
        std::fs::create_dir_all(temp_dir.path().join("workspace/job-2")).unwrap();
        std::fs::write(temp_dir.path().join("workspace/job-2/stray.bin"), b"stray").unwrap();

        let report = reaper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(workspace.exists(&kept).await.unwrap());
        assert!(!temp_dir.path().join("workspace/job-2/stray.bin").exists());

        let history = manager
            .ledger()
            .unwrap()
            .history(&StorageClass::workspace(), "job-2/stray.bin")
            .unwrap();
        assert!(history.iter().any(|r| {
            r.action == OperationAction::CleanupCompleted
                && r.metadata.get(meta::REASON).map(String::as_str) == Some(reason::ORPHAN)
        }));
    }

    #[tokio::test]
    async fn test_file_rewritten_after_delete_is_orphaned() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (manager, reaper) = setup(&temp_dir);
        let workspace = manager.get_storage(&StorageClass::workspace()).unwrap();
        let path = StoragePath::parse("job/a.csv").unwrap();
        workspace
            .save(&path, stream_from_bytes("v1"), None, &ctx())
            .await
            .unwrap();
        workspace.delete(&path, &ctx()).await.unwrap();

        // Bytes that reach the disk behind the ledger's back.
        let on_disk = temp_dir.path().join("workspace/job/a.csv");
        std::fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
        std::fs::write(&on_disk, b"untracked").unwrap();

        let report = reaper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(!on_disk.exists());
    }

    #[tokio::test]
    async fn test_file_under_deleted_prefix_is_orphaned() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (manager, reaper) = setup(&temp_dir);
        let workspace = manager.get_storage(&StorageClass::workspace()).unwrap();
        let path = StoragePath::parse("job-9/out/b.csv").unwrap();
        workspace
            .save(&path, stream_from_bytes("v1"), None, &ctx())
            .await
            .unwrap();
        workspace
            .delete_prefix(&StoragePrefix::parse("job-9").unwrap(), &ctx())
            .await
            .unwrap();

        let on_disk = temp_dir.path().join("workspace/job-9/out/b.csv");
        std::fs::create_dir_all(on_disk.parent().unwrap()).unwrap();
        std::fs::write(&on_disk, b"untracked").unwrap();

        let report = reaper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(!on_disk.exists());
    }

    #[tokio::test]
    async fn test_saved_again_after_delete_is_kept() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (manager, reaper) = setup(&temp_dir);
        let workspace = manager.get_storage(&StorageClass::workspace()).unwrap();
        let path = StoragePath::parse("job-10/a.csv").unwrap();
        workspace
            .save(&path, stream_from_bytes("v1"), None, &ctx())
            .await
            .unwrap();
        workspace.delete(&path, &ctx()).await.unwrap();
        workspace
            .save(&path, stream_from_bytes("v2"), None, &ctx())
            .await
            .unwrap();

        let report = reaper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.orphans_removed, 0);
        assert!(workspace.exists(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_sessions_are_purged_after_retention() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (manager, reaper) = setup(&temp_dir);
        let workspace = manager.get_storage(&StorageClass::workspace()).unwrap();
        let path = StoragePath::parse("job-11/big.bin").unwrap();
        let session_id = workspace
            .init_upload(&path, None, None, &ctx())
            .await
            .unwrap();
        workspace.abort_upload(&session_id, &ctx()).await.unwrap();

        let sessions = manager.sessions().unwrap();
        assert!(sessions.get(&session_id).unwrap().is_some());

        let report = reaper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.sessions_purged, 0);

        let later = Utc::now() + chrono::Duration::days(8);
        let report = reaper.run_once(later).await.unwrap();
        assert_eq!(report.sessions_purged, 1);
        assert!(sessions.get(&session_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idle_upload_session_is_aborted() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (manager, reaper) = setup(&temp_dir);
        let workspace = manager.get_storage(&StorageClass::workspace()).unwrap();
        let path = StoragePath::parse("job-3/big.bin").unwrap();
        let session_id = workspace
            .init_upload(&path, Some(10), None, &ctx())
            .await
            .unwrap();
        workspace
            .upload_chunk(&session_id, 0, Bytes::from_static(b"12345"))
            .await
            .unwrap();

        let report = reaper
            .run_once(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(report.sessions_aborted, 1);

        let history = manager
            .ledger()
            .unwrap()
            .history(&StorageClass::workspace(), path.as_str())
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, OperationAction::StreamFailed);
        assert_eq!(
            history[0].metadata.get(meta::REASON).map(String::as_str),
            Some(reason::IDLE_TIMEOUT)
        );
        assert!(!temp_dir
            .path()
            .join(format!("workspace/.uploads/{session_id}.part"))
            .exists());
    }

    #[tokio::test]
    async fn test_abandoned_write_ahead_record_is_failed() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (manager, reaper) = setup(&temp_dir);
        let ledger = manager.ledger().unwrap();
        let record = ledger
            .begin(RecordDraft::new(
                Actor::System,
                StorageClass::submission(),
                "sub-9/input.csv",
            ))
            .unwrap();

        let report = reaper.run_once(Utc::now()).await.unwrap();
        assert_eq!(report.records_abandoned, 0);

        let report = reaper
            .run_once(Utc::now() + chrono::Duration::days(2))
            .await
            .unwrap();
        assert_eq!(report.records_abandoned, 1);
        let closed = ledger.get(record.id).unwrap().unwrap();
        assert_eq!(closed.action, OperationAction::StreamFailed);
        assert_eq!(
            closed.metadata.get(meta::REASON).map(String::as_str),
            Some(reason::ABANDONED)
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let (_manager, reaper) = setup(&temp_dir);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            reaper
                .run(async {
                    let _ = rx.await;
                })
                .await
        });
        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
