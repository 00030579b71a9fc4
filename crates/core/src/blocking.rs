use crate::{StorageError, StorageResult};
use phistore_files::DiskResult;

/// Runs synchronous disk work on the blocking pool and folds its error into
/// [`StorageError`].
pub(crate) async fn run<T, F>(work: F) -> StorageResult<T>
where
    F: FnOnce() -> DiskResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StorageError::WriteError(format!("disk task failed: {e}")))?
        .map_err(StorageError::from)
}
