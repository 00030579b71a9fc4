//! Storage driver interface.
//!
//! One driver instance serves one storage class. Callers never choose an implementation; the
//! [`crate::StorageManager`] picks it from the runtime role.

pub mod local;
pub mod remote;

pub use local::LocalDiskDriver;
pub use remote::{RemoteClient, RemoteProxyDriver};

use crate::StorageResult;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use phistore_types::{Actor, StorageClass, StoragePath, StoragePrefix};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

/// Object content as a stream of byte chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send>>;

/// Wraps an in-memory payload as a single-chunk stream.
pub fn stream_from_bytes(bytes: impl Into<Bytes>) -> ByteStream {
    let bytes = bytes.into();
    Box::pin(futures::stream::once(async move { Ok(bytes) }))
}

/// Drains a stream into memory. Only for callers that know the object is small.
pub async fn collect_stream(mut stream: ByteStream) -> std::io::Result<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

/// Who is asking, plus free-form metadata copied into the ledger record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub actor: Actor,
    pub metadata: BTreeMap<String, String>,
}

impl OperationContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            metadata: BTreeMap::new(),
        }
    }

    pub fn system() -> Self {
        Self::new(Actor::System)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    Local,
    RemoteProxy,
}

/// A bounded-lifetime URL for direct object access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessDescriptor {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub sequence: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub path: StoragePath,
    pub byte_size: u64,
}

/// What a housekeeping pass removed from one class root.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Housekeeping {
    pub temp_files_removed: u64,
    pub partials_removed: u64,
}

#[async_trait]
pub trait StorageDriver: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> DriverKind;

    fn storage_class(&self) -> &StorageClass;

    /// Stores `content` at `path`, replacing any existing object, and returns the path.
    async fn save(
        &self,
        path: &StoragePath,
        content: ByteStream,
        content_type: Option<String>,
        ctx: &OperationContext,
    ) -> StorageResult<StoragePath>;

    /// Streams an object back. Fails with `NotFound` if it does not exist.
    async fn get(&self, path: &StoragePath, ctx: &OperationContext) -> StorageResult<ByteStream>;

    /// Removes an object. Removing a missing object succeeds.
    async fn delete(&self, path: &StoragePath, ctx: &OperationContext) -> StorageResult<()>;

    /// Removes every object under `prefix` and returns how many there were. The root prefix
    /// is rejected.
    async fn delete_prefix(
        &self,
        prefix: &StoragePrefix,
        ctx: &OperationContext,
    ) -> StorageResult<u64>;

    async fn exists(&self, path: &StoragePath) -> StorageResult<bool>;

    async fn list(&self, prefix: &StoragePrefix) -> StorageResult<Vec<StoragePath>>;

    /// Neither built-in driver can mint signed URLs.
    async fn url(
        &self,
        _path: &StoragePath,
        _ttl: Option<Duration>,
    ) -> StorageResult<Option<AccessDescriptor>> {
        Ok(None)
    }

    /// Opens a chunked upload and returns its session id.
    async fn init_upload(
        &self,
        path: &StoragePath,
        expected_total_bytes: Option<u64>,
        content_type: Option<String>,
        ctx: &OperationContext,
    ) -> StorageResult<String>;

    async fn upload_chunk(
        &self,
        session_id: &str,
        sequence: u64,
        chunk: Bytes,
    ) -> StorageResult<ChunkReceipt>;

    async fn complete_upload(
        &self,
        session_id: &str,
        ctx: &OperationContext,
    ) -> StorageResult<CompletedUpload>;

    async fn abort_upload(&self, session_id: &str, ctx: &OperationContext) -> StorageResult<()>;

    /// Confirms the backing store accepts writes.
    async fn health(&self) -> StorageResult<()>;

    /// Removes leftovers of interrupted writes older than `cutoff`. Drivers that own no disk
    /// have nothing to do.
    async fn housekeeping(&self, _cutoff: DateTime<Utc>) -> StorageResult<Housekeeping> {
        Ok(Housekeeping::default())
    }
}
