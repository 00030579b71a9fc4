//! # PHI Store Core
//!
//! Storage logic for moving PHI-class files between the edge and storage-owner tiers.
//!
//! This crate contains:
//! - The [`StorageDriver`] interface and its two implementations: local disk and remote proxy
//! - The append-only audit ledger every storage operation writes to
//! - Chunked upload sessions for large payloads
//! - Runtime-role driver selection in [`StorageManager`]
//! - The [`WorkspaceReaper`] that removes transient files
//!
//! **No API concerns**: HTTP handlers and authentication middleware belong in `api-rest`;
//! wire types shared by server and client live in `api-shared`.

mod blocking;
pub mod config;
pub mod constants;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod manager;
pub mod reaper;
pub mod retry;
pub mod sessions;

pub use config::{ClassConfig, RemoteSettings, StorageConfig};
pub use driver::{
    collect_stream, stream_from_bytes, AccessDescriptor, ByteStream, ChunkReceipt,
    CompletedUpload, DriverKind, Housekeeping, OperationContext, StorageDriver,
};
pub use error::{StorageError, StorageResult};
pub use ledger::{AuditLedger, OperationAction, StorageOperationRecord};
pub use manager::StorageManager;
pub use reaper::{ReaperReport, WorkspaceReaper};
pub use sessions::{UploadSession, UploadSessionTracker};

pub use phistore_types::{Actor, RuntimeRole, StorageClass, StoragePath, StoragePrefix};
