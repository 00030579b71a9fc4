//! Storage manager.
//!
//! The single entry point callers use to reach a storage class. It decides, from the
//! configured runtime role alone, which driver serves each class:
//!
//! | Role            | PHI-bearing class | Other class |
//! |-----------------|-------------------|-------------|
//! | `edge`          | remote proxy      | local disk  |
//! | `storage-owner` | local disk        | local disk  |
//! | `test`          | local disk        | local disk  |
//!
//! Drivers are built on first use and cached for the life of the process.

use crate::config::StorageConfig;
use crate::constants::{LEDGER_DB_FILENAME, SESSION_DB_FILENAME};
use crate::driver::{LocalDiskDriver, RemoteClient, RemoteProxyDriver, StorageDriver};
use crate::ledger::{AuditLedger, SqliteLedgerStore};
use crate::sessions::{SqliteSessionStore, UploadSessionTracker};
use crate::{StorageError, StorageResult};
use phistore_files::DiskStore;
use phistore_types::{RuntimeRole, StorageClass};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct StorageManager {
    config: StorageConfig,
    ledger: Option<Arc<AuditLedger>>,
    sessions: Option<Arc<UploadSessionTracker>>,
    remote: Option<Arc<RemoteClient>>,
    drivers: Mutex<HashMap<StorageClass, Arc<dyn StorageDriver>>>,
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("role", &self.config.role())
            .field("has_ledger", &self.ledger.is_some())
            .field("remote", &self.remote)
            .finish_non_exhaustive()
    }
}

impl StorageManager {
    /// Opens the ledger and session databases the role needs and, on the edge, the shared
    /// HTTP client.
    ///
    /// # Errors
    ///
    /// `Config` if the edge has a non-PHI class but no ledger directory, `Audit` or
    /// `SessionStore` if a database cannot be opened.
    pub fn new(config: StorageConfig) -> StorageResult<Self> {
        let role = config.role();
        let needs_local = match role {
            RuntimeRole::Edge => config.classes().iter().any(|c| !c.phi_bearing),
            RuntimeRole::StorageOwner | RuntimeRole::Test => true,
        };

        let (ledger, sessions) = if needs_local {
            let (ledger, sessions) = match (role, config.ledger_dir()) {
                (RuntimeRole::Test, _) => (
                    Arc::new(AuditLedger::in_memory(role)?),
                    Arc::new(SqliteSessionStore::in_memory().map_err(StorageError::from)?),
                ),
                (_, Some(dir)) => {
                    let ledger_store = SqliteLedgerStore::open(&dir.join(LEDGER_DB_FILENAME))?;
                    let session_store = SqliteSessionStore::open(&dir.join(SESSION_DB_FILENAME))
                        .map_err(StorageError::from)?;
                    tracing::info!(dir = %dir.display(), role = %role, "Opened storage databases");
                    (
                        Arc::new(AuditLedger::new(Arc::new(ledger_store), role)),
                        Arc::new(session_store),
                    )
                }
                (_, None) => {
                    return Err(StorageError::Config(format!(
                        "role {role} keeps local storage classes and needs a ledger directory"
                    )))
                }
            };
            let tracker = Arc::new(UploadSessionTracker::new(
                sessions,
                Arc::clone(&ledger),
                config.session_idle_timeout,
            ));
            (Some(ledger), Some(tracker))
        } else {
            (None, None)
        };

        let remote = match (role, config.remote()) {
            (RuntimeRole::Edge, Some(settings)) => Some(Arc::new(RemoteClient::new(settings)?)),
            _ => None,
        };

        Ok(Self {
            config,
            ledger,
            sessions,
            remote,
            drivers: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the driver for `class`, building it on first use.
    ///
    /// # Errors
    ///
    /// `InvalidInput` for a class that is not configured; `Config` if the class root cannot
    /// be opened.
    pub fn get_storage(&self, class: &StorageClass) -> StorageResult<Arc<dyn StorageDriver>> {
        let mut drivers = self
            .drivers
            .lock()
            .map_err(|_| StorageError::Config("driver cache lock poisoned".into()))?;
        if let Some(driver) = drivers.get(class) {
            return Ok(Arc::clone(driver));
        }

        let class_config = self
            .config
            .class(class)
            .ok_or_else(|| StorageError::InvalidInput(format!("unknown storage class '{class}'")))?;

        let driver: Arc<dyn StorageDriver> =
            match (self.config.role(), class_config.phi_bearing, &self.remote) {
                (RuntimeRole::Edge, true, Some(client)) => {
                    Arc::new(RemoteProxyDriver::new(class.clone(), Arc::clone(client)))
                }
                (RuntimeRole::Edge, true, None) => {
                    return Err(StorageError::Config(format!(
                        "class '{class}' is PHI-bearing and the edge has no remote configured"
                    )))
                }
                _ => {
                    let (ledger, sessions) = match (&self.ledger, &self.sessions) {
                        (Some(ledger), Some(sessions)) => (ledger, sessions),
                        _ => {
                            return Err(StorageError::Config(format!(
                                "class '{class}' needs a local ledger"
                            )))
                        }
                    };
                    let disk = DiskStore::open(&class_config.root)?;
                    Arc::new(LocalDiskDriver::new(
                        class.clone(),
                        Arc::new(disk),
                        Arc::clone(ledger),
                        Arc::clone(sessions),
                        class_config.cleanup_after,
                    ))
                }
            };

        tracing::debug!(class = %class, kind = ?driver.kind(), "Storage driver ready");
        drivers.insert(class.clone(), Arc::clone(&driver));
        Ok(driver)
    }

    pub fn role(&self) -> RuntimeRole {
        self.config.role()
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn classes(&self) -> impl Iterator<Item = &StorageClass> {
        self.config.classes().iter().map(|c| &c.class)
    }

    /// The audit ledger, when this process keeps local classes.
    pub fn ledger(&self) -> Option<&Arc<AuditLedger>> {
        self.ledger.as_ref()
    }

    pub fn sessions(&self) -> Option<&Arc<UploadSessionTracker>> {
        self.sessions.as_ref()
    }
}
