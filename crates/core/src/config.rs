//! Storage runtime configuration.
//!
//! Configuration is resolved once at process startup and passed into the storage manager,
//! the service and the reaper. Nothing reads environment variables while handling a request.
//!
//! [`StorageConfig::from_env`] is the only place the process environment is consulted; it
//! delegates to [`StorageConfig::from_lookup`], which takes any key lookup so the parsing
//! rules can be tested without touching the real environment.

use crate::constants::*;
use crate::retry::RetryPolicy;
use crate::{StorageError, StorageResult};
use phistore_types::{RuntimeRole, StorageClass};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One storage class: where it lives and how long its objects are kept.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClassConfig {
    pub class: StorageClass,
    pub root: PathBuf,
    /// PHI-bearing classes are never written locally on the edge.
    pub phi_bearing: bool,
    /// When set, objects are removed by the reaper this long after creation.
    pub cleanup_after: Option<Duration>,
}

/// How the edge reaches the storage owner.
#[derive(Clone)]
pub struct RemoteSettings {
    pub base_url: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_in_flight: usize,
    pub pool_idle_per_host: usize,
    pub retry: RetryPolicy,
    pub chunk_threshold: usize,
    pub chunk_size: usize,
}

impl std::fmt::Debug for RemoteSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("max_in_flight", &self.max_in_flight)
            .field("retry", &self.retry)
            .field("chunk_threshold", &self.chunk_threshold)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl RemoteSettings {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> StorageResult<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_owned();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(StorageError::Config(format!(
                "remote URL must start with http:// or https://, got '{base_url}'"
            )));
        }
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(StorageError::Config("API key cannot be empty".into()));
        }
        Ok(Self {
            base_url,
            api_key,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            pool_idle_per_host: DEFAULT_POOL_IDLE_PER_HOST,
            retry: RetryPolicy {
                max_attempts: DEFAULT_RETRY_ATTEMPTS,
                base_delay: DEFAULT_RETRY_BASE_DELAY,
                max_delay: DEFAULT_RETRY_MAX_DELAY,
            },
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE_BYTES,
        })
    }
}

/// Storage configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct StorageConfig {
    role: RuntimeRole,
    classes: Vec<ClassConfig>,
    ledger_dir: Option<PathBuf>,
    remote: Option<RemoteSettings>,
    /// Shared secret the storage service requires of its callers.
    api_key: Option<String>,
    pub session_idle_timeout: Duration,
    pub reaper_interval: Duration,
    pub abandoned_after: Duration,
    pub max_request_bytes: usize,
    pub bind_addr: String,
}

impl StorageConfig {
    /// Creates a config with default tunables.
    ///
    /// Fails if a class is declared twice or if the role cannot serve a PHI-bearing class
    /// with what it was given (the edge needs `remote`).
    pub fn new(
        role: RuntimeRole,
        classes: Vec<ClassConfig>,
        ledger_dir: Option<PathBuf>,
        remote: Option<RemoteSettings>,
        api_key: Option<String>,
    ) -> StorageResult<Self> {
        for (i, class) in classes.iter().enumerate() {
            if classes[..i].iter().any(|c| c.class == class.class) {
                return Err(StorageError::Config(format!(
                    "storage class '{}' declared twice",
                    class.class
                )));
            }
        }

        if role == RuntimeRole::Edge && classes.iter().any(|c| c.phi_bearing) && remote.is_none()
        {
            return Err(StorageError::Config(
                "edge role requires PHISTORE_REMOTE_URL and PHISTORE_API_KEY".into(),
            ));
        }

        if role == RuntimeRole::StorageOwner && ledger_dir.is_none() {
            return Err(StorageError::Config(
                "storage-owner role requires a ledger directory".into(),
            ));
        }

        if let Some(remote) = &remote {
            if remote.chunk_size == 0 || remote.chunk_threshold == 0 {
                return Err(StorageError::Config(
                    "chunk size and chunk threshold must be greater than zero".into(),
                ));
            }
            if remote.max_in_flight == 0 {
                return Err(StorageError::Config(
                    "max in-flight requests must be greater than zero".into(),
                ));
            }
        }

        Ok(Self {
            role,
            classes,
            ledger_dir,
            remote,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            session_idle_timeout: DEFAULT_SESSION_IDLE,
            reaper_interval: DEFAULT_REAPER_INTERVAL,
            abandoned_after: DEFAULT_ABANDONED_AFTER,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            bind_addr: DEFAULT_BIND_ADDR.to_owned(),
        })
    }

    /// Reads configuration from the process environment.
    pub fn from_env() -> StorageResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup using the `PHISTORE_*` names.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> StorageResult<Self> {
        let role = parse_role_value(lookup("PHISTORE_ROLE"))?;

        let cleanup_after = parse_secs_value(
            "PHISTORE_CLEANUP_AFTER_SECS",
            lookup("PHISTORE_CLEANUP_AFTER_SECS"),
            DEFAULT_CLEANUP_AFTER,
        )?;

        let mut classes = vec![
            ClassConfig {
                class: StorageClass::submission(),
                root: dir_value(lookup("PHISTORE_SUBMISSION_DIR"), DEFAULT_SUBMISSION_DIR),
                phi_bearing: true,
                cleanup_after: None,
            },
            ClassConfig {
                class: StorageClass::workspace(),
                root: dir_value(lookup("PHISTORE_WORKSPACE_DIR"), DEFAULT_WORKSPACE_DIR),
                phi_bearing: true,
                cleanup_after: Some(cleanup_after),
            },
        ];
        if let Some(scratch) = non_empty(lookup("PHISTORE_SCRATCH_DIR")) {
            classes.push(ClassConfig {
                class: StorageClass::new("scratch")?,
                root: PathBuf::from(scratch),
                phi_bearing: false,
                cleanup_after: Some(cleanup_after),
            });
        }

        let ledger_dir = match role {
            RuntimeRole::StorageOwner => {
                Some(dir_value(lookup("PHISTORE_LEDGER_DIR"), DEFAULT_LEDGER_DIR))
            }
            // The edge keeps a ledger only when it has local classes to audit.
            RuntimeRole::Edge => non_empty(lookup("PHISTORE_LEDGER_DIR")).map(PathBuf::from),
            RuntimeRole::Test => None,
        };

        let api_key = non_empty(lookup("PHISTORE_API_KEY"));

        let remote = match (role, non_empty(lookup("PHISTORE_REMOTE_URL"))) {
            (RuntimeRole::Edge, Some(url)) => {
                let key = api_key.clone().ok_or_else(|| {
                    StorageError::Config("PHISTORE_API_KEY is required for the edge role".into())
                })?;
                let mut remote = RemoteSettings::new(url, key)?;
                remote.chunk_threshold = parse_usize_value(
                    "PHISTORE_CHUNK_THRESHOLD_BYTES",
                    lookup("PHISTORE_CHUNK_THRESHOLD_BYTES"),
                    DEFAULT_CHUNK_THRESHOLD_BYTES,
                )?;
                remote.chunk_size = parse_usize_value(
                    "PHISTORE_CHUNK_SIZE_BYTES",
                    lookup("PHISTORE_CHUNK_SIZE_BYTES"),
                    DEFAULT_CHUNK_SIZE_BYTES,
                )?;
                remote.retry.max_attempts = parse_usize_value(
                    "PHISTORE_RETRY_ATTEMPTS",
                    lookup("PHISTORE_RETRY_ATTEMPTS"),
                    DEFAULT_RETRY_ATTEMPTS as usize,
                )?
                .clamp(1, u32::MAX as usize) as u32;
                remote.request_timeout = parse_secs_value(
                    "PHISTORE_REQUEST_TIMEOUT_SECS",
                    lookup("PHISTORE_REQUEST_TIMEOUT_SECS"),
                    DEFAULT_REQUEST_TIMEOUT,
                )?;
                remote.max_in_flight = parse_usize_value(
                    "PHISTORE_MAX_IN_FLIGHT",
                    lookup("PHISTORE_MAX_IN_FLIGHT"),
                    DEFAULT_MAX_IN_FLIGHT,
                )?;
                Some(remote)
            }
            _ => None,
        };

        let mut config = Self::new(role, classes, ledger_dir, remote, api_key)?;
        config.session_idle_timeout = parse_secs_value(
            "PHISTORE_SESSION_IDLE_SECS",
            lookup("PHISTORE_SESSION_IDLE_SECS"),
            DEFAULT_SESSION_IDLE,
        )?;
        config.reaper_interval = parse_secs_value(
            "PHISTORE_REAPER_INTERVAL_SECS",
            lookup("PHISTORE_REAPER_INTERVAL_SECS"),
            DEFAULT_REAPER_INTERVAL,
        )?;
        config.abandoned_after = parse_secs_value(
            "PHISTORE_ABANDONED_AFTER_SECS",
            lookup("PHISTORE_ABANDONED_AFTER_SECS"),
            DEFAULT_ABANDONED_AFTER,
        )?;
        config.max_request_bytes = parse_usize_value(
            "PHISTORE_MAX_REQUEST_BYTES",
            lookup("PHISTORE_MAX_REQUEST_BYTES"),
            DEFAULT_MAX_REQUEST_BYTES,
        )?;
        if let Some(addr) = non_empty(lookup("PHISTORE_ADDR")) {
            config.bind_addr = addr;
        }
        Ok(config)
    }

    pub fn role(&self) -> RuntimeRole {
        self.role
    }

    pub fn classes(&self) -> &[ClassConfig] {
        &self.classes
    }

    pub fn class(&self, class: &StorageClass) -> Option<&ClassConfig> {
        self.classes.iter().find(|c| &c.class == class)
    }

    pub fn ledger_dir(&self) -> Option<&Path> {
        self.ledger_dir.as_deref()
    }

    pub fn remote(&self) -> Option<&RemoteSettings> {
        self.remote.as_ref()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn dir_value(value: Option<String>, default: &str) -> PathBuf {
    PathBuf::from(non_empty(value).unwrap_or_else(|| default.to_owned()))
}

/// Parses `PHISTORE_ROLE`. There is no default: a process must say which tier it is.
pub fn parse_role_value(value: Option<String>) -> StorageResult<RuntimeRole> {
    let raw = non_empty(value)
        .ok_or_else(|| StorageError::Config("PHISTORE_ROLE must be set".into()))?;
    raw.parse()
        .map_err(|e: phistore_types::IdentError| StorageError::Config(e.to_string()))
}

pub fn parse_usize_value(name: &str, value: Option<String>, default: usize) -> StorageResult<usize> {
    match non_empty(value) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            StorageError::Config(format!("{name} must be a non-negative integer, got '{raw}'"))
        }),
    }
}

pub fn parse_secs_value(
    name: &str,
    value: Option<String>,
    default: Duration,
) -> StorageResult<Duration> {
    match non_empty(value) {
        None => Ok(default),
        Some(raw) => raw.parse::<u64>().map(Duration::from_secs).map_err(|_| {
            StorageError::Config(format!("{name} must be a whole number of seconds, got '{raw}'"))
        }),
    }
}
