//! # PHI Store Types
//!
//! Validated value types shared by every PHI Store crate.
//!
//! Each type guarantees its invariant once constructed, so code that receives one can skip
//! re-validation:
//!
//! - [`NonEmptyText`]: trimmed text with at least one non-whitespace character
//! - [`StoragePath`] / [`StoragePrefix`]: logical storage keys that can never escape a root
//! - [`StorageClass`]: a named storage namespace (`submission`, `workspace`, ...)
//! - [`RuntimeRole`]: which tier the current process plays
//! - [`Actor`]: who performed a storage operation

mod path;
mod text;

pub use path::{PathError, StoragePath, StoragePrefix, MAX_PATH_LEN};
pub use text::{NonEmptyText, TextError};

use std::fmt;
use std::str::FromStr;

/// Errors raised when parsing identifiers such as storage classes, roles and actors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentError {
    #[error("invalid storage class '{0}': use lowercase letters, digits and '-'")]
    StorageClass(String),
    #[error("invalid runtime role '{0}': expected edge, storage-owner or test")]
    RuntimeRole(String),
    #[error("invalid actor '{0}': expected 'system' or 'user:<id>'")]
    Actor(String),
}

/// A named storage namespace with its own root directory and cleanup policy.
///
/// The same relative path may exist independently in two classes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageClass(String);

impl StorageClass {
    pub const SUBMISSION: &'static str = "submission";
    pub const WORKSPACE: &'static str = "workspace";

    pub fn new(name: impl AsRef<str>) -> Result<Self, IdentError> {
        let name = name.as_ref().trim();
        let valid = !name.is_empty()
            && name.len() <= 64
            && name
                .bytes()
                .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'-'));
        if !valid {
            return Err(IdentError::StorageClass(name.to_owned()));
        }
        Ok(Self(name.to_owned()))
    }

    pub fn submission() -> Self {
        Self(Self::SUBMISSION.to_owned())
    }

    pub fn workspace() -> Self {
        Self(Self::WORKSPACE.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StorageClass {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl serde::Serialize for StorageClass {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for StorageClass {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(&s).map_err(serde::de::Error::custom)
    }
}

/// The role the current process plays in the deployment.
///
/// - `Edge` faces end users and must never persist PHI-bearing bytes locally.
/// - `StorageOwner` has exclusive mount access to the disk.
/// - `Test` behaves like a storage owner backed by in-memory bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeRole {
    Edge,
    StorageOwner,
    Test,
}

impl RuntimeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeRole::Edge => "edge",
            RuntimeRole::StorageOwner => "storage-owner",
            RuntimeRole::Test => "test",
        }
    }
}

impl fmt::Display for RuntimeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuntimeRole {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "edge" => Ok(RuntimeRole::Edge),
            "storage-owner" | "storage_owner" | "owner" => Ok(RuntimeRole::StorageOwner),
            "test" => Ok(RuntimeRole::Test),
            _ => Err(IdentError::RuntimeRole(s.to_owned())),
        }
    }
}

/// Who performed a storage operation, as recorded in the audit ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Actor {
    System,
    User(NonEmptyText),
}

impl Actor {
    pub fn user(id: impl AsRef<str>) -> Result<Self, IdentError> {
        let id = id.as_ref();
        NonEmptyText::new(id)
            .map(Actor::User)
            .map_err(|_| IdentError::Actor(id.to_owned()))
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Actor::System)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => f.write_str("system"),
            Actor::User(id) => write!(f, "user:{}", id),
        }
    }
}

impl FromStr for Actor {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "system" {
            return Ok(Actor::System);
        }
        match s.strip_prefix("user:") {
            Some(id) => Actor::user(id),
            None => Err(IdentError::Actor(s.to_owned())),
        }
    }
}

impl serde::Serialize for Actor {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Actor {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_class_validation() {
        assert_eq!(StorageClass::new("workspace").unwrap(), StorageClass::workspace());
        assert!(StorageClass::new("Workspace").is_err());
        assert!(StorageClass::new("").is_err());
        assert!(StorageClass::new("../etc").is_err());
        assert!(StorageClass::new("scratch-2").is_ok());
    }

    #[test]
    fn test_runtime_role_parse() {
        assert_eq!("edge".parse::<RuntimeRole>().unwrap(), RuntimeRole::Edge);
        assert_eq!(
            "storage-owner".parse::<RuntimeRole>().unwrap(),
            RuntimeRole::StorageOwner
        );
        assert_eq!(
            "STORAGE_OWNER".parse::<RuntimeRole>().unwrap(),
            RuntimeRole::StorageOwner
        );
        assert_eq!("test".parse::<RuntimeRole>().unwrap(), RuntimeRole::Test);
        assert!("public".parse::<RuntimeRole>().is_err());
    }

    #[test]
    fn test_actor_round_trips_through_display() {
        let actor: Actor = "user:clinician-7".parse().unwrap();
        assert_eq!(actor.to_string(), "user:clinician-7");
        assert_eq!("system".parse::<Actor>().unwrap(), Actor::System);
        assert!("user:".parse::<Actor>().is_err());
        assert!("bob".parse::<Actor>().is_err());
    }

    #[test]
    fn test_actor_serialises_as_string() {
        let json = serde_json::to_string(&Actor::System).unwrap();
        assert_eq!(json, "\"system\"");
        let back: Actor = serde_json::from_str("\"user:42\"").unwrap();
        assert_eq!(back, Actor::user("42").unwrap());
    }
}
