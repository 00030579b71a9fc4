//! # API Shared
//!
//! Shared definitions for the PHI Store HTTP protocol.
//!
//! Contains:
//! - The wire protocol (`protocol` module): routes, headers, request and response bodies
//! - Shared-secret validation used by the storage service
//! - Health report types
//!
//! Used by `api-rest` (server side) and by the remote proxy driver in `phistore-core`
//! (client side), so both ends always agree on the protocol.

pub mod auth;
pub mod health;
pub mod protocol;

pub use auth::{ApiKey, AuthError};
pub use health::{ClassHealth, HealthRes, HealthService};
pub use protocol::*;
