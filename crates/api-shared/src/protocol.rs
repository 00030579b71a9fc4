//! Wire protocol between the edge tier and the storage-owner tier.
//!
//! Every JSON response is an [`Envelope`] carrying a [`ResponseStatus`] and, on success, a
//! payload. The one exception is a successful `get`, which streams the raw object bytes.
//! Object paths and class names travel as plain strings and are validated by the service,
//! so a malformed path comes back as `path-rejected` rather than a decode failure.

use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Header carrying the pre-shared key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the caller context: base64 of the JSON form of [`WireContext`].
pub const CONTEXT_HEADER: &str = "x-storage-context";

pub mod routes {
    pub const SAVE: &str = "/storage/save";
    pub const GET: &str = "/storage/get";
    pub const DELETE: &str = "/storage/delete";
    pub const DELETE_PREFIX: &str = "/storage/delete-prefix";
    pub const EXISTS: &str = "/storage/exists";
    pub const LIST: &str = "/storage/list";
    pub const UPLOAD_INIT: &str = "/storage/upload/init";
    pub const UPLOAD_CHUNK: &str = "/storage/upload/chunk";
    pub const UPLOAD_COMPLETE: &str = "/storage/upload/complete";
    pub const UPLOAD_ABORT: &str = "/storage/upload/abort";
    pub const HEALTH: &str = "/storage/health";
}

/// Who is calling and with what caller metadata.
///
/// Encoded as base64 JSON so arbitrary UTF-8 survives the trip through an HTTP header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WireContext {
    /// `system` or `user:<id>`
    pub actor: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl WireContext {
    pub fn encode(&self) -> String {
        // Serialising a struct of strings cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        general_purpose::STANDARD.encode(json)
    }

    pub fn decode(header: &str) -> Result<Self, String> {
        let json = general_purpose::STANDARD
            .decode(header.trim())
            .map_err(|e| format!("context header is not base64: {e}"))?;
        serde_json::from_slice(&json).map_err(|e| format!("context header is not valid JSON: {e}"))
    }
}

/// Outcome vocabulary shared by every endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseStatus {
    Ok,
    NotFound,
    WriteError,
    AuthError,
    ServiceUnavailable,
    OutOfOrderChunk,
    SessionConflict,
    SessionNotFound,
    PathRejected,
    BadRequest,
}

impl ResponseStatus {
    /// HTTP status code the service answers with for this outcome.
    pub fn http_code(&self) -> u16 {
        match self {
            ResponseStatus::Ok => 200,
            ResponseStatus::NotFound | ResponseStatus::SessionNotFound => 404,
            ResponseStatus::PathRejected | ResponseStatus::BadRequest => 400,
            ResponseStatus::AuthError => 401,
            ResponseStatus::OutOfOrderChunk | ResponseStatus::SessionConflict => 409,
            ResponseStatus::WriteError => 507,
            ResponseStatus::ServiceUnavailable => 503,
        }
    }

    /// Whether the caller may repeat the request. Only an unavailable owner qualifies; a
    /// write error (disk full, permission denied) will not clear by retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, ResponseStatus::ServiceUnavailable)
    }
}

/// Structured response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Set with `out-of-order-chunk`: the sequence number the session expects next.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<T>,
}

impl<T> Envelope<T> {
    pub fn ok(payload: T) -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: None,
            expected_sequence: None,
            payload: Some(payload),
        }
    }

    pub fn error(status: ResponseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            expected_sequence: None,
            payload: None,
        }
    }
}

impl Envelope<()> {
    pub fn ok_empty() -> Self {
        Self {
            status: ResponseStatus::Ok,
            message: None,
            expected_sequence: None,
            payload: None,
        }
    }
}

/// Non-generic view of an envelope used for OpenAPI documentation of error responses.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StatusBody {
    pub status: ResponseStatus,
    pub message: Option<String>,
    pub expected_sequence: Option<u64>,
}

/// Query addressing one object: `get`, `exists`, and the small-payload `save`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ObjectQuery {
    pub class: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListQuery {
    pub class: String,
    #[serde(default)]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeleteReq {
    pub class: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DeletePrefixReq {
    pub class: String,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SaveRes {
    pub path: String,
    pub byte_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ExistsRes {
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ListRes {
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeletePrefixRes {
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InitUploadReq {
    pub class: String,
    pub path: String,
    pub expected_total_bytes: Option<u64>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct InitUploadRes {
    pub session_id: String,
}

/// Query for `POST /storage/upload/chunk`; the body is the raw chunk.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChunkQuery {
    pub class: String,
    pub session_id: String,
    pub sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ChunkRes {
    pub sequence: u64,
    pub bytes_received: u64,
}

/// Body for `complete` and `abort`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionReq {
    pub class: String,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CompleteUploadRes {
    pub path: String,
    pub byte_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialises_kebab_case() {
        let json = serde_json::to_string(&ResponseStatus::OutOfOrderChunk).unwrap();
        assert_eq!(json, "\"out-of-order-chunk\"");
    }

    #[test]
    fn test_error_envelope_omits_payload() {
        let env: Envelope<SaveRes> = Envelope::error(ResponseStatus::NotFound, "missing");
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["status"], "not-found");
        assert!(json.get("payload").is_none());

        let back: Envelope<SaveRes> = serde_json::from_value(json).unwrap();
        assert_eq!(back.payload, None);
        assert_eq!(back.message.as_deref(), Some("missing"));
    }

    #[test]
    fn test_wire_context_survives_non_ascii() {
        let mut ctx = WireContext {
            actor: "user:zoë".into(),
            metadata: BTreeMap::new(),
        };
        ctx.metadata.insert("cohort".into(), "Åland-7".into());

        let header = ctx.encode();
        assert!(header.is_ascii());
        assert_eq!(WireContext::decode(&header).unwrap(), ctx);
        assert!(WireContext::decode("%%%").is_err());
    }

    #[test]
    fn test_http_codes_separate_transient_from_permanent() {
        assert_eq!(ResponseStatus::AuthError.http_code(), 401);
        assert_eq!(ResponseStatus::PathRejected.http_code(), 400);
        assert_eq!(ResponseStatus::ServiceUnavailable.http_code(), 503);
        assert_eq!(ResponseStatus::OutOfOrderChunk.http_code(), 409);
        assert_eq!(ResponseStatus::WriteError.http_code(), 507);

        assert!(ResponseStatus::ServiceUnavailable.is_transient());
        assert!(!ResponseStatus::WriteError.is_transient());
        assert!(!ResponseStatus::AuthError.is_transient());
        assert!(!ResponseStatus::SessionNotFound.is_transient());
    }
}
