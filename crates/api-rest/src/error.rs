use api_shared::{Envelope, ResponseStatus};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use phistore_core::StorageError;

/// A failed request, rendered as an error [`Envelope`].
#[derive(Debug)]
pub struct ApiError {
    error: StorageError,
    payload: Option<serde_json::Value>,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    /// Attaches a payload to the error envelope (current session state for rejected chunks).
    pub fn with_payload(mut self, payload: impl serde::Serialize) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        Self {
            error,
            payload: None,
        }
    }
}

pub fn response_status(error: &StorageError) -> ResponseStatus {
    match error {
        StorageError::NotFound(_) => ResponseStatus::NotFound,
        StorageError::WriteError(_) | StorageError::Audit(_) | StorageError::SessionStore(_) => {
            ResponseStatus::WriteError
        }
        StorageError::AuthenticationError(_) => ResponseStatus::AuthError,
        StorageError::ServiceUnavailable(_) | StorageError::Config(_) => {
            ResponseStatus::ServiceUnavailable
        }
        StorageError::OutOfOrderChunk { .. } => ResponseStatus::OutOfOrderChunk,
        StorageError::SessionConflict(_) => ResponseStatus::SessionConflict,
        StorageError::SessionNotFound(_) => ResponseStatus::SessionNotFound,
        StorageError::PathTraversalRejected(_) => ResponseStatus::PathRejected,
        StorageError::InvalidInput(_) => ResponseStatus::BadRequest,
    }
}

/// Builds a response from a status and envelope.
pub fn envelope_response<T: serde::Serialize>(envelope: Envelope<T>) -> Response {
    let code = StatusCode::from_u16(envelope.status.http_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(envelope)).into_response()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = response_status(&self.error);
        match status {
            ResponseStatus::WriteError | ResponseStatus::ServiceUnavailable => {
                tracing::error!(code = self.error.code(), "Request failed: {}", self.error)
            }
            _ => tracing::debug!(code = self.error.code(), "Request rejected: {}", self.error),
        }

        let mut envelope: Envelope<serde_json::Value> =
            Envelope::error(status, self.error.to_string());
        if let StorageError::OutOfOrderChunk { expected, .. } = &self.error {
            envelope.expected_sequence = Some(*expected);
        }
        envelope.payload = self.payload;
        envelope_response(envelope)
    }
}
