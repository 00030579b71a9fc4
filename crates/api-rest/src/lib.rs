//! # API REST
//!
//! The storage service: the storage-owner side of the PHI Store HTTP protocol.
//!
//! Handles:
//! - HTTP endpoints with axum, one per storage operation
//! - Shared-secret authentication in front of every `/storage` route
//! - Request body limits and request tracing
//! - OpenAPI/Swagger documentation
//!
//! Uses `api-shared` for the wire types and `phistore-core` for everything that touches disk.

#![warn(rust_2018_idioms)]

pub mod error;
pub mod handlers;

use api_shared::{
    routes, ApiKey, ChunkQuery, ChunkRes, ClassHealth, CompleteUploadRes, DeletePrefixReq,
    DeletePrefixRes, DeleteReq, Envelope, ExistsRes, HealthRes, InitUploadReq, InitUploadRes,
    ListQuery, ListRes, ObjectQuery, ResponseStatus, SaveRes, SessionReq, StatusBody,
    API_KEY_HEADER,
};
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use phistore_core::StorageManager;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StorageManager>,
    pub api_key: ApiKey,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::save,
        handlers::get,
        handlers::delete,
        handlers::delete_prefix,
        handlers::exists,
        handlers::list,
        handlers::upload_init,
        handlers::upload_chunk,
        handlers::upload_complete,
        handlers::upload_abort,
        handlers::health,
    ),
    components(schemas(
        ResponseStatus,
        StatusBody,
        ObjectQuery,
        ListQuery,
        DeleteReq,
        DeletePrefixReq,
        SaveRes,
        ExistsRes,
        ListRes,
        DeletePrefixRes,
        InitUploadReq,
        InitUploadRes,
        ChunkQuery,
        ChunkRes,
        SessionReq,
        CompleteUploadRes,
        ClassHealth,
        HealthRes,
    ))
)]
pub struct ApiDoc;

/// Rejects any request that does not carry the shared secret.
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match state.api_key.validate(provided) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::warn!(uri = %request.uri(), "Rejected request: {e}");
            error::envelope_response(Envelope::<()>::error(ResponseStatus::AuthError, e.to_string()))
        }
    }
}

/// Builds the service router. Every `/storage` route sits behind the API key check; the
/// Swagger UI does not.
pub fn app(state: AppState) -> Router {
    let max_request_bytes = state.manager.config().max_request_bytes;

    let storage = Router::new()
        .route(routes::SAVE, post(handlers::save))
        .route(routes::GET, get(handlers::get))
        .route(routes::DELETE, post(handlers::delete))
        .route(routes::DELETE_PREFIX, post(handlers::delete_prefix))
        .route(routes::EXISTS, get(handlers::exists))
        .route(routes::LIST, get(handlers::list))
        .route(routes::UPLOAD_INIT, post(handlers::upload_init))
        .route(routes::UPLOAD_CHUNK, post(handlers::upload_chunk))
        .route(routes::UPLOAD_COMPLETE, post(handlers::upload_complete))
        .route(routes::UPLOAD_ABORT, post(handlers::upload_abort))
        .route(routes::HEALTH, get(handlers::health))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(DefaultBodyLimit::max(max_request_bytes))
        .layer(RequestBodyLimitLayer::new(max_request_bytes));

    Router::new()
        .merge(storage)
        .merge(
            SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
