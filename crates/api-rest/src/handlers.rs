//! Route handlers. Each one resolves the class through the storage manager and hands the
//! request to that class's driver.

use crate::error::{envelope_response, ApiError, ApiResult};
use crate::AppState;
use api_shared::{
    ChunkQuery, ChunkRes, ClassHealth, CompleteUploadRes, DeletePrefixReq, DeletePrefixRes,
    DeleteReq, Envelope, ExistsRes, HealthRes, HealthService, InitUploadReq, InitUploadRes,
    ListQuery, ListRes, ObjectQuery, ResponseStatus, SaveRes, SessionReq, StatusBody,
    WireContext, CONTEXT_HEADER,
};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures::TryStreamExt;
use phistore_core::{
    Actor, ByteStream, OperationContext, StorageClass, StorageDriver, StorageError, StoragePath,
    StoragePrefix,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reads the caller context header. Requests without one act as `system`.
fn operation_context(headers: &HeaderMap) -> Result<OperationContext, StorageError> {
    let Some(raw) = headers.get(CONTEXT_HEADER) else {
        return Ok(OperationContext::system());
    };
    let raw = raw
        .to_str()
        .map_err(|_| StorageError::InvalidInput("context header is not ASCII".into()))?;
    let wire = WireContext::decode(raw).map_err(StorageError::InvalidInput)?;
    let actor: Actor = wire.actor.parse()?;
    Ok(OperationContext {
        actor,
        metadata: wire.metadata,
    })
}

fn driver(state: &AppState, class: &str) -> Result<Arc<dyn StorageDriver>, StorageError> {
    let class = StorageClass::new(class)?;
    state.manager.get_storage(&class)
}

#[utoipa::path(
    post,
    path = "/storage/save",
    params(
        ("class" = String, Query, description = "Storage class"),
        ("path" = String, Query, description = "Object path within the class")
    ),
    request_body(content = String, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Object stored", body = SaveRes),
        (status = 400, description = "Invalid class or path", body = StatusBody),
        (status = 401, description = "Missing or invalid API key", body = StatusBody),
        (status = 507, description = "Write failed", body = StatusBody)
    )
)]
/// Stores the request body as one object, streaming it to disk.
pub async fn save(
    State(state): State<AppState>,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Json<Envelope<SaveRes>>> {
    let ctx = operation_context(&headers)?;
    let driver = driver(&state, &query.class)?;
    let path = StoragePath::parse(&query.path).map_err(StorageError::from)?;
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let counted = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&counted);
    let content: ByteStream = Box::pin(
        body.into_data_stream()
            .inspect_ok(move |chunk| {
                counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            })
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
    );

    let stored = driver.save(&path, content, content_type, &ctx).await?;
    Ok(Json(Envelope::ok(SaveRes {
        path: stored.to_string(),
        byte_size: counted.load(Ordering::Relaxed),
    })))
}

#[utoipa::path(
    get,
    path = "/storage/get",
    params(
        ("class" = String, Query, description = "Storage class"),
        ("path" = String, Query, description = "Object path within the class")
    ),
    responses(
        (status = 200, description = "Object bytes", body = String, content_type = "application/octet-stream"),
        (status = 404, description = "No such object", body = StatusBody)
    )
)]
/// Streams an object back as the raw response body.
pub async fn get(
    State(state): State<AppState>,
    Query(query): Query<ObjectQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ctx = operation_context(&headers)?;
    let driver = driver(&state, &query.class)?;
    let path = StoragePath::parse(&query.path).map_err(StorageError::from)?;
    let stream = driver.get(&path, &ctx).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        Body::from_stream(stream),
    )
        .into_response())
}

#[utoipa::path(
    post,
    path = "/storage/delete",
    request_body = DeleteReq,
    responses(
        (status = 200, description = "Object removed or already absent", body = StatusBody)
    )
)]
pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeleteReq>,
) -> ApiResult<Json<Envelope<()>>> {
    let ctx = operation_context(&headers)?;
    let driver = driver(&state, &req.class)?;
    let path = StoragePath::parse(&req.path).map_err(StorageError::from)?;
    driver.delete(&path, &ctx).await?;
    Ok(Json(Envelope::ok_empty()))
}

#[utoipa::path(
    post,
    path = "/storage/delete-prefix",
    request_body = DeletePrefixReq,
    responses(
        (status = 200, description = "Number of objects removed", body = DeletePrefixRes),
        (status = 400, description = "Empty or invalid prefix", body = StatusBody)
    )
)]
pub async fn delete_prefix(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeletePrefixReq>,
) -> ApiResult<Json<Envelope<DeletePrefixRes>>> {
    let ctx = operation_context(&headers)?;
    let driver = driver(&state, &req.class)?;
    let prefix = StoragePrefix::parse(&req.prefix).map_err(StorageError::from)?;
    let count = driver.delete_prefix(&prefix, &ctx).await?;
    Ok(Json(Envelope::ok(DeletePrefixRes { count })))
}

#[utoipa::path(
    get,
    path = "/storage/exists",
    params(
        ("class" = String, Query, description = "Storage class"),
        ("path" = String, Query, description = "Object path within the class")
    ),
    responses((status = 200, description = "Whether the object exists", body = ExistsRes))
)]
pub async fn exists(
    State(state): State<AppState>,
    Query(query): Query<ObjectQuery>,
) -> ApiResult<Json<Envelope<ExistsRes>>> {
    let driver = driver(&state, &query.class)?;
    let path = StoragePath::parse(&query.path).map_err(StorageError::from)?;
    let exists = driver.exists(&path).await?;
    Ok(Json(Envelope::ok(ExistsRes { exists })))
}

#[utoipa::path(
    get,
    path = "/storage/list",
    params(
        ("class" = String, Query, description = "Storage class"),
        ("prefix" = Option<String>, Query, description = "Prefix to list; empty lists the class")
    ),
    responses((status = 200, description = "Object paths under the prefix", body = ListRes))
)]
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Envelope<ListRes>>> {
    let driver = driver(&state, &query.class)?;
    let prefix = StoragePrefix::parse(&query.prefix).map_err(StorageError::from)?;
    let paths = driver
        .list(&prefix)
        .await?
        .into_iter()
        .map(|p| p.to_string())
        .collect();
    Ok(Json(Envelope::ok(ListRes { paths })))
}

#[utoipa::path(
    post,
    path = "/storage/upload/init",
    request_body = InitUploadReq,
    responses(
        (status = 200, description = "Session opened", body = InitUploadRes),
        (status = 409, description = "Another session is open for this path", body = StatusBody)
    )
)]
pub async fn upload_init(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<InitUploadReq>,
) -> ApiResult<Json<Envelope<InitUploadRes>>> {
    let mut ctx = operation_context(&headers)?;
    ctx.metadata.extend(req.metadata);
    let driver = driver(&state, &req.class)?;
    let path = StoragePath::parse(&req.path).map_err(StorageError::from)?;
    let session_id = driver
        .init_upload(&path, req.expected_total_bytes, req.content_type, &ctx)
        .await?;
    Ok(Json(Envelope::ok(InitUploadRes { session_id })))
}

#[utoipa::path(
    post,
    path = "/storage/upload/chunk",
    params(
        ("class" = String, Query, description = "Storage class"),
        ("session_id" = String, Query, description = "Upload session"),
        ("sequence" = u64, Query, description = "Zero-based chunk number")
    ),
    request_body(content = String, content_type = "application/octet-stream"),
    responses(
        (status = 200, description = "Chunk appended", body = ChunkRes),
        (status = 409, description = "Out-of-order chunk; `expected_sequence` is set", body = StatusBody),
        (status = 404, description = "Unknown or closed session", body = StatusBody)
    )
)]
/// Appends one chunk. A rejected out-of-order chunk answers with the session's current
/// state so the client can tell whether an earlier attempt already landed.
pub async fn upload_chunk(
    State(state): State<AppState>,
    Query(query): Query<ChunkQuery>,
    body: Bytes,
) -> ApiResult<Json<Envelope<ChunkRes>>> {
    let driver = driver(&state, &query.class)?;
    match driver
        .upload_chunk(&query.session_id, query.sequence, body)
        .await
    {
        Ok(receipt) => Ok(Json(Envelope::ok(ChunkRes {
            sequence: receipt.sequence,
            bytes_received: receipt.bytes_received,
        }))),
        Err(err @ StorageError::OutOfOrderChunk { .. }) => {
            let current = state
                .manager
                .sessions()
                .and_then(|tracker| tracker.get(&query.session_id).ok().flatten())
                .map(|session| ChunkRes {
                    sequence: session.chunk_sequence_number.unwrap_or_default(),
                    bytes_received: session.bytes_received,
                });
            let error = ApiError::from(err);
            Err(match current {
                Some(current) => error.with_payload(current),
                None => error,
            })
        }
        Err(err) => Err(err.into()),
    }
}

#[utoipa::path(
    post,
    path = "/storage/upload/complete",
    request_body = SessionReq,
    responses(
        (status = 200, description = "Object committed", body = CompleteUploadRes),
        (status = 404, description = "Unknown or closed session", body = StatusBody)
    )
)]
pub async fn upload_complete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SessionReq>,
) -> ApiResult<Json<Envelope<CompleteUploadRes>>> {
    let ctx = operation_context(&headers)?;
    let driver = driver(&state, &req.class)?;
    let done = driver.complete_upload(&req.session_id, &ctx).await?;
    Ok(Json(Envelope::ok(CompleteUploadRes {
        path: done.path.to_string(),
        byte_size: done.byte_size,
    })))
}

#[utoipa::path(
    post,
    path = "/storage/upload/abort",
    request_body = SessionReq,
    responses(
        (status = 200, description = "Session aborted", body = StatusBody),
        (status = 404, description = "Unknown or completed session", body = StatusBody)
    )
)]
pub async fn upload_abort(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SessionReq>,
) -> ApiResult<Json<Envelope<()>>> {
    let ctx = operation_context(&headers)?;
    let driver = driver(&state, &req.class)?;
    driver.abort_upload(&req.session_id, &ctx).await?;
    Ok(Json(Envelope::ok_empty()))
}

#[utoipa::path(
    get,
    path = "/storage/health",
    responses(
        (status = 200, description = "Every class root is writable", body = HealthRes),
        (status = 503, description = "At least one class root is not writable", body = HealthRes)
    )
)]
/// Checks each class root for writability without touching stored objects.
pub async fn health(State(state): State<AppState>) -> Response {
    let mut classes = Vec::new();
    for class in state.manager.classes() {
        let checked = match state.manager.get_storage(class) {
            Ok(driver) => driver.health().await,
            Err(e) => Err(e),
        };
        classes.push(ClassHealth {
            class: class.to_string(),
            writable: checked.is_ok(),
            detail: checked.err().map(|e| e.to_string()),
        });
    }

    let report = HealthService::summarise(classes);
    if report.ok {
        envelope_response(Envelope::ok(report))
    } else {
        tracing::warn!("Health check failed: {}", report.message);
        let mut envelope = Envelope::error(ResponseStatus::ServiceUnavailable, report.message.clone());
        envelope.payload = Some(report);
        envelope_response(envelope)
    }
}
