//! Remote proxy driver.
//!
//! Used on the edge for PHI-bearing classes. It forwards every operation to the storage
//! owner over HTTP and never writes object bytes to local disk. Each driver handles one
//! class; all of them share one [`RemoteClient`], and with it one connection pool and one
//! bound on in-flight requests.

use super::{
    ByteStream, ChunkReceipt, CompletedUpload, DriverKind, OperationContext, StorageDriver,
};
use crate::config::RemoteSettings;
use crate::constants::{meta, reason};
use crate::retry::{
    classify_response, classify_transport, run_with_retry, AttemptError, RetryPolicy,
    TransportFault,
};
use crate::{StorageError, StorageResult};
use api_shared::{
    routes, ChunkQuery, ChunkRes, CompleteUploadRes, DeletePrefixReq, DeletePrefixRes,
    DeleteReq, Envelope, ExistsRes, HealthRes, InitUploadReq, InitUploadRes, ListQuery, ListRes,
    ObjectQuery, ResponseStatus, SaveRes, SessionReq, WireContext, API_KEY_HEADER,
    CONTEXT_HEADER,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use phistore_types::{StorageClass, StoragePath, StoragePrefix};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// HTTP client for the storage service, shared by every remote driver in the process.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    permits: Semaphore,
    retry: RetryPolicy,
    chunk_threshold: usize,
    chunk_size: usize,
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.base_url)
            .field("retry", &self.retry)
            .field("chunk_threshold", &self.chunk_threshold)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    pub fn new(settings: &RemoteSettings) -> StorageResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .pool_max_idle_per_host(settings.pool_idle_per_host)
            .build()
            .map_err(|e| StorageError::Config(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: settings.base_url.clone(),
            api_key: settings.api_key.clone(),
            permits: Semaphore::new(settings.max_in_flight.max(1)),
            retry: settings.retry,
            chunk_threshold: settings.chunk_threshold,
            chunk_size: settings.chunk_size.max(1),
        })
    }

    fn request(&self, method: reqwest::Method, route: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, route))
            .header(API_KEY_HEADER, &self.api_key)
    }

    /// Sends one request while holding an in-flight permit. Any HTTP status is returned as
    /// a response; only transport failures become errors here.
    async fn dispatch(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AttemptError> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            AttemptError::permanent(StorageError::ServiceUnavailable(
                "remote client is shutting down".into(),
            ))
        })?;

        request.send().await.map_err(|e| {
            let fault = TransportFault::of(&e);
            AttemptError {
                class: classify_transport(fault),
                error: StorageError::ServiceUnavailable(format!(
                    "storage owner unreachable: {e}"
                )),
            }
        })
    }

    /// Sends and requires a 2xx answer.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AttemptError> {
        let response = self.dispatch(request).await?;
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(failure_from_response(response, None).await)
        }
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, AttemptError> {
        let response = self.send(request).await?;
        decode_payload(response).await
    }
}

/// Reads an error response into a classified failure.
async fn failure_from_response(
    response: reqwest::Response,
    sent_sequence: Option<u64>,
) -> AttemptError {
    let status = response.status().as_u16();
    let envelope = response.json::<Envelope<serde_json::Value>>().await.ok();
    AttemptError {
        class: classify_response(status, envelope.as_ref().map(|e| e.status)),
        error: error_from_response(status, envelope.as_ref(), sent_sequence),
    }
}

async fn decode_payload<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, AttemptError> {
    let envelope = response.json::<Envelope<T>>().await.map_err(|e| {
        AttemptError::permanent(StorageError::WriteError(format!(
            "malformed response from storage owner: {e}"
        )))
    })?;
    envelope.payload.ok_or_else(|| {
        AttemptError::permanent(StorageError::WriteError(
            "storage owner response carried no payload".into(),
        ))
    })
}

/// Maps an error answer from the storage service back onto [`StorageError`].
///
/// The envelope status wins when present; the HTTP code is the fallback for bodies that are
/// not envelopes (proxies, load balancers).
pub(crate) fn error_from_response(
    http_status: u16,
    envelope: Option<&Envelope<serde_json::Value>>,
    sent_sequence: Option<u64>,
) -> StorageError {
    let message = envelope
        .and_then(|e| e.message.clone())
        .unwrap_or_else(|| format!("storage owner answered HTTP {http_status}"));

    if let Some(envelope) = envelope {
        match envelope.status {
            ResponseStatus::NotFound => return StorageError::NotFound(message),
            ResponseStatus::WriteError => return StorageError::WriteError(message),
            ResponseStatus::AuthError => return StorageError::AuthenticationError(message),
            ResponseStatus::ServiceUnavailable => {
                return StorageError::ServiceUnavailable(message)
            }
            ResponseStatus::OutOfOrderChunk => {
                return StorageError::OutOfOrderChunk {
                    expected: envelope.expected_sequence.unwrap_or_default(),
                    received: sent_sequence.unwrap_or_default(),
                }
            }
            ResponseStatus::SessionConflict => return StorageError::SessionConflict(message),
            ResponseStatus::SessionNotFound => return StorageError::SessionNotFound(message),
            ResponseStatus::PathRejected => return StorageError::PathTraversalRejected(message),
            ResponseStatus::BadRequest => return StorageError::InvalidInput(message),
            ResponseStatus::Ok => {}
        }
    }

    match http_status {
        401 | 403 => StorageError::AuthenticationError(message),
        404 => StorageError::NotFound(message),
        400 | 413 | 422 => StorageError::InvalidInput(message),
        409 => StorageError::SessionConflict(message),
        429 | 500..=599 => StorageError::ServiceUnavailable(message),
        _ => StorageError::WriteError(message),
    }
}

fn context_header(ctx: &OperationContext) -> String {
    WireContext {
        actor: ctx.actor.to_string(),
        metadata: ctx.metadata.clone(),
    }
    .encode()
}

fn parse_remote_path(raw: &str) -> StorageResult<StoragePath> {
    StoragePath::parse(raw).map_err(|e| {
        StorageError::WriteError(format!("storage owner returned invalid path '{raw}': {e}"))
    })
}

#[derive(Debug, Clone)]
pub struct RemoteProxyDriver {
    class: StorageClass,
    client: Arc<RemoteClient>,
}

impl RemoteProxyDriver {
    pub fn new(class: StorageClass, client: Arc<RemoteClient>) -> Self {
        Self { class, client }
    }

    fn object_query(&self, path: &StoragePath) -> ObjectQuery {
        ObjectQuery {
            class: self.class.to_string(),
            path: path.to_string(),
        }
    }

    async fn save_whole(
        &self,
        path: &StoragePath,
        body: Bytes,
        content_type: Option<&str>,
        ctx: &OperationContext,
    ) -> StorageResult<StoragePath> {
        let query = self.object_query(path);
        let header = context_header(ctx);
        let saved: SaveRes = run_with_retry(&RetryPolicy::once(), "save", |_| {
            let mut request = self
                .client
                .request(reqwest::Method::POST, routes::SAVE)
                .query(&query)
                .header(CONTEXT_HEADER, header.as_str())
                .body(body.clone());
            if let Some(content_type) = content_type {
                request = request.header(reqwest::header::CONTENT_TYPE, content_type);
            }
            self.client.send_json(request)
        })
        .await?;

        tracing::debug!(class = %self.class, path = %saved.path, byte_size = saved.byte_size, "Saved via storage owner");
        parse_remote_path(&saved.path)
    }

    /// Streams `pending` and the rest of `content` as chunks of the configured size. The
    /// source is read at most one chunk ahead of what has been sent.
    async fn save_chunked(
        &self,
        path: &StoragePath,
        mut pending: BytesMut,
        mut content: ByteStream,
        content_type: Option<String>,
        ctx: &OperationContext,
    ) -> StorageResult<StoragePath> {
        let session_id = self.init_upload(path, None, content_type, ctx).await?;
        let chunk_size = self.client.chunk_size;

        let sent = async {
            let mut sequence = 0u64;
            let mut source_done = false;
            loop {
                while pending.len() < chunk_size && !source_done {
                    match content.next().await {
                        Some(chunk) => pending.extend_from_slice(&chunk.map_err(|e| {
                            StorageError::WriteError(format!("reading content for {path}: {e}"))
                        })?),
                        None => source_done = true,
                    }
                }
                if pending.is_empty() {
                    break;
                }
                let take = pending.len().min(chunk_size);
                let chunk = pending.split_to(take).freeze();
                self.upload_chunk(&session_id, sequence, chunk).await?;
                sequence += 1;
            }
            let done = self.complete_upload(&session_id, ctx).await?;
            Ok::<_, StorageError>(done)
        }
        .await;

        match sent {
            Ok(done) => Ok(done.path),
            Err(err) => {
                let abort_ctx = ctx.clone().with_metadata(meta::REASON, reason::CALLER_ABORT);
                if let Err(abort_err) = self.abort_upload(&session_id, &abort_ctx).await {
                    tracing::warn!(
                        session = %session_id,
                        "Could not abort upload after failure: {abort_err}"
                    );
                }
                Err(err)
            }
        }
    }
}

#[async_trait]
impl StorageDriver for RemoteProxyDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::RemoteProxy
    }

    fn storage_class(&self) -> &StorageClass {
        &self.class
    }

    /// Small payloads go in one request. Anything larger than the chunk threshold goes
    /// through an upload session.
    async fn save(
        &self,
        path: &StoragePath,
        mut content: ByteStream,
        content_type: Option<String>,
        ctx: &OperationContext,
    ) -> StorageResult<StoragePath> {
        let threshold = self.client.chunk_threshold;
        let mut buffer = BytesMut::new();
        let mut exhausted = false;
        while buffer.len() <= threshold {
            match content.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk.map_err(|e| {
                    StorageError::WriteError(format!("reading content for {path}: {e}"))
                })?),
                None => {
                    exhausted = true;
                    break;
                }
            }
        }

        if exhausted {
            self.save_whole(path, buffer.freeze(), content_type.as_deref(), ctx)
                .await
        } else {
            self.save_chunked(path, buffer, content, content_type, ctx)
                .await
        }
    }

    async fn get(&self, path: &StoragePath, ctx: &OperationContext) -> StorageResult<ByteStream> {
        let query = self.object_query(path);
        let header = context_header(ctx);
        let response = run_with_retry(&self.client.retry, "get", |_| {
            self.client.send(
                self.client
                    .request(reqwest::Method::GET, routes::GET)
                    .query(&query)
                    .header(CONTEXT_HEADER, header.as_str()),
            )
        })
        .await?;

        Ok(Box::pin(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        ))
    }

    async fn delete(&self, path: &StoragePath, ctx: &OperationContext) -> StorageResult<()> {
        let body = DeleteReq {
            class: self.class.to_string(),
            path: path.to_string(),
        };
        let header = context_header(ctx);
        let result = run_with_retry(&self.client.retry, "delete", |_| {
            self.client.send(
                self.client
                    .request(reqwest::Method::POST, routes::DELETE)
                    .header(CONTEXT_HEADER, header.as_str())
                    .json(&body),
            )
        })
        .await;

        match result {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete_prefix(
        &self,
        prefix: &StoragePrefix,
        ctx: &OperationContext,
    ) -> StorageResult<u64> {
        if prefix.is_root() {
            return Err(StorageError::InvalidInput(
                "delete-prefix requires a non-empty prefix".into(),
            ));
        }
        let body = DeletePrefixReq {
            class: self.class.to_string(),
            prefix: prefix.to_string(),
        };
        let header = context_header(ctx);
        let result: StorageResult<DeletePrefixRes> =
            run_with_retry(&self.client.retry, "delete-prefix", |_| {
                self.client.send_json(
                    self.client
                        .request(reqwest::Method::POST, routes::DELETE_PREFIX)
                        .header(CONTEXT_HEADER, header.as_str())
                        .json(&body),
                )
            })
            .await;

        match result {
            Ok(res) => Ok(res.count),
            Err(StorageError::NotFound(_)) => Ok(0),
            Err(err) => Err(err),
        }
    }

    async fn exists(&self, path: &StoragePath) -> StorageResult<bool> {
        let query = self.object_query(path);
        let res: ExistsRes = run_with_retry(&self.client.retry, "exists", |_| {
            self.client.send_json(
                self.client
                    .request(reqwest::Method::GET, routes::EXISTS)
                    .query(&query),
            )
        })
        .await?;
        Ok(res.exists)
    }

    async fn list(&self, prefix: &StoragePrefix) -> StorageResult<Vec<StoragePath>> {
        let query = ListQuery {
            class: self.class.to_string(),
            prefix: prefix.to_string(),
        };
        let res: ListRes = run_with_retry(&self.client.retry, "list", |_| {
            self.client.send_json(
                self.client
                    .request(reqwest::Method::GET, routes::LIST)
                    .query(&query),
            )
        })
        .await?;
        res.paths.iter().map(|p| parse_remote_path(p)).collect()
    }

    async fn init_upload(
        &self,
        path: &StoragePath,
        expected_total_bytes: Option<u64>,
        content_type: Option<String>,
        ctx: &OperationContext,
    ) -> StorageResult<String> {
        let body = InitUploadReq {
            class: self.class.to_string(),
            path: path.to_string(),
            expected_total_bytes,
            content_type,
            metadata: ctx.metadata.clone(),
        };
        let header = context_header(ctx);
        let res: InitUploadRes = run_with_retry(&RetryPolicy::once(), "upload-init", |_| {
            self.client.send_json(
                self.client
                    .request(reqwest::Method::POST, routes::UPLOAD_INIT)
                    .header(CONTEXT_HEADER, header.as_str())
                    .json(&body),
            )
        })
        .await?;
        tracing::debug!(class = %self.class, path = %path, session = %res.session_id, "Upload session opened");
        Ok(res.session_id)
    }

    /// Sends one chunk, retrying transient failures.
    ///
    /// If a retry is told the session already expects `sequence + 1`, the earlier attempt
    /// landed and its answer was lost; that counts as accepted.
    async fn upload_chunk(
        &self,
        session_id: &str,
        sequence: u64,
        chunk: Bytes,
    ) -> StorageResult<ChunkReceipt> {
        let query = ChunkQuery {
            class: self.class.to_string(),
            session_id: session_id.to_owned(),
            sequence,
        };
        let client = &self.client;
        let query = &query;
        let res: ChunkRes = run_with_retry(&client.retry, "upload-chunk", |attempt| {
            let request = client
                .request(reqwest::Method::POST, routes::UPLOAD_CHUNK)
                .query(query)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(chunk.clone());
            async move {
                let response = client.dispatch(request).await?;
                let status = response.status();
                if status.is_success() {
                    return decode_payload(response).await;
                }
                if status.as_u16() != 409 {
                    return Err(failure_from_response(response, Some(sequence)).await);
                }

                let envelope = response.json::<Envelope<ChunkRes>>().await.ok();
                let expected = envelope.as_ref().and_then(|e| e.expected_sequence);
                if attempt > 1 && expected == Some(sequence + 1) {
                    if let Some(state) = envelope.and_then(|e| e.payload) {
                        tracing::debug!(
                            session = %query.session_id,
                            sequence,
                            "Chunk already accepted by an earlier attempt"
                        );
                        return Ok(ChunkRes {
                            sequence,
                            bytes_received: state.bytes_received,
                        });
                    }
                }
                Err(AttemptError::permanent(match expected {
                    Some(expected) => StorageError::OutOfOrderChunk {
                        expected,
                        received: sequence,
                    },
                    None => StorageError::SessionConflict(format!(
                        "session {} rejected chunk {sequence}",
                        query.session_id
                    )),
                }))
            }
        })
        .await?;

        Ok(ChunkReceipt {
            sequence: res.sequence,
            bytes_received: res.bytes_received,
        })
    }

    async fn complete_upload(
        &self,
        session_id: &str,
        ctx: &OperationContext,
    ) -> StorageResult<CompletedUpload> {
        let body = SessionReq {
            class: self.class.to_string(),
            session_id: session_id.to_owned(),
        };
        let header = context_header(ctx);
        let res: CompleteUploadRes =
            run_with_retry(&RetryPolicy::once(), "upload-complete", |_| {
                self.client.send_json(
                    self.client
                        .request(reqwest::Method::POST, routes::UPLOAD_COMPLETE)
                        .header(CONTEXT_HEADER, header.as_str())
                        .json(&body),
                )
            })
            .await?;
        Ok(CompletedUpload {
            path: parse_remote_path(&res.path)?,
            byte_size: res.byte_size,
        })
    }

    async fn abort_upload(&self, session_id: &str, ctx: &OperationContext) -> StorageResult<()> {
        let body = SessionReq {
            class: self.class.to_string(),
            session_id: session_id.to_owned(),
        };
        let header = context_header(ctx);
        run_with_retry(&self.client.retry, "upload-abort", |_| {
            self.client.send(
                self.client
                    .request(reqwest::Method::POST, routes::UPLOAD_ABORT)
                    .header(CONTEXT_HEADER, header.as_str())
                    .json(&body),
            )
        })
        .await?;
        Ok(())
    }

    async fn health(&self) -> StorageResult<()> {
        let res: HealthRes = run_with_retry(&self.client.retry, "health", |_| {
            self.client
                .send_json(self.client.request(reqwest::Method::GET, routes::HEALTH))
        })
        .await?;
        if res.ok {
            Ok(())
        } else {
            Err(StorageError::ServiceUnavailable(res.message))
        }
    }
}
