//! Runs the storage service on a loopback port and drives it through the remote proxy driver,
//! the way the edge tier does.

use api_rest::error::envelope_response;
use api_rest::AppState;
use api_shared::{ApiKey, ChunkRes, Envelope, ResponseStatus};
use axum::response::Response;
use bytes::Bytes;
use phistore_core::config::{ClassConfig, RemoteSettings, StorageConfig};
use phistore_core::constants::meta;
use phistore_core::driver::{RemoteClient, RemoteProxyDriver};
use phistore_core::retry::RetryPolicy;
use phistore_core::sessions::SessionStatus;
use phistore_core::{
    collect_stream, stream_from_bytes, Actor, ByteStream, DriverKind, OperationAction,
    OperationContext, RuntimeRole, StorageClass, StorageDriver, StorageError, StorageManager,
    StoragePath, StoragePrefix,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const KEY: &str = "loopback-secret";

struct Owner {
    _dir: TempDir,
    manager: Arc<StorageManager>,
    base_url: String,
}

fn classes(root: &std::path::Path) -> Vec<ClassConfig> {
    vec![
        ClassConfig {
            class: StorageClass::submission(),
            root: root.join("submission"),
            phi_bearing: true,
            cleanup_after: None,
        },
        ClassConfig {
            class: StorageClass::workspace(),
            root: root.join("workspace"),
            phi_bearing: true,
            cleanup_after: Some(std::time::Duration::from_secs(3600)),
        },
    ]
}

async fn start_owner() -> Owner {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = StorageConfig::new(
        RuntimeRole::StorageOwner,
        classes(dir.path()),
        Some(dir.path().join("ledger")),
        None,
        Some(KEY.into()),
    )
    .unwrap();
    let manager = Arc::new(StorageManager::new(config).unwrap());
    let app = api_rest::app(AppState {
        manager: Arc::clone(&manager),
        api_key: ApiKey::new(KEY).unwrap(),
    });

    Owner {
        _dir: dir,
        manager,
        base_url: serve(app).await,
    }
}

/// Serves `app` on a loopback port and returns its base URL.
async fn serve(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// A stand-in storage owner that answers every request with `answer(n)`, where `n` counts
/// requests from one.
async fn start_stub(answer: fn(u32) -> Response) -> (String, Arc<AtomicU32>) {
    let hits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&hits);
    let app = axum::Router::new().fallback(move || {
        let counter = Arc::clone(&counter);
        async move { answer(counter.fetch_add(1, Ordering::SeqCst) + 1) }
    });
    (serve(app).await, hits)
}

fn remote(owner: &Owner, key: &str, threshold: usize, chunk: usize) -> RemoteProxyDriver {
    remote_at(&owner.base_url, key, threshold, chunk)
}

fn remote_at(base_url: &str, key: &str, threshold: usize, chunk: usize) -> RemoteProxyDriver {
    let mut settings = RemoteSettings::new(base_url, key).unwrap();
    settings.chunk_threshold = threshold;
    settings.chunk_size = chunk;
    settings.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    };
    RemoteProxyDriver::new(
        StorageClass::workspace(),
        Arc::new(RemoteClient::new(&settings).unwrap()),
    )
}

fn disk_full(_: u32) -> Response {
    envelope_response(Envelope::<()>::error(ResponseStatus::WriteError, "disk full"))
}

fn ctx() -> OperationContext {
    OperationContext::new(Actor::user("analyst-7").unwrap()).with_metadata("cohort", "Åland-7")
}

/// Splits `data` into a stream of uneven pieces.
fn pieces(data: &[u8], size: usize) -> ByteStream {
    let parts: Vec<std::io::Result<Bytes>> = data
        .chunks(size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Box::pin(futures::stream::iter(parts))
}

fn records(owner: &Owner, path: &str) -> Vec<phistore_core::StorageOperationRecord> {
    owner
        .manager
        .ledger()
        .unwrap()
        .history(&StorageClass::workspace(), path)
        .unwrap()
}

#[tokio::test]
async fn test_round_trip_below_threshold() {
    let owner = start_owner().await;
    let driver = remote(&owner, KEY, 1024, 256);
    let path = StoragePath::parse("job-1/small.csv").unwrap();
    let data = b"id,value\n1,2\n".to_vec();

    let saved = driver
        .save(&path, pieces(&data, 5), Some("text/csv".into()), &ctx())
        .await
        .unwrap();
    assert_eq!(saved, path);

    let back = collect_stream(driver.get(&path, &ctx()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(&back[..], &data[..]);

    let history = records(&owner, path.as_str());
    let created: Vec<_> = history
        .iter()
        .filter(|r| r.action == OperationAction::Created)
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].byte_size, Some(data.len() as u64));
    assert_eq!(created[0].actor.to_string(), "user:analyst-7");
    assert_eq!(
        created[0].metadata.get("cohort").map(String::as_str),
        Some("Åland-7")
    );
    assert!(history.iter().any(|r| r.action == OperationAction::Read));
}

#[tokio::test]
async fn test_round_trip_above_threshold_uses_one_session() {
    let owner = start_owner().await;
    let driver = remote(&owner, KEY, 1024, 256);
    let path = StoragePath::parse("job-2/large.bin").unwrap();
    let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

    driver
        .save(&path, pieces(&data, 700), None, &ctx())
        .await
        .unwrap();

    let back = collect_stream(driver.get(&path, &ctx()).await.unwrap())
        .await
        .unwrap();
    assert_eq!(back.len(), data.len());
    assert_eq!(&back[..], &data[..]);

    let created: Vec<_> = records(&owner, path.as_str())
        .into_iter()
        .filter(|r| r.action == OperationAction::Created)
        .collect();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].byte_size, Some(5000));
}

#[tokio::test]
async fn test_three_one_mebibyte_chunks_record_one_object() {
    let owner = start_owner().await;
    let driver = remote(&owner, KEY, 1024 * 1024, 1024 * 1024);
    let path = StoragePath::parse("job-3/scan.dcm").unwrap();
    let data = vec![7u8; 3 * 1024 * 1024];

    let session_id = driver
        .init_upload(&path, Some(data.len() as u64), None, &ctx())
        .await
        .unwrap();
    for (sequence, chunk) in data.chunks(1024 * 1024).enumerate() {
        let receipt = driver
            .upload_chunk(&session_id, sequence as u64, Bytes::copy_from_slice(chunk))
            .await
            .unwrap();
        assert_eq!(receipt.bytes_received, (sequence as u64 + 1) * 1024 * 1024);
    }
    let done = driver.complete_upload(&session_id, &ctx()).await.unwrap();
    assert_eq!(done.byte_size, 3_145_728);

    let history = records(&owner, path.as_str());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, OperationAction::Created);
    assert_eq!(history[0].byte_size, Some(3_145_728));
}

#[tokio::test]
async fn test_out_of_order_chunk_reports_expected_sequence() {
    let owner = start_owner().await;
    let driver = remote(&owner, KEY, 1024, 256);
    let path = StoragePath::parse("job-4/part.bin").unwrap();

    let session_id = driver.init_upload(&path, None, None, &ctx()).await.unwrap();
    driver
        .upload_chunk(&session_id, 0, Bytes::from_static(b"abc"))
        .await
        .unwrap();
    let err = driver
        .upload_chunk(&session_id, 2, Bytes::from_static(b"ghi"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::OutOfOrderChunk {
            expected: 1,
            received: 2
        }
    ));

    let conflict = driver.init_upload(&path, None, None, &ctx()).await.unwrap_err();
    assert!(matches!(conflict, StorageError::SessionConflict(_)));

    driver.abort_upload(&session_id, &ctx()).await.unwrap();
    let missing = driver
        .upload_chunk(&session_id, 1, Bytes::from_static(b"def"))
        .await
        .unwrap_err();
    assert!(matches!(missing, StorageError::SessionNotFound(_)));
}

#[tokio::test]
async fn test_wrong_key_is_rejected_without_retry() {
    let owner = start_owner().await;
    let driver = remote(&owner, "not-the-key", 1024, 256);
    let path = StoragePath::parse("job-5/x.bin").unwrap();

    let err = driver
        .save(&path, stream_from_bytes("x"), None, &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::AuthenticationError(_)));
    assert!(matches!(
        driver.health().await.unwrap_err(),
        StorageError::AuthenticationError(_)
    ));
    assert!(records(&owner, path.as_str()).is_empty());
}

#[tokio::test]
async fn test_deletes_are_idempotent_over_the_wire() {
    let owner = start_owner().await;
    let driver = remote(&owner, KEY, 1024, 256);
    let path = StoragePath::parse("job-6/out/a.txt").unwrap();

    driver.delete(&path, &ctx()).await.unwrap();
    assert_eq!(
        driver
            .delete_prefix(&StoragePrefix::parse("job-6").unwrap(), &ctx())
            .await
            .unwrap(),
        0
    );

    for name in ["job-6/out/a.txt", "job-6/out/b.txt", "job-6/keep.txt"] {
        driver
            .save(
                &StoragePath::parse(name).unwrap(),
                stream_from_bytes(name.to_owned()),
                None,
                &ctx(),
            )
            .await
            .unwrap();
    }
    let removed = driver
        .delete_prefix(&StoragePrefix::parse("job-6/out/").unwrap(), &ctx())
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(!driver.exists(&path).await.unwrap());
    assert_eq!(
        driver
            .list(&StoragePrefix::parse("job-6").unwrap())
            .await
            .unwrap(),
        vec![StoragePath::parse("job-6/keep.txt").unwrap()]
    );

    let err = driver
        .get(&path, &ctx())
        .await
        .err()
        .expect("deleted object must not be readable");
    assert!(matches!(err, StorageError::NotFound(_)));
}

#[tokio::test]
async fn test_traversal_is_rejected_by_the_service() {
    let owner = start_owner().await;
    let response = reqwest::Client::new()
        .get(format!("{}/storage/exists", owner.base_url))
        .query(&[("class", "workspace"), ("path", "../etc/passwd")])
        .header("x-api-key", KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "path-rejected");
}

#[tokio::test]
async fn test_edge_manager_never_writes_phi_locally() {
    let owner = start_owner().await;
    let edge_dir = TempDir::new().expect("Failed to create temp dir");
    let config = StorageConfig::new(
        RuntimeRole::Edge,
        classes(edge_dir.path()),
        None,
        Some(RemoteSettings::new(&owner.base_url, KEY).unwrap()),
        None,
    )
    .unwrap();
    let edge = StorageManager::new(config).unwrap();

    let driver = edge.get_storage(&StorageClass::workspace()).unwrap();
    assert_eq!(driver.kind(), DriverKind::RemoteProxy);
    driver.health().await.unwrap();
    driver
        .save(
            &StoragePath::parse("job-8/result.json").unwrap(),
            stream_from_bytes("{}"),
            Some("application/json".into()),
            &ctx(),
        )
        .await
        .unwrap();

    assert!(!edge_dir.path().join("workspace").exists());
    assert_eq!(records(&owner, "job-8/result.json").len(), 1);
}

#[tokio::test]
async fn test_write_error_from_owner_is_not_retried() {
    let (base_url, hits) = start_stub(disk_full).await;
    let driver = remote_at(&base_url, KEY, 1024, 256);
    let path = StoragePath::parse("job-9/out.bin").unwrap();

    let err = driver
        .save(&path, stream_from_bytes("x"), None, &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::WriteError(ref m) if m.contains("disk full")));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    hits.store(0, Ordering::SeqCst);
    let err = driver
        .upload_chunk("session-1", 0, Bytes::from_static(b"abc"))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::WriteError(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

fn chunk_landed_on_first_attempt(hit: u32) -> Response {
    if hit == 1 {
        return envelope_response(Envelope::<()>::error(
            ResponseStatus::ServiceUnavailable,
            "owner restarting",
        ));
    }
    envelope_response(Envelope {
        status: ResponseStatus::OutOfOrderChunk,
        message: Some("expected chunk 4".into()),
        expected_sequence: Some(4),
        payload: Some(ChunkRes {
            sequence: 3,
            bytes_received: 1024,
        }),
    })
}

#[tokio::test]
async fn test_retried_chunk_already_accepted_counts_as_sent() {
    let (base_url, hits) = start_stub(chunk_landed_on_first_attempt).await;
    let driver = remote_at(&base_url, KEY, 1024, 256);

    let receipt = driver
        .upload_chunk("session-2", 3, Bytes::from(vec![1u8; 256]))
        .await
        .unwrap();
    assert_eq!(receipt.sequence, 3);
    assert_eq!(receipt.bytes_received, 1024);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

fn ahead_of_sender(_: u32) -> Response {
    envelope_response(Envelope {
        status: ResponseStatus::OutOfOrderChunk,
        message: Some("expected chunk 4".into()),
        expected_sequence: Some(4),
        payload: Some(ChunkRes {
            sequence: 3,
            bytes_received: 1024,
        }),
    })
}

#[tokio::test]
async fn test_first_attempt_ahead_of_sender_is_out_of_order() {
    let (base_url, hits) = start_stub(ahead_of_sender).await;
    let driver = remote_at(&base_url, KEY, 1024, 256);

    let err = driver
        .upload_chunk("session-3", 3, Bytes::from(vec![1u8; 256]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StorageError::OutOfOrderChunk {
            expected: 4,
            received: 3
        }
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_source_failure_mid_upload_aborts_the_session() {
    let owner = start_owner().await;
    let driver = remote(&owner, KEY, 1024, 256);
    let path = StoragePath::parse("job-10/broken.bin").unwrap();

    // More than the threshold, so the save is chunked, then the source fails.
    let parts: Vec<std::io::Result<Bytes>> = vec![
        Ok(Bytes::from(vec![3u8; 1100])),
        Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "source closed",
        )),
    ];
    let err = driver
        .save(&path, Box::pin(futures::stream::iter(parts)), None, &ctx())
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::WriteError(_)));

    let history = records(&owner, path.as_str());
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, OperationAction::StreamFailed);
    assert_eq!(history[0].byte_size, Some(1024));
    assert!(!driver.exists(&path).await.unwrap());

    let session_id = history[0].metadata.get(meta::SESSION_ID).unwrap();
    let session = owner
        .manager
        .sessions()
        .unwrap()
        .get(session_id)
        .unwrap()
        .unwrap();
    assert_eq!(session.status, SessionStatus::Aborted);
}
