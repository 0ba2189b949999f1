use std::time::Duration;

use nimbus_core::Token;
use nimbus_vfs::{FileSystem, ROOT_INODE};
use serde_json::json;
use tempfile::TempDir;

use crate::fixtures::mock_transport::{MockResponse, MockTransport};
use crate::fixtures::{drive_client, scratch_dir};

fn listing(files: serde_json::Value) -> MockResponse {
    MockResponse::Json(200, json!({ "files": files }))
}

fn drive_fs(transport: std::sync::Arc<MockTransport>, cache: &TempDir) -> FileSystem {
    let client = drive_client(transport, Token::new("A1", "R1"));
    FileSystem::new(vec![client], cache.path().to_path_buf())
}

#[tokio::test]
async fn root_lists_provider_pseudo_directories() {
    let transport = MockTransport::new();
    let cache = scratch_dir();
    let fs = drive_fs(transport, &cache);
    let entries = fs.readdir(ROOT_INODE).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].filename, "google_drive");
    fs.shutdown().await;
}

#[tokio::test]
async fn read_past_eof_clamps_to_available_bytes() {
    let transport = MockTransport::new();
    transport.push(listing(
        json!([{"id": "f1", "name": "data.bin", "mimeType": "application/octet-stream", "size": "10"}]),
    ));
    transport.push(MockResponse::Bytes(206, b"789".to_vec()));

    let cache = scratch_dir();
    let fs = drive_fs(transport.clone(), &cache);
    let node = fs.getattr_path("google_drive/data.bin").await.unwrap();
    assert_eq!(node.size, 10);

    let bytes = fs.read(node.inode, 7, 100).await.unwrap();
    assert_eq!(bytes, b"789");

    // The provider saw the clamped range, not the requested one.
    let requests = transport.requests();
    let download = requests.last().unwrap();
    assert_eq!(download.header("Range"), Some("bytes=7-9"));
    fs.shutdown().await;
}

#[tokio::test]
async fn read_at_or_past_eof_is_empty_without_a_request() {
    let transport = MockTransport::new();
    transport.push(listing(
        json!([{"id": "f1", "name": "data.bin", "mimeType": "application/octet-stream", "size": "10"}]),
    ));

    let cache = scratch_dir();
    let fs = drive_fs(transport.clone(), &cache);
    let node = fs.getattr_path("google_drive/data.bin").await.unwrap();
    let before = transport.request_count();
    assert!(fs.read(node.inode, 10, 4).await.unwrap().is_empty());
    assert!(fs.read(node.inode, 999, 1).await.unwrap().is_empty());
    assert_eq!(transport.request_count(), before);
    fs.shutdown().await;
}

#[tokio::test]
async fn created_file_uploads_on_release_and_drops_its_cache() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Json(
        200,
        json!({"id": "new-id", "name": "notes.txt", "mimeType": "text/plain", "size": "5"}),
    ));

    let cache = scratch_dir();
    let fs = drive_fs(transport.clone(), &cache);

    let provider_dir = fs.getattr_path("google_drive").await.unwrap();
    let inode = fs.mknod(provider_dir.inode, "notes.txt").await.unwrap();
    let cache_path = cache.path().join(format!("{inode}.tmp"));
    assert!(cache_path.exists());

    assert_eq!(fs.write(inode, 0, b"hello").await.unwrap(), 5);
    // Reads of a pending file come from the local cache.
    assert_eq!(fs.read(inode, 1, 3).await.unwrap(), b"ell");
    assert_eq!(fs.getattr(inode).await.unwrap().size, 5);

    fs.release(inode).await.unwrap();
    // The upload resolves in the background; its watcher removes the cache.
    for _ in 0..100 {
        if !cache_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!cache_path.exists());

    let node = fs.getattr(inode).await.unwrap();
    assert_eq!(node.size, 5);
    let upload = transport.requests().pop().unwrap();
    assert_eq!(upload.method, "POST");
    let body = String::from_utf8_lossy(&upload.body).to_string();
    assert!(body.contains("hello"));
    assert!(body.contains("notes.txt"));
    fs.shutdown().await;
}

#[tokio::test]
async fn release_without_write_uploads_an_empty_file() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Json(
        200,
        json!({"id": "empty-id", "name": "empty", "mimeType": "text/plain", "size": "0"}),
    ));

    let cache = scratch_dir();
    let fs = drive_fs(transport.clone(), &cache);

    let provider_dir = fs.getattr_path("google_drive").await.unwrap();
    let inode = fs.mknod(provider_dir.inode, "empty").await.unwrap();
    let cache_path = cache.path().join(format!("{inode}.tmp"));
    fs.release(inode).await.unwrap();

    for _ in 0..100 {
        if !cache_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!cache_path.exists());
    assert_eq!(transport.request_count(), 1);
    fs.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_inflight_uploads_and_removes_caches() {
    let transport = MockTransport::new();
    transport.push(MockResponse::Hang);

    let cache = scratch_dir();
    let fs = drive_fs(transport.clone(), &cache);

    let provider_dir = fs.getattr_path("google_drive").await.unwrap();
    let inode = fs.mknod(provider_dir.inode, "big.bin").await.unwrap();
    fs.write(inode, 0, &[7u8; 1024]).await.unwrap();
    let cache_path = cache.path().join(format!("{inode}.tmp"));
    fs.release(inode).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    fs.shutdown().await;

    // The cancelled upload's watcher still removes the cache file.
    for _ in 0..100 {
        if !cache_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!cache_path.exists());
}

#[tokio::test]
async fn writes_to_uploaded_files_are_invalid() {
    let transport = MockTransport::new();
    transport.push(listing(
        json!([{"id": "f1", "name": "fixed.bin", "mimeType": "application/octet-stream", "size": "4"}]),
    ));

    let cache = scratch_dir();
    let fs = drive_fs(transport, &cache);
    let node = fs.getattr_path("google_drive/fixed.bin").await.unwrap();
    let error = fs.write(node.inode, 0, b"x").await.unwrap_err();
    assert_eq!(error.code, 400);
    fs.shutdown().await;
}

#[tokio::test]
async fn same_parent_rename_only_calls_rename() {
    let transport = MockTransport::new();
    transport.push(listing(
        json!([{"id": "f1", "name": "a.txt", "mimeType": "text/plain", "size": "1"}]),
    ));
    transport.push(MockResponse::Json(
        200,
        json!({"id": "f1", "name": "b.txt", "mimeType": "text/plain", "size": "1"}),
    ));

    let cache = scratch_dir();
    let fs = drive_fs(transport.clone(), &cache);
    let dir = fs.getattr_path("google_drive").await.unwrap();
    fs.rename(dir.inode, "a.txt", dir.inode, "b.txt")
        .await
        .unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 2);
    // One PATCH with the new name; no move round trip.
    assert_eq!(requests[1].method, "PATCH");
    assert!(String::from_utf8_lossy(&requests[1].body).contains("b.txt"));

    let renamed = fs.lookup(dir.inode, "b.txt").await.unwrap();
    assert_eq!(renamed.filename, "b.txt");
    fs.shutdown().await;
}
