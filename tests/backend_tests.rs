use attachment_store::backend::{
    stream_copy, BackendError, BlobStoreBackend, ByteRange, FilesystemBackend, ObjectKey,
    StorageBackend, WriteHints,
};
use attachment_store::storage::Database;
use bytes::Bytes;
use tokio::io::AsyncReadExt;

const KEY: ObjectKey<'static> = ObjectKey {
    record_id: "rec-1",
    version: "original",
};

const HINTS: WriteHints<'static> = WriteHints {
    content_type: "application/octet-stream",
    display_name: "sample.bin",
};

fn fs_backend() -> (tempfile::TempDir, FilesystemBackend) {
    let dir = tempfile::tempdir().unwrap();
    let backend = FilesystemBackend::new(dir.path().join("attachments")).unwrap();
    (dir, backend)
}

fn blob_backend() -> (tempfile::TempDir, BlobStoreBackend) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    (dir, BlobStoreBackend::new(db))
}

async fn read_all(mut reader: Box<dyn tokio::io::AsyncRead + Send + Unpin>) -> Vec<u8> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}

/// Deterministic non-repeating test payload.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ============================================================================
// Filesystem backend
// ============================================================================

#[tokio::test]
async fn fs_write_then_full_read_round_trips() {
    let (_dir, backend) = fs_backend();
    let data = Bytes::from("hello attachment");

    let token = backend.write(&KEY, data.clone(), &HINTS).await.unwrap();
    let read = read_all(backend.open_range(&token, None).await.unwrap()).await;
    assert_eq!(read, data);
}

#[tokio::test]
async fn fs_ranged_reads() {
    let (_dir, backend) = fs_backend();
    let token = backend
        .write(&KEY, Bytes::from("0123456789"), &HINTS)
        .await
        .unwrap();

    let mid = read_all(
        backend
            .open_range(&token, Some(ByteRange::span(2, 5)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(mid, b"23456");

    let tail = read_all(
        backend
            .open_range(&token, Some(ByteRange::from(7)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(tail, b"789");

    // A length past the end is clamped
    let over = read_all(
        backend
            .open_range(&token, Some(ByteRange::span(8, 100)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(over, b"89");
}

#[tokio::test]
async fn fs_offset_beyond_size_is_invalid_range() {
    let (_dir, backend) = fs_backend();
    let token = backend.write(&KEY, Bytes::from("abc"), &HINTS).await.unwrap();

    let result = backend.open_range(&token, Some(ByteRange::from(4))).await;
    assert!(matches!(result, Err(BackendError::InvalidRange(_))));
}

#[tokio::test]
async fn fs_open_missing_token_is_not_found() {
    let (dir, backend) = fs_backend();
    let missing = dir.path().join("attachments").join("nope.original");

    let result = backend.open_range(&missing.to_string_lossy(), None).await;
    assert!(matches!(result, Err(BackendError::NotFound(_))));
}

#[tokio::test]
async fn fs_delete_is_idempotent() {
    let (_dir, backend) = fs_backend();
    let token = backend.write(&KEY, Bytes::from("x"), &HINTS).await.unwrap();

    backend.delete(&token).await.unwrap();
    // Second delete of the same token must not error
    backend.delete(&token).await.unwrap();

    assert!(matches!(
        backend.open_range(&token, None).await,
        Err(BackendError::NotFound(_))
    ));
}

#[tokio::test]
async fn fs_rename_is_a_no_op() {
    let (_dir, backend) = fs_backend();
    let token = backend
        .write(&KEY, Bytes::from("contents"), &HINTS)
        .await
        .unwrap();

    let renamed = backend.rename(&token, "Pretty Name.bin").await.unwrap();
    assert_eq!(renamed, token);

    let read = read_all(backend.open_range(&renamed, None).await.unwrap()).await;
    assert_eq!(read, b"contents");
}

#[tokio::test]
async fn fs_write_overwrites_same_key() {
    let (_dir, backend) = fs_backend();
    backend.write(&KEY, Bytes::from("first"), &HINTS).await.unwrap();
    let token = backend
        .write(&KEY, Bytes::from("second"), &HINTS)
        .await
        .unwrap();

    let read = read_all(backend.open_range(&token, None).await.unwrap()).await;
    assert_eq!(read, b"second");
}

// ============================================================================
// Blob store backend
// ============================================================================

#[tokio::test]
async fn blob_write_then_full_read_round_trips() {
    let (_dir, backend) = blob_backend();
    let data = Bytes::from("blob payload");

    let token = backend.write(&KEY, data.clone(), &HINTS).await.unwrap();
    let read = read_all(backend.open_range(&token, None).await.unwrap()).await;
    assert_eq!(read, data);
}

#[tokio::test]
async fn blob_multi_chunk_round_trip_and_ranges() {
    let (_dir, backend) = blob_backend();
    // Spans three 256 KiB chunks
    let data = pattern(600_000);
    let token = backend
        .write(&KEY, Bytes::from(data.clone()), &HINTS)
        .await
        .unwrap();

    let read = read_all(backend.open_range(&token, None).await.unwrap()).await;
    assert_eq!(read, data);

    // A window crossing the first chunk boundary
    let window = read_all(
        backend
            .open_range(&token, Some(ByteRange::span(262_000, 10_000)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(window, data[262_000..272_000]);

    // Open-ended range from inside the last chunk
    let tail = read_all(
        backend
            .open_range(&token, Some(ByteRange::from(599_990)))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(tail, data[599_990..]);
}

#[tokio::test]
async fn blob_empty_object_round_trips() {
    let (_dir, backend) = blob_backend();
    let token = backend.write(&KEY, Bytes::new(), &HINTS).await.unwrap();

    let read = read_all(backend.open_range(&token, None).await.unwrap()).await;
    assert!(read.is_empty());
}

#[tokio::test]
async fn blob_offset_beyond_size_is_invalid_range() {
    let (_dir, backend) = blob_backend();
    let token = backend.write(&KEY, Bytes::from("abc"), &HINTS).await.unwrap();

    let result = backend.open_range(&token, Some(ByteRange::from(10))).await;
    assert!(matches!(result, Err(BackendError::InvalidRange(_))));
}

#[tokio::test]
async fn blob_delete_is_idempotent_and_removes_chunks() {
    let (_dir, backend) = blob_backend();
    let token = backend
        .write(&KEY, Bytes::from(pattern(300_000)), &HINTS)
        .await
        .unwrap();

    backend.delete(&token).await.unwrap();
    backend.delete(&token).await.unwrap();

    assert!(matches!(
        backend.open_range(&token, None).await,
        Err(BackendError::NotFound(_))
    ));
}

#[tokio::test]
async fn blob_rename_keeps_token_and_content() {
    let (_dir, backend) = blob_backend();
    let token = backend
        .write(&KEY, Bytes::from("renamable"), &HINTS)
        .await
        .unwrap();

    let renamed = backend.rename(&token, "new-name.txt").await.unwrap();
    assert_eq!(renamed, token);

    let read = read_all(backend.open_range(&renamed, None).await.unwrap()).await;
    assert_eq!(read, b"renamable");
}

#[tokio::test]
async fn blob_rename_missing_token_is_not_found() {
    let (_dir, backend) = blob_backend();
    let result = backend.rename("no-such-blob", "name").await;
    assert!(matches!(result, Err(BackendError::NotFound(_))));
}

#[tokio::test]
async fn blob_writes_never_share_tokens() {
    let (_dir, backend) = blob_backend();
    let first = backend.write(&KEY, Bytes::from("one"), &HINTS).await.unwrap();
    let second = backend.write(&KEY, Bytes::from("two"), &HINTS).await.unwrap();
    assert_ne!(first, second);

    // Both blobs remain independently readable
    assert_eq!(read_all(backend.open_range(&first, None).await.unwrap()).await, b"one");
    assert_eq!(read_all(backend.open_range(&second, None).await.unwrap()).await, b"two");
}

// ============================================================================
// Cross-backend relocation
// ============================================================================

#[tokio::test]
async fn relocate_filesystem_to_blob() {
    let dir = tempfile::tempdir().unwrap();
    let fs = FilesystemBackend::new(dir.path().join("attachments")).unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let blob = BlobStoreBackend::new(db);

    let data = pattern(300_000);
    let fs_token = fs.write(&KEY, Bytes::from(data.clone()), &HINTS).await.unwrap();

    let blob_token = blob.relocate_from(&fs, &fs_token, &KEY, &HINTS).await.unwrap();
    let read = read_all(blob.open_range(&blob_token, None).await.unwrap()).await;
    assert_eq!(read, data);

    // The source is untouched by relocation; deleting it is the caller's
    // decision.
    let source = read_all(fs.open_range(&fs_token, None).await.unwrap()).await;
    assert_eq!(source, data);
}

#[tokio::test]
async fn relocate_blob_to_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let fs = FilesystemBackend::new(dir.path().join("attachments")).unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let blob = BlobStoreBackend::new(db);

    let data = pattern(10_000);
    let blob_token = blob.write(&KEY, Bytes::from(data.clone()), &HINTS).await.unwrap();

    let fs_token = fs.relocate_from(&blob, &blob_token, &KEY, &HINTS).await.unwrap();
    let read = read_all(fs.open_range(&fs_token, None).await.unwrap()).await;
    assert_eq!(read, data);
}

#[tokio::test]
async fn relocate_filesystem_to_filesystem_fast_path() {
    let dir = tempfile::tempdir().unwrap();
    let source = FilesystemBackend::new(dir.path().join("a")).unwrap();
    let target = FilesystemBackend::new(dir.path().join("b")).unwrap();

    let token = source.write(&KEY, Bytes::from("copy me"), &HINTS).await.unwrap();
    let new_token = target.relocate_from(&source, &token, &KEY, &HINTS).await.unwrap();

    assert_ne!(new_token, token);
    let read = read_all(target.open_range(&new_token, None).await.unwrap()).await;
    assert_eq!(read, b"copy me");
}

#[tokio::test]
async fn stream_copy_preserves_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let fs = FilesystemBackend::new(dir.path().join("attachments")).unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    let blob = BlobStoreBackend::new(db);

    let data = pattern(50_000);
    let fs_token = fs.write(&KEY, Bytes::from(data.clone()), &HINTS).await.unwrap();

    let blob_token = stream_copy(&fs, &fs_token, &blob, &KEY, &HINTS).await.unwrap();
    let read = read_all(blob.open_range(&blob_token, None).await.unwrap()).await;
    assert_eq!(read, data);
}
