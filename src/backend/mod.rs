mod blob;
mod filesystem;
mod s3;

pub use blob::BlobStoreBackend;
pub use filesystem::FilesystemBackend;
pub use s3::{ObjectStoreBackend, S3Config};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::storage::models::StorageKind;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid byte range: {0}")]
    InvalidRange(String),
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Lazy byte source positioned at the requested offset.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

/// Half-open byte range: `offset` bytes in, `length` bytes long
/// (to the end when `length` is `None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn from(offset: u64) -> Self {
        Self {
            offset,
            length: None,
        }
    }

    pub fn span(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length: Some(length),
        }
    }
}

/// Identity of a version's bytes, independent of any backend. Backends
/// derive their native location from this -- never from the display name.
#[derive(Debug, Clone, Copy)]
pub struct ObjectKey<'a> {
    pub record_id: &'a str,
    pub version: &'a str,
}

impl ObjectKey<'_> {
    /// Collision-free flat name for backends that key by a single string.
    pub fn flat_name(&self) -> String {
        format!("{}.{}", self.record_id, self.version)
    }
}

/// Advisory metadata accompanying a write. Backends that surface display
/// metadata (object store Content-Disposition, blob filename) record it;
/// the filesystem backend ignores it.
#[derive(Debug, Clone, Copy)]
pub struct WriteHints<'a> {
    pub content_type: &'a str,
    pub display_name: &'a str,
}

/// Abstraction over attachment storage backends.
///
/// Location tokens are backend-specific (a path, a blob id, an object key)
/// and opaque to callers; the raw bytes are meaningless without the
/// metadata DB.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> StorageKind;

    /// Durably persist a version's bytes. Atomic from the caller's point of
    /// view: either the full content is retrievable afterwards, or nothing
    /// was committed. Returns the location token the bytes live under.
    async fn write(
        &self,
        key: &ObjectKey<'_>,
        data: Bytes,
        hints: &WriteHints<'_>,
    ) -> Result<String, BackendError>;

    /// Open a reader over `range` (the whole object when `None`).
    async fn open_range(
        &self,
        token: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteReader, BackendError>;

    /// Remove bytes. Idempotent: an already-absent token is not an error.
    async fn delete(&self, token: &str) -> Result<(), BackendError>;

    /// Update backend-visible display metadata without moving bytes.
    /// Returns the (possibly reissued) location token.
    async fn rename(&self, token: &str, new_display_name: &str) -> Result<String, BackendError>;

    /// Copy bytes in from another backend. The default is the portable
    /// stream copy; variants override it where a server-side path exists
    /// and fail fast when that path does not apply, leaving the caller to
    /// fall back.
    async fn relocate_from(
        &self,
        source: &dyn StorageBackend,
        source_token: &str,
        key: &ObjectKey<'_>,
        hints: &WriteHints<'_>,
    ) -> Result<String, BackendError> {
        stream_copy(source, source_token, self, key, hints).await
    }
}

/// Portable copy path: read everything from `source`, write it to `target`.
pub async fn stream_copy<T: StorageBackend + ?Sized>(
    source: &dyn StorageBackend,
    source_token: &str,
    target: &T,
    key: &ObjectKey<'_>,
    hints: &WriteHints<'_>,
) -> Result<String, BackendError> {
    let mut reader = source.open_range(source_token, None).await?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    target.write(key, Bytes::from(buf), hints).await
}

/// The configured backends, keyed by kind. The filesystem landing backend
/// is always present; the others depend on configuration.
pub struct BackendSet {
    landing: Arc<dyn StorageBackend>,
    backends: HashMap<StorageKind, Arc<dyn StorageBackend>>,
}

impl BackendSet {
    pub fn new(landing: Arc<dyn StorageBackend>) -> Self {
        debug_assert_eq!(landing.kind(), StorageKind::Filesystem);
        let mut backends: HashMap<StorageKind, Arc<dyn StorageBackend>> = HashMap::new();
        backends.insert(landing.kind(), Arc::clone(&landing));
        Self { landing, backends }
    }

    pub fn register(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    pub fn get(&self, kind: StorageKind) -> Option<&Arc<dyn StorageBackend>> {
        self.backends.get(&kind)
    }

    /// The backend that receives the first, synchronous write of every
    /// upload.
    pub fn landing(&self) -> &Arc<dyn StorageBackend> {
        &self.landing
    }
}
