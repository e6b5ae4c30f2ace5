use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{
    stream_copy, BackendError, ByteRange, ByteReader, ObjectKey, StorageBackend, WriteHints,
};
use crate::storage::models::StorageKind;

/// Local filesystem backend. This is the landing backend: every upload is
/// first written here, keyed by record id and version name -- the human
/// filename never touches the disk, so concurrent uploads cannot collide
/// and no path traversal is possible.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create the backend, ensuring the root directory exists.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, std::io::Error> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn object_path(&self, key: &ObjectKey<'_>) -> PathBuf {
        self.root.join(key.flat_name())
    }
}

#[async_trait]
impl StorageBackend for FilesystemBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Filesystem
    }

    async fn write(
        &self,
        key: &ObjectKey<'_>,
        data: Bytes,
        _hints: &WriteHints<'_>,
    ) -> Result<String, BackendError> {
        let path = self.object_path(key);

        // Atomic write: temp file + rename. The temp name keeps the version
        // suffix so concurrent writes of sibling versions cannot collide.
        let temp_path = self.root.join(format!("{}.tmp", key.flat_name()));
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp_path, &path).await?;

        Ok(path.to_string_lossy().into_owned())
    }

    async fn open_range(
        &self,
        token: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteReader, BackendError> {
        let mut file = match tokio::fs::File::open(token).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackendError::NotFound(token.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let total = file.metadata().await?.len();
        let range = range.unwrap_or(ByteRange::from(0));
        if range.offset > total {
            return Err(BackendError::InvalidRange(format!(
                "offset {} beyond object size {total}",
                range.offset
            )));
        }

        file.seek(SeekFrom::Start(range.offset)).await?;
        let remaining = total - range.offset;
        let limit = range.length.map_or(remaining, |l| l.min(remaining));
        Ok(Box::new(file.take(limit)))
    }

    async fn delete(&self, token: &str) -> Result<(), BackendError> {
        match tokio::fs::remove_file(token).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename(&self, token: &str, _new_display_name: &str) -> Result<String, BackendError> {
        // Bytes are keyed by id, not name; nothing here is name-visible.
        Ok(token.to_string())
    }

    async fn relocate_from(
        &self,
        source: &dyn StorageBackend,
        source_token: &str,
        key: &ObjectKey<'_>,
        hints: &WriteHints<'_>,
    ) -> Result<String, BackendError> {
        if source.kind() != StorageKind::Filesystem {
            return stream_copy(source, source_token, self, key, hints).await;
        }

        // Same-filesystem fast path, still atomic via temp + rename.
        let path = self.object_path(key);
        let temp_path = self.root.join(format!("{}.tmp", key.flat_name()));
        tokio::fs::copy(source_token, &temp_path).await?;
        tokio::fs::rename(&temp_path, &path).await?;
        Ok(path.to_string_lossy().into_owned())
    }
}
