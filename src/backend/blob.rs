use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{BackendError, ByteRange, ByteReader, ObjectKey, StorageBackend, WriteHints};
use crate::storage::models::StorageKind;
use crate::storage::{Database, DatabaseError, BLOB_CHUNKS, BLOB_META};

/// Chunk size for stored blobs. Large files are split so a ranged read
/// only touches the chunks it covers.
const CHUNK_SIZE: u64 = 256 * 1024;

/// Per-blob bookkeeping stored alongside the chunks.
#[derive(Debug, Serialize, Deserialize)]
struct BlobMeta {
    size: u64,
    chunk_size: u64,
    chunk_count: u32,
    content_type: String,
    /// Display filename, updated on rename. Not used for addressing.
    filename: String,
}

/// Chunked blob store persisted in the embedded database. Location tokens
/// are minted blob ids; every write creates a fresh blob, so writes never
/// clobber bytes another reader may be streaming.
pub struct BlobStoreBackend {
    db: Database,
}

impl BlobStoreBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn get_meta(&self, blob_id: &str) -> Result<Option<BlobMeta>, DatabaseError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(BLOB_META)?;
        match table.get(blob_id)? {
            Some(data) => Ok(Some(rmp_serde::from_slice(data.value())?)),
            None => Ok(None),
        }
    }
}

fn db_err<E: Into<DatabaseError>>(e: E) -> BackendError {
    BackendError::Backend(e.into().to_string())
}

#[async_trait]
impl StorageBackend for BlobStoreBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::BlobStore
    }

    async fn write(
        &self,
        _key: &ObjectKey<'_>,
        data: Bytes,
        hints: &WriteHints<'_>,
    ) -> Result<String, BackendError> {
        let blob_id = uuid::Uuid::new_v4().to_string();
        let chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE as usize).collect();

        let meta = BlobMeta {
            size: data.len() as u64,
            chunk_size: CHUNK_SIZE,
            chunk_count: chunks.len() as u32,
            content_type: hints.content_type.to_string(),
            filename: hints.display_name.to_string(),
        };

        // Meta and chunks land in one transaction: the blob id resolves to
        // either the complete content or nothing.
        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut meta_table = write_txn.open_table(BLOB_META).map_err(db_err)?;
            let encoded = rmp_serde::to_vec_named(&meta)
                .map_err(|e| BackendError::Backend(e.to_string()))?;
            meta_table
                .insert(blob_id.as_str(), encoded.as_slice())
                .map_err(db_err)?;

            let mut chunk_table = write_txn.open_table(BLOB_CHUNKS).map_err(db_err)?;
            for (index, chunk) in chunks.iter().enumerate() {
                chunk_table
                    .insert((blob_id.as_str(), index as u32), *chunk)
                    .map_err(db_err)?;
            }
        }
        write_txn.commit().map_err(db_err)?;

        Ok(blob_id)
    }

    async fn open_range(
        &self,
        token: &str,
        range: Option<ByteRange>,
    ) -> Result<ByteReader, BackendError> {
        let meta = self
            .get_meta(token)
            .map_err(db_err)?
            .ok_or_else(|| BackendError::NotFound(token.to_string()))?;

        let range = range.unwrap_or(ByteRange::from(0));
        if range.offset > meta.size {
            return Err(BackendError::InvalidRange(format!(
                "offset {} beyond blob size {}",
                range.offset, meta.size
            )));
        }

        let remaining = meta.size - range.offset;
        let limit = range.length.map_or(remaining, |l| l.min(remaining));
        if limit == 0 {
            return Ok(Box::new(std::io::Cursor::new(Vec::new())));
        }

        // Only the chunks the range covers are read.
        let first_chunk = (range.offset / meta.chunk_size) as u32;
        let last_chunk = ((range.offset + limit - 1) / meta.chunk_size) as u32;

        let read_txn = self.db.begin_read().map_err(db_err)?;
        let chunk_table = read_txn.open_table(BLOB_CHUNKS).map_err(db_err)?;

        let mut assembled = Vec::with_capacity(limit as usize);
        for index in first_chunk..=last_chunk {
            let chunk = chunk_table
                .get((token, index))
                .map_err(db_err)?
                .ok_or_else(|| BackendError::NotFound(format!("{token}#{index}")))?;
            assembled.extend_from_slice(chunk.value());
        }

        let skip = (range.offset - u64::from(first_chunk) * meta.chunk_size) as usize;
        let end = skip + limit as usize;
        let window = assembled[skip..end].to_vec();
        Ok(Box::new(std::io::Cursor::new(window)))
    }

    async fn delete(&self, token: &str) -> Result<(), BackendError> {
        let meta = match self.get_meta(token).map_err(db_err)? {
            Some(meta) => meta,
            // Already gone
            None => return Ok(()),
        };

        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut meta_table = write_txn.open_table(BLOB_META).map_err(db_err)?;
            meta_table.remove(token).map_err(db_err)?;

            let mut chunk_table = write_txn.open_table(BLOB_CHUNKS).map_err(db_err)?;
            for index in 0..meta.chunk_count {
                chunk_table.remove((token, index)).map_err(db_err)?;
            }
        }
        write_txn.commit().map_err(db_err)?;
        Ok(())
    }

    async fn rename(&self, token: &str, new_display_name: &str) -> Result<String, BackendError> {
        let mut meta = self
            .get_meta(token)
            .map_err(db_err)?
            .ok_or_else(|| BackendError::NotFound(token.to_string()))?;
        meta.filename = new_display_name.to_string();

        let write_txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut meta_table = write_txn.open_table(BLOB_META).map_err(db_err)?;
            let encoded = rmp_serde::to_vec_named(&meta)
                .map_err(|e| BackendError::Backend(e.to_string()))?;
            meta_table
                .insert(token, encoded.as_slice())
                .map_err(db_err)?;
        }
        write_txn.commit().map_err(db_err)?;

        Ok(token.to_string())
    }
}
