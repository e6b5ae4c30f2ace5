//! Drives an attachment from landing write through validation, migration to
//! its permanent backend, and eventual removal.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::backend::{BackendError, BackendSet, ByteRange, ByteReader, ObjectKey, WriteHints};
use crate::migration::{MigrationController, MigrationError};
use crate::resolver::{ResolveError, StrategyResolver};
use crate::storage::models::{
    extension_of, AttachmentStatus, FileRecord, FileType, StorageKind, VersionEntry,
    ORIGINAL_VERSION,
};
use crate::storage::{Database, DatabaseError};
use crate::validation::{ValidationPipeline, ValidationVerdict};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("attachment {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
}

/// What the deferred processing chain decided.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Validation failed; the record and its bytes are gone.
    Rejected(String),
    /// Validated and at rest on the given backend.
    Stored(StorageKind),
}

/// Metadata passed along when creating an attachment.
#[derive(Debug, Default)]
pub struct NewAttachment {
    pub original_name: String,
    pub declared_mime: Option<String>,
    pub parent_id: Option<String>,
    pub copy_storage: Option<StorageKind>,
    pub meta: Option<HashMap<String, serde_json::Value>>,
}

/// A resolved download: reader plus everything a transport needs to build
/// range responses.
pub struct Download {
    pub reader: ByteReader,
    pub content_type: String,
    pub file_name: String,
    pub total_size: u64,
    /// The byte window actually served.
    pub offset: u64,
    pub length: u64,
    pub cache_control: &'static str,
}

pub struct AttachmentLifecycle {
    db: Database,
    backends: Arc<BackendSet>,
    resolver: StrategyResolver,
    validator: ValidationPipeline,
    migrator: Arc<MigrationController>,
    /// Where accepted uploads end up when the record carries no hint.
    permanent_backend: StorageKind,
}

impl AttachmentLifecycle {
    pub fn new(
        db: Database,
        backends: Arc<BackendSet>,
        validator: ValidationPipeline,
        permanent_backend: StorageKind,
    ) -> Self {
        let migrator = Arc::new(MigrationController::new(db.clone(), Arc::clone(&backends)));
        let resolver = StrategyResolver::new(Arc::clone(&backends));
        Self {
            db,
            backends,
            resolver,
            validator,
            migrator,
            permanent_backend,
        }
    }

    // ========================================================================
    // Landing
    // ========================================================================

    /// Land an upload: write bytes to the filesystem backend and create the
    /// record with its `original` version stamped accordingly. Synchronous
    /// and not deferrable -- a landing failure aborts the upload.
    ///
    /// Validation and migration are NOT run here; callers follow up with
    /// [`Self::schedule_processing`] (or drive [`Self::process_upload`]
    /// directly).
    pub async fn store_new(
        &self,
        data: Bytes,
        new: NewAttachment,
    ) -> Result<FileRecord, LifecycleError> {
        let id = uuid::Uuid::new_v4().to_string();
        debug_assert!(!id.is_empty());

        // MIME: declared unless it is the generic fallback, else guessed
        // from the filename.
        let content_type = new
            .declared_mime
            .filter(|ct| ct != "application/octet-stream")
            .or_else(|| {
                mime_guess::from_path(&new.original_name)
                    .first()
                    .map(|m| m.to_string())
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());

        let size = data.len() as u64;
        let key = ObjectKey {
            record_id: &id,
            version: ORIGINAL_VERSION,
        };
        let hints = WriteHints {
            content_type: &content_type,
            display_name: &new.original_name,
        };
        let location = self.backends.landing().write(&key, data, &hints).await?;

        let now = chrono::Utc::now();
        let mut versions = HashMap::new();
        versions.insert(
            ORIGINAL_VERSION.to_string(),
            VersionEntry {
                storage: StorageKind::Filesystem,
                location,
                size,
                content_type: content_type.clone(),
            },
        );

        let record = FileRecord {
            id: id.clone(),
            extension: extension_of(&new.original_name),
            name: new.original_name,
            file_type: FileType::from_mime(&content_type),
            status: AttachmentStatus::Landed,
            created_at: now,
            updated_at: now,
            parent_id: new.parent_id,
            copy_storage: new.copy_storage,
            meta: new.meta,
            versions,
        };

        if let Err(e) = self.db.put_record(&record) {
            // The record never existed; don't leave its bytes behind.
            if let Some(entry) = record.versions.get(ORIGINAL_VERSION) {
                let _ = self.backends.landing().delete(&entry.location).await;
            }
            return Err(e.into());
        }

        tracing::info!(
            attachment_id = %record.id,
            size,
            content_type = %content_type,
            "attachment landed"
        );
        Ok(record)
    }

    /// Land a lazily generated derivative (thumbnail etc.) on the landing
    /// backend, stamping its own tag. It joins any later migration.
    pub async fn store_version(
        &self,
        id: &str,
        version: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<VersionEntry, LifecycleError> {
        let record = self
            .db
            .get_record(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        let size = data.len() as u64;
        let key = ObjectKey {
            record_id: id,
            version,
        };
        let hints = WriteHints {
            content_type,
            display_name: &record.name,
        };
        let location = self.backends.landing().write(&key, data, &hints).await?;

        let entry = VersionEntry {
            storage: StorageKind::Filesystem,
            location,
            size,
            content_type: content_type.to_string(),
        };
        if !self.db.upsert_version(id, version, entry.clone())? {
            // Record vanished between the read and the write.
            let _ = self.backends.landing().delete(&entry.location).await;
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        Ok(entry)
    }

    // ========================================================================
    // Deferred processing
    // ========================================================================

    /// Fire-and-forget the validate-then-migrate chain. The caller's
    /// request path returns immediately; failures are logged, not
    /// surfaced.
    pub fn schedule_processing(self: &Arc<Self>, id: String) {
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = lifecycle.process_upload(&id).await {
                tracing::error!(attachment_id = %id, error = %e, "deferred processing failed");
            }
        });
    }

    /// Validate, then migrate to the permanent backend. For one record the
    /// two always run in this order within one task; distinct records are
    /// fully independent.
    pub async fn process_upload(&self, id: &str) -> Result<ProcessOutcome, LifecycleError> {
        if !self.db.set_status(id, AttachmentStatus::Validating)? {
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        let record = self
            .db
            .get_record(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        match self.run_validation(&record).await? {
            ValidationVerdict::Invalid(reason) => {
                tracing::info!(attachment_id = %id, %reason, "attachment rejected, removing");
                self.remove(id).await?;
                Ok(ProcessOutcome::Rejected(reason))
            }
            ValidationVerdict::Valid => {
                let target = record.copy_storage.unwrap_or(self.permanent_backend);
                self.move_to_backend(id, target).await?;
                Ok(ProcessOutcome::Stored(target))
            }
        }
    }

    /// Re-run validation on an existing attachment; an invalid verdict
    /// removes it, exactly like the first pass.
    pub async fn revalidate(&self, id: &str) -> Result<ProcessOutcome, LifecycleError> {
        let record = self
            .db
            .get_record(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        match self.run_validation(&record).await? {
            ValidationVerdict::Invalid(reason) => {
                tracing::info!(attachment_id = %id, %reason, "attachment rejected on revalidation");
                self.remove(id).await?;
                Ok(ProcessOutcome::Rejected(reason))
            }
            ValidationVerdict::Valid => {
                let storage = record
                    .versions
                    .get(ORIGINAL_VERSION)
                    .map(|v| v.storage)
                    .unwrap_or(StorageKind::Filesystem);
                Ok(ProcessOutcome::Stored(storage))
            }
        }
    }

    async fn run_validation(
        &self,
        record: &FileRecord,
    ) -> Result<ValidationVerdict, LifecycleError> {
        if !self.validator.needs_local_copy() {
            return Ok(self.validator.validate(record, None).await);
        }

        let (path, _temp) = self.local_copy_of(record).await?;
        Ok(self.validator.validate(record, Some(&path)).await)
    }

    /// A locally readable path to the original bytes. Free while they are
    /// still on the filesystem backend; otherwise a temporary copy that is
    /// cleaned up when the guard drops.
    async fn local_copy_of(
        &self,
        record: &FileRecord,
    ) -> Result<(PathBuf, Option<TempCopy>), LifecycleError> {
        let entry = record.versions.get(ORIGINAL_VERSION).ok_or_else(|| {
            ResolveError::UnknownVersion {
                id: record.id.clone(),
                version: ORIGINAL_VERSION.to_string(),
            }
        })?;

        if entry.storage == StorageKind::Filesystem {
            return Ok((PathBuf::from(&entry.location), None));
        }

        let backend = self.resolver.resolve(record, ORIGINAL_VERSION)?;
        let mut reader = backend.open_range(&entry.location, None).await?;
        let mut buf = Vec::with_capacity(entry.size as usize);
        reader.read_to_end(&mut buf).await.map_err(BackendError::Io)?;

        let path = std::env::temp_dir().join(format!("attachment-check-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, &buf).await.map_err(BackendError::Io)?;
        Ok((path.clone(), Some(TempCopy { path })))
    }

    // ========================================================================
    // Moves, renames, removal
    // ========================================================================

    /// Migrate every version to `target`, tracking the state transition on
    /// the record. Invoked automatically after validation and explicitly
    /// via the administrative move.
    pub async fn move_to_backend(
        &self,
        id: &str,
        target: StorageKind,
    ) -> Result<(), LifecycleError> {
        if !self.db.set_status(id, AttachmentStatus::Migrating)? {
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        if let Err(e) = self.migrator.migrate(id, target).await {
            // The failed versions are still at their prior backends and the
            // move can be retried; don't leave the record claiming otherwise.
            let _ = self.db.set_status(id, AttachmentStatus::Stored);
            return Err(e.into());
        }
        self.db.set_status(id, AttachmentStatus::Stored)?;
        Ok(())
    }

    /// Change the display name. Serializes with migration through the same
    /// per-version locks; storage tags and byte content are untouched.
    pub async fn rename(&self, id: &str, new_name: &str) -> Result<FileRecord, LifecycleError> {
        let record = self
            .db
            .get_record(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        let mut version_names: Vec<String> = record.versions.keys().cloned().collect();
        version_names.sort();

        for version in &version_names {
            let lock = self.migrator.version_lock(id, version);
            let _guard = lock.lock().await;

            // Re-read under the lock; a migration may have moved this
            // version since the outer read.
            let Some(current) = self.db.get_record(id)? else {
                return Err(LifecycleError::NotFound(id.to_string()));
            };
            let Some(entry) = current.versions.get(version) else {
                continue;
            };
            let backend = self.resolver.resolve(&current, version)?;
            let new_location = backend.rename(&entry.location, new_name).await?;

            if new_location != entry.location {
                self.db.commit_version_move(
                    id,
                    version,
                    entry.storage,
                    &entry.location,
                    entry.storage,
                    &new_location,
                )?;
            }
        }

        if !self.db.commit_rename(id, new_name, &HashMap::new())? {
            return Err(LifecycleError::NotFound(id.to_string()));
        }
        self.db
            .get_record(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    /// Remove an attachment: resolve each version's *current* backend and
    /// delete there -- the record may have migrated since landing -- then
    /// drop the record.
    pub async fn remove(&self, id: &str) -> Result<(), LifecycleError> {
        let record = self
            .db
            .get_record(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        for (version, entry) in &record.versions {
            match self.resolver.resolve(&record, version) {
                Ok(backend) => {
                    if let Err(e) = backend.delete(&entry.location).await {
                        tracing::warn!(
                            attachment_id = %id,
                            version,
                            backend = %entry.storage,
                            error = %e,
                            "failed to delete bytes during removal"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!(attachment_id = %id, version, error = %e, "cannot resolve backend during removal");
                }
            }
        }

        self.db.delete_record(id)?;
        tracing::info!(attachment_id = %id, "attachment removed");
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn record(&self, id: &str) -> Result<FileRecord, LifecycleError> {
        self.db
            .get_record(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    /// Open a version for download, honoring an optional byte range. The
    /// backend is resolved per request -- never assumed.
    pub async fn open_download(
        &self,
        id: &str,
        version: &str,
        range: Option<ByteRange>,
    ) -> Result<Download, LifecycleError> {
        let record = self
            .db
            .get_record(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;
        let backend = self.resolver.resolve(&record, version)?;
        let entry = record
            .versions
            .get(version)
            .expect("resolve succeeded, version exists");

        let offset = range.map_or(0, |r| r.offset);
        let remaining = entry.size.saturating_sub(offset);
        let length = range
            .and_then(|r| r.length)
            .map_or(remaining, |l| l.min(remaining));

        let reader = backend.open_range(&entry.location, range).await?;

        Ok(Download {
            reader,
            content_type: entry.content_type.clone(),
            file_name: record.name.clone(),
            total_size: entry.size,
            offset,
            length,
            cache_control: "public, max-age=3600",
        })
    }
}

/// Deletes the materialized validation copy when dropped.
struct TempCopy {
    path: PathBuf,
}

impl Drop for TempCopy {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
