//! Moves a version's bytes between backends without ever leaving the
//! metadata pointing at bytes that do not exist.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use crate::backend::{stream_copy, BackendError, BackendSet, ObjectKey, WriteHints};
use crate::resolver::{ResolveError, StrategyResolver};
use crate::storage::models::StorageKind;
use crate::storage::{Database, DatabaseError};

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("attachment {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("target backend '{0}' is not configured")]
    TargetUnavailable(StorageKind),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("verification failed for version '{version}': expected {expected} bytes, found {found}")]
    VerifyMismatch {
        version: String,
        expected: u64,
        found: u64,
    },
    #[error("metadata commit conflict for version '{0}'")]
    CommitConflict(String),
}

/// Orchestrates copy -> verify -> commit -> delete per version.
///
/// The ordering guarantees there is no observable instant at which a
/// version's tag names a backend that does not hold its bytes. The only
/// tolerated failure mode is an orphaned copy at the old backend.
pub struct MigrationController {
    db: Database,
    backends: Arc<BackendSet>,
    resolver: StrategyResolver,
    /// At-most-one-in-flight guard per (record id, version name). Rename
    /// serializes through the same locks, so neither operation observes
    /// the other mid-flight.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl MigrationController {
    pub fn new(db: Database, backends: Arc<BackendSet>) -> Self {
        let resolver = StrategyResolver::new(Arc::clone(&backends));
        Self {
            db,
            backends,
            resolver,
            locks: DashMap::new(),
        }
    }

    /// The keyed mutex guarding one version's byte moves.
    pub(crate) fn version_lock(&self, id: &str, version: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(format!("{id}/{version}"))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Move every version of an attachment to `target`. Versions are
    /// independent; re-invoking with the same target is a no-op, and
    /// concurrent invocations converge on exactly one surviving copy.
    pub async fn migrate(&self, id: &str, target: StorageKind) -> Result<(), MigrationError> {
        if self.backends.get(target).is_none() {
            return Err(MigrationError::TargetUnavailable(target));
        }

        let record = self
            .db
            .get_record(id)?
            .ok_or_else(|| MigrationError::NotFound(id.to_string()))?;

        let mut version_names: Vec<String> = record.versions.keys().cloned().collect();
        version_names.sort();

        for version in &version_names {
            self.migrate_version(id, version, target).await?;
        }

        tracing::info!(attachment_id = %id, target = %target, "migration complete");
        Ok(())
    }

    async fn migrate_version(
        &self,
        id: &str,
        version: &str,
        target: StorageKind,
    ) -> Result<(), MigrationError> {
        let lock = self.version_lock(id, version);
        let _guard = lock.lock().await;

        // Re-read under the lock: a concurrent migration may have already
        // moved this version.
        let record = self
            .db
            .get_record(id)?
            .ok_or_else(|| MigrationError::NotFound(id.to_string()))?;
        let entry = record
            .versions
            .get(version)
            .ok_or_else(|| ResolveError::UnknownVersion {
                id: id.to_string(),
                version: version.to_string(),
            })?
            .clone();

        if entry.storage == target {
            tracing::debug!(attachment_id = %id, version, target = %target, "already at target, skipping");
            return Ok(());
        }

        let source = Arc::clone(self.resolver.resolve(&record, version)?);
        let target_backend = Arc::clone(
            self.backends
                .get(target)
                .ok_or(MigrationError::TargetUnavailable(target))?,
        );

        let key = ObjectKey {
            record_id: id,
            version,
        };
        let hints = WriteHints {
            content_type: &entry.content_type,
            display_name: &record.name,
        };

        // Copy: optimized path first, portable stream copy as fallback.
        let new_location = match target_backend
            .relocate_from(source.as_ref(), &entry.location, &key, &hints)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(
                    attachment_id = %id,
                    version,
                    error = %e,
                    "relocation failed, retrying as stream copy"
                );
                stream_copy(
                    source.as_ref(),
                    &entry.location,
                    target_backend.as_ref(),
                    &key,
                    &hints,
                )
                .await?
            }
        };

        // Verify the copy is readable and complete before anything is
        // committed or deleted.
        let found = match self.measure(&target_backend, &new_location).await {
            Ok(found) => found,
            Err(e) => {
                let _ = target_backend.delete(&new_location).await;
                return Err(e.into());
            }
        };
        if found != entry.size {
            let _ = target_backend.delete(&new_location).await;
            return Err(MigrationError::VerifyMismatch {
                version: version.to_string(),
                expected: entry.size,
                found,
            });
        }

        // Commit point: after this single metadata write the version IS at
        // the new backend, even if old-bytes deletion below never runs.
        let committed = self.db.commit_version_move(
            id,
            version,
            entry.storage,
            &entry.location,
            target,
            &new_location,
        )?;
        if !committed {
            let _ = target_backend.delete(&new_location).await;
            return Err(MigrationError::CommitConflict(version.to_string()));
        }

        // Stale-byte deletion failure is a storage leak, not a correctness
        // violation; never worth reverting a committed pointer for.
        if let Err(e) = source.delete(&entry.location).await {
            tracing::warn!(
                attachment_id = %id,
                version,
                backend = %entry.storage,
                error = %e,
                "failed to delete stale bytes after migration, leaving orphan"
            );
        }

        tracing::debug!(
            attachment_id = %id,
            version,
            from = %entry.storage,
            to = %target,
            "version migrated"
        );
        Ok(())
    }

    /// Byte count of a full read-back, proving the location is readable.
    async fn measure(
        &self,
        backend: &Arc<dyn crate::backend::StorageBackend>,
        token: &str,
    ) -> Result<u64, BackendError> {
        let mut reader = backend.open_range(token, None).await?;
        let mut found = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            found += n as u64;
        }
        Ok(found)
    }
}
