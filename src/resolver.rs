//! Maps a record's per-version storage tag to the backend holding its bytes.

use std::sync::Arc;

use thiserror::Error;

use crate::backend::{BackendSet, StorageBackend};
use crate::storage::models::{FileRecord, StorageKind};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("attachment {id} has no version '{version}'")]
    UnknownVersion { id: String, version: String },
    /// Defensive: a stored tag naming an unconfigured backend means the
    /// deployment lost a backend the data still lives in.
    #[error("attachment {id} version '{version}' is tagged for unconfigured backend '{backend}'")]
    UnknownBackend {
        id: String,
        version: String,
        backend: StorageKind,
    },
}

/// Pure lookup from `(record, version name)` to the responsible backend.
/// No side effects; every read, rename, move, and delete goes through here
/// rather than assuming where bytes live.
pub struct StrategyResolver {
    backends: Arc<BackendSet>,
}

impl StrategyResolver {
    pub fn new(backends: Arc<BackendSet>) -> Self {
        Self { backends }
    }

    pub fn resolve<'a>(
        &'a self,
        record: &FileRecord,
        version: &str,
    ) -> Result<&'a Arc<dyn StorageBackend>, ResolveError> {
        let entry = record
            .versions
            .get(version)
            .ok_or_else(|| ResolveError::UnknownVersion {
                id: record.id.clone(),
                version: version.to_string(),
            })?;

        self.backends
            .get(entry.storage)
            .ok_or_else(|| ResolveError::UnknownBackend {
                id: record.id.clone(),
                version: version.to_string(),
                backend: entry.storage,
            })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::backend::FilesystemBackend;
    use crate::storage::models::{
        AttachmentStatus, FileType, VersionEntry, ORIGINAL_VERSION,
    };

    fn record_with(storage: StorageKind) -> FileRecord {
        let now = chrono::Utc::now();
        let mut versions = HashMap::new();
        versions.insert(
            ORIGINAL_VERSION.to_string(),
            VersionEntry {
                storage,
                location: "somewhere".to_string(),
                size: 3,
                content_type: "text/plain".to_string(),
            },
        );
        FileRecord {
            id: "att-1".to_string(),
            name: "notes.txt".to_string(),
            extension: Some("txt".to_string()),
            file_type: FileType::Document,
            status: AttachmentStatus::Stored,
            created_at: now,
            updated_at: now,
            parent_id: None,
            copy_storage: None,
            meta: None,
            versions,
        }
    }

    fn resolver() -> (tempfile::TempDir, StrategyResolver) {
        let dir = tempfile::tempdir().unwrap();
        let fs = FilesystemBackend::new(dir.path()).unwrap();
        let set = BackendSet::new(Arc::new(fs));
        (dir, StrategyResolver::new(Arc::new(set)))
    }

    #[test]
    fn resolves_configured_backend() {
        let (_dir, resolver) = resolver();
        let record = record_with(StorageKind::Filesystem);
        let backend = resolver.resolve(&record, ORIGINAL_VERSION).unwrap();
        assert_eq!(backend.kind(), StorageKind::Filesystem);
    }

    #[test]
    fn unknown_version_is_an_error() {
        let (_dir, resolver) = resolver();
        let record = record_with(StorageKind::Filesystem);
        assert!(matches!(
            resolver.resolve(&record, "thumbnail"),
            Err(ResolveError::UnknownVersion { .. })
        ));
    }

    #[test]
    fn unconfigured_backend_is_an_error() {
        let (_dir, resolver) = resolver();
        let record = record_with(StorageKind::ObjectStore);
        assert!(matches!(
            resolver.resolve(&record, ORIGINAL_VERSION),
            Err(ResolveError::UnknownBackend { .. })
        ));
    }
}
