//! attachment-store - Multi-backend attachment storage with deferred
//! validation and backend migration
//!
//! Uploads land on a local filesystem backend, are validated
//! asynchronously (MIME allowlist, size cap, optional external checker),
//! and are then migrated to a permanent backend:
//! - Swappable storage backends (filesystem, chunked blob store,
//!   S3-compatible object store)
//! - Per-version storage tags resolved on every read, move, rename, and
//!   delete
//! - Copy-verify-commit-delete migration that never leaves metadata
//!   pointing at missing bytes
//! - redb embedded database for metadata (ACID, MVCC, crash-safe)
//! - REST API with multipart upload and ranged downloads

pub mod api;
pub mod backend;
pub mod config;
pub mod lifecycle;
pub mod migration;
pub mod resolver;
pub mod storage;
pub mod validation;

use std::sync::Arc;

use config::Config;
use lifecycle::AttachmentLifecycle;
use storage::Database;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub lifecycle: Arc<AttachmentLifecycle>,
}
