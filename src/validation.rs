//! Upload validation: MIME allowlist, size cap, optional external checker.

use std::path::Path;
use std::time::Duration;

use tokio::process::Command;

use crate::storage::models::{FileRecord, ORIGINAL_VERSION};

/// Outcome of a validation pass. Never persisted: an invalid attachment is
/// removed outright, a valid one proceeds to migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationVerdict {
    Valid,
    Invalid(String),
}

impl ValidationVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationVerdict::Valid)
    }
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    /// Empty = allow all.
    pub allowed_mime_types: Vec<String>,
    /// 0 = unlimited.
    pub max_size_bytes: u64,
    /// Command template containing a `{file}` placeholder. Exit status zero
    /// means the file passed. Templates without the placeholder are
    /// discarded at config load.
    pub external_program: Option<String>,
    pub external_timeout: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            allowed_mime_types: Vec::new(),
            max_size_bytes: 0,
            external_program: None,
            external_timeout: Duration::from_secs(60),
        }
    }
}

/// Runs the configured checks against a freshly landed upload. Checks
/// short-circuit: the first failure decides the verdict. Deterministic for
/// the same config and bytes.
pub struct ValidationPipeline {
    config: ValidationConfig,
}

impl ValidationPipeline {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    pub fn needs_local_copy(&self) -> bool {
        self.config.external_program.is_some()
    }

    /// Validate a record. `local_copy` is a readable path to the original
    /// version's bytes; required only when an external checker is
    /// configured (the caller materializes one if the bytes have already
    /// left the filesystem backend).
    pub async fn validate(
        &self,
        record: &FileRecord,
        local_copy: Option<&Path>,
    ) -> ValidationVerdict {
        let content_type = record.content_type().unwrap_or("application/octet-stream");

        if !self.config.allowed_mime_types.is_empty()
            && !self
                .config
                .allowed_mime_types
                .iter()
                .any(|allowed| allowed == content_type)
        {
            return ValidationVerdict::Invalid(format!(
                "content type '{content_type}' is not allowed"
            ));
        }

        let size = record
            .versions
            .get(ORIGINAL_VERSION)
            .map(|v| v.size)
            .unwrap_or(0);
        if self.config.max_size_bytes > 0 && size > self.config.max_size_bytes {
            return ValidationVerdict::Invalid(format!(
                "size {size} exceeds maximum of {} bytes",
                self.config.max_size_bytes
            ));
        }

        if let Some(ref template) = self.config.external_program {
            let Some(path) = local_copy else {
                return ValidationVerdict::Invalid(
                    "external checker configured but no local copy was available".to_string(),
                );
            };
            return self.run_external(template, path).await;
        }

        ValidationVerdict::Valid
    }

    async fn run_external(&self, template: &str, path: &Path) -> ValidationVerdict {
        let command_line = template.replace("{file}", &shell_quote(&path.to_string_lossy()));

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.config.external_timeout, output).await {
            Ok(Ok(output)) if output.status.success() => ValidationVerdict::Valid,
            Ok(Ok(output)) => {
                tracing::debug!(
                    status = ?output.status.code(),
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "external checker rejected file"
                );
                ValidationVerdict::Invalid("external checker rejected the file".to_string())
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "external checker failed to run");
                ValidationVerdict::Invalid(format!("external checker failed to run: {e}"))
            }
            // A hung checker must not leave the attachment in Validating
            // forever; treat the timeout as a rejection, not a retry.
            Err(_) => ValidationVerdict::Invalid(format!(
                "external checker timed out after {:?}",
                self.config.external_timeout
            )),
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::storage::models::{
        AttachmentStatus, FileType, StorageKind, VersionEntry,
    };

    fn record(content_type: &str, size: u64) -> FileRecord {
        let now = chrono::Utc::now();
        let mut versions = HashMap::new();
        versions.insert(
            ORIGINAL_VERSION.to_string(),
            VersionEntry {
                storage: StorageKind::Filesystem,
                location: "/tmp/nowhere".to_string(),
                size,
                content_type: content_type.to_string(),
            },
        );
        FileRecord {
            id: "v-1".to_string(),
            name: "file.bin".to_string(),
            extension: Some("bin".to_string()),
            file_type: FileType::from_mime(content_type),
            status: AttachmentStatus::Validating,
            created_at: now,
            updated_at: now,
            parent_id: None,
            copy_storage: None,
            meta: None,
            versions,
        }
    }

    #[tokio::test]
    async fn empty_allowlist_allows_everything() {
        let pipeline = ValidationPipeline::new(ValidationConfig::default());
        let verdict = pipeline.validate(&record("video/x-flv", 10), None).await;
        assert!(verdict.is_valid());
    }

    #[tokio::test]
    async fn disallowed_mime_type_is_rejected() {
        let pipeline = ValidationPipeline::new(ValidationConfig {
            allowed_mime_types: vec!["image/png".to_string()],
            ..Default::default()
        });
        let verdict = pipeline.validate(&record("text/plain", 10), None).await;
        assert!(matches!(verdict, ValidationVerdict::Invalid(_)));
    }

    #[tokio::test]
    async fn oversize_is_rejected() {
        let pipeline = ValidationPipeline::new(ValidationConfig {
            max_size_bytes: 100,
            ..Default::default()
        });
        assert!(pipeline.validate(&record("image/png", 100), None).await.is_valid());
        assert!(matches!(
            pipeline.validate(&record("image/png", 101), None).await,
            ValidationVerdict::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn external_checker_verdict_follows_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("probe");
        std::fs::write(&file, b"x").unwrap();

        let passing = ValidationPipeline::new(ValidationConfig {
            external_program: Some("test -f {file}".to_string()),
            ..Default::default()
        });
        assert!(passing
            .validate(&record("image/png", 1), Some(&file))
            .await
            .is_valid());

        let failing = ValidationPipeline::new(ValidationConfig {
            external_program: Some("test ! -f {file}".to_string()),
            ..Default::default()
        });
        assert!(matches!(
            failing.validate(&record("image/png", 1), Some(&file)).await,
            ValidationVerdict::Invalid(_)
        ));
    }

    #[tokio::test]
    async fn external_checker_timeout_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("probe");
        std::fs::write(&file, b"x").unwrap();

        let pipeline = ValidationPipeline::new(ValidationConfig {
            external_program: Some("sleep 5 && test -f {file}".to_string()),
            external_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        assert!(matches!(
            pipeline.validate(&record("image/png", 1), Some(&file)).await,
            ValidationVerdict::Invalid(_)
        ));
    }
}
