use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::backend::S3Config;
use crate::storage::models::StorageKind;
use crate::validation::ValidationConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Process-wide configuration. Built once at startup and passed into the
/// coordinator; nothing reads the environment after this.
#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub validation: ValidationConfig,
    /// Enables dangerous operations like purge. Must never be true in production.
    pub test_mode: bool,
    /// Transport-level cap on upload bodies, in bytes
    pub max_upload_size: u64,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Landing directory for uploads: `$WRITABLE_PATH/attachments`.
    /// Created recursively at startup.
    pub landing_path: PathBuf,
    /// Where accepted uploads are moved when the record carries no hint.
    pub permanent_backend: StorageKind,
    /// Object store settings (required when any backend tag can name it).
    pub s3: Option<S3Config>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        // The landing root is non-negotiable: without a writable path the
        // process must not accept a single upload.
        let writable_path = std::env::var("WRITABLE_PATH").map_err(|_| {
            ConfigError::ValidationError("WRITABLE_PATH must be set".to_string())
        })?;
        if writable_path.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "WRITABLE_PATH must not be empty".to_string(),
            ));
        }
        let landing_path = PathBuf::from(writable_path).join("attachments");

        let permanent_backend = std::env::var("PERMANENT_BACKEND")
            .unwrap_or_else(|_| "blobstore".to_string())
            .parse::<StorageKind>()
            .map_err(ConfigError::ValidationError)?;

        let allowed_mime_types: Vec<String> = std::env::var("ATTACHMENTS_UPLOAD_MIME_TYPES")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let max_size_bytes = std::env::var("ATTACHMENTS_UPLOAD_MAX_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        // A template without the placeholder can never see the file; treat
        // it as absent rather than failing every upload.
        let external_program = std::env::var("ATTACHMENTS_UPLOAD_EXTERNAL_PROGRAM")
            .ok()
            .filter(|template| {
                if template.contains("{file}") {
                    true
                } else {
                    tracing::warn!(
                        "ATTACHMENTS_UPLOAD_EXTERNAL_PROGRAM has no {{file}} placeholder, ignoring"
                    );
                    false
                }
            });

        let external_timeout_secs = std::env::var("ATTACHMENTS_EXTERNAL_PROGRAM_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);

        let test_mode = std::env::var("TEST_MODE")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let max_upload_size = std::env::var("MAX_UPLOAD_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(50 * 1024 * 1024); // 50MB

        let s3 = Self::load_s3()?;

        let config = Config {
            node: NodeConfig {
                bind_address,
                data_dir,
            },
            storage: StorageConfig {
                landing_path,
                permanent_backend,
                s3,
            },
            validation: ValidationConfig {
                allowed_mime_types,
                max_size_bytes,
                external_program,
                external_timeout: Duration::from_secs(external_timeout_secs),
            },
            test_mode,
            max_upload_size,
        };

        config.validate()?;
        Ok(config)
    }

    /// The S3 settings come as a group: none of them, or all the required
    /// ones.
    fn load_s3() -> Result<Option<S3Config>, ConfigError> {
        let endpoint = std::env::var("S3_ENDPOINT").ok();
        let region = std::env::var("S3_REGION").ok();
        let bucket = std::env::var("S3_BUCKET").ok();
        let access_key_id = std::env::var("S3_ACCESS_KEY_ID").ok();
        let secret_access_key = std::env::var("S3_SECRET_ACCESS_KEY").ok();
        let key_prefix = std::env::var("S3_KEY_PREFIX").ok();

        let any_set = [&endpoint, &region, &bucket, &access_key_id, &secret_access_key]
            .iter()
            .any(|v| v.is_some());
        if !any_set {
            return Ok(None);
        }

        match (endpoint, region, bucket, access_key_id, secret_access_key) {
            (Some(endpoint), Some(region), Some(bucket), Some(access_key_id), Some(secret)) => {
                Ok(Some(S3Config {
                    endpoint,
                    region,
                    bucket,
                    access_key_id,
                    secret_access_key: secret,
                    key_prefix,
                }))
            }
            _ => Err(ConfigError::ValidationError(
                "S3 configuration is incomplete: S3_ENDPOINT, S3_REGION, S3_BUCKET, \
                 S3_ACCESS_KEY_ID, and S3_SECRET_ACCESS_KEY are all required"
                    .to_string(),
            )),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.permanent_backend == StorageKind::ObjectStore && self.storage.s3.is_none() {
            return Err(ConfigError::ValidationError(
                "S3 configuration is required when PERMANENT_BACKEND=objectstore".to_string(),
            ));
        }

        if self.storage.permanent_backend == StorageKind::Filesystem {
            tracing::warn!(
                "PERMANENT_BACKEND=filesystem keeps accepted uploads on the landing backend"
            );
        }

        Ok(())
    }
}
