use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Name of the version every upload lands as. Derivative versions
/// (thumbnails etc.) are added later under their own names.
pub const ORIGINAL_VERSION: &str = "original";

/// The storage backends a version's bytes can live in. Adding a backend
/// means adding a variant here and one `StorageBackend` impl, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Filesystem,
    BlobStore,
    ObjectStore,
}

impl StorageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Filesystem => "filesystem",
            StorageKind::BlobStore => "blobstore",
            StorageKind::ObjectStore => "objectstore",
        }
    }
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "filesystem" | "fs" => Ok(StorageKind::Filesystem),
            "blobstore" | "blob" => Ok(StorageKind::BlobStore),
            "objectstore" | "s3" => Ok(StorageKind::ObjectStore),
            other => Err(format!("unknown storage backend '{other}'")),
        }
    }
}

/// Lifecycle state persisted on the record. Rejection is terminal and
/// manifests as deletion of the record, so it has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentStatus {
    /// Bytes durably written to the landing backend, validation not yet run.
    Landed,
    Validating,
    Migrating,
    /// At rest on its permanent backend until an explicit move re-enters
    /// `Migrating`.
    Stored,
}

/// Classification of an attachment derived from its MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Audio,
    Binary,
    Document,
    Image,
    Video,
}

impl FileType {
    /// Derive a file type classification from a MIME type string.
    pub fn from_mime(mime_type: &str) -> Self {
        let primary = mime_type.split('/').next().unwrap_or("");
        match primary {
            "audio" => FileType::Audio,
            "image" => FileType::Image,
            "video" => FileType::Video,
            "text" | "application" => {
                let sub = mime_type.split('/').nth(1).unwrap_or("");
                match sub {
                    "pdf"
                    | "msword"
                    | "rtf"
                    | "csv"
                    | "vnd.openxmlformats-officedocument.wordprocessingml.document"
                    | "vnd.openxmlformats-officedocument.spreadsheetml.sheet"
                    | "vnd.openxmlformats-officedocument.presentationml.presentation"
                    | "vnd.ms-excel"
                    | "vnd.ms-powerpoint" => FileType::Document,
                    _ if primary == "text" => FileType::Document,
                    _ => FileType::Binary,
                }
            }
            _ => FileType::Binary,
        }
    }
}

/// One physical rendition of an attachment. The `storage` tag is the
/// authoritative pointer: the bytes exist in exactly that backend, at the
/// location the token names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub storage: StorageKind,
    /// Backend-specific location token: a path, a blob id, or an object key.
    pub location: String,
    pub size: u64,
    pub content_type: String,
}

/// An attachment record stored in redb. Owns its version set exclusively;
/// nothing else holds a reference to raw bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    /// Human-readable filename. Display metadata only -- never used as an
    /// on-disk name.
    pub name: String,
    /// Lowercased extension derived from `name`, for content-type
    /// negotiation only.
    pub extension: Option<String>,
    pub file_type: FileType,
    pub status: AttachmentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Owning-entity reference (indexed for listing).
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Desired permanent backend. Falls back to the blob store when unset.
    #[serde(default)]
    pub copy_storage: Option<StorageKind>,
    #[serde(default)]
    pub meta: Option<HashMap<String, serde_json::Value>>,

    /// Version name ("original", "thumbnail", ...) -> physical entry.
    pub versions: HashMap<String, VersionEntry>,
}

impl FileRecord {
    /// Total byte size across versions, for listings.
    pub fn total_size(&self) -> u64 {
        self.versions.values().map(|v| v.size).sum()
    }

    /// Content type of the original version, when present.
    pub fn content_type(&self) -> Option<&str> {
        self.versions
            .get(ORIGINAL_VERSION)
            .map(|v| v.content_type.as_str())
    }
}

/// Lowercased extension from a filename, `None` when there is none.
pub fn extension_of(name: &str) -> Option<String> {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_kind_round_trips_through_str() {
        for kind in [
            StorageKind::Filesystem,
            StorageKind::BlobStore,
            StorageKind::ObjectStore,
        ] {
            assert_eq!(kind.as_str().parse::<StorageKind>().unwrap(), kind);
        }
        assert!("tape".parse::<StorageKind>().is_err());
    }

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(extension_of("Report.PDF"), Some("pdf".to_string()));
        assert_eq!(extension_of("archive.tar.gz"), Some("gz".to_string()));
        assert_eq!(extension_of("README"), None);
    }
}
