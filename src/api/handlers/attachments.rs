use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::Json;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::api::response::{ApiError, AppJson, AppQuery, JSend, JSendPaginated, Pagination};
use crate::lifecycle::{NewAttachment, ProcessOutcome};
use crate::storage::models::{AttachmentStatus, FileRecord, FileType, StorageKind};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub storage: StorageKind,
    pub size: u64,
    pub content_type: String,
}

#[derive(Debug, Serialize)]
pub struct AttachmentResponse {
    pub id: String,
    pub name: String,
    pub extension: Option<String>,
    pub file_type: FileType,
    pub status: AttachmentStatus,
    pub byte_size: u64,
    pub content_type: Option<String>,
    pub parent_id: Option<String>,
    pub copy_storage: Option<StorageKind>,
    pub meta: Option<HashMap<String, serde_json::Value>>,
    /// Location tokens are backend-internal and never exposed.
    pub versions: HashMap<String, VersionResponse>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct ListAttachmentsParams {
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
}

fn default_limit() -> u32 {
    20
}

#[derive(Debug, Deserialize)]
pub struct MoveAttachmentRequest {
    pub backend: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameAttachmentRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct RevalidateResponse {
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_attachment(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<JSend<AttachmentResponse>>, ApiError> {
    let mut file_data: Option<BytesMut> = None;
    let mut file_name: Option<String> = None;
    let mut file_content_type: Option<String> = None;
    let mut name: Option<String> = None;
    let mut parent_id: Option<String> = None;
    let mut copy_storage: Option<StorageKind> = None;
    let mut meta: Option<HashMap<String, serde_json::Value>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart data: {e}")))?
    {
        let field_name = field.name().unwrap_or("").to_string();

        match field_name.as_str() {
            "file" => {
                file_name = field.file_name().map(|s| s.to_string());
                file_content_type = field.content_type().map(|s| s.to_string());

                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Failed to read file: {e}")))?;

                if data.len() as u64 > state.config.max_upload_size {
                    return Err(ApiError::payload_too_large(format!(
                        "File exceeds maximum upload size of {} bytes",
                        state.config.max_upload_size
                    )));
                }

                let mut buf = BytesMut::with_capacity(data.len());
                buf.extend_from_slice(&data);
                file_data = Some(buf);
            }
            "name" => {
                name = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("Invalid name: {e}")))?,
                );
            }
            "parent_id" => {
                parent_id = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| ApiError::bad_request(format!("Invalid parent_id: {e}")))?,
                );
            }
            "copy_storage" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid copy_storage: {e}")))?;
                copy_storage = Some(
                    text.parse::<StorageKind>()
                        .map_err(ApiError::bad_request)?,
                );
            }
            "meta" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("Invalid meta: {e}")))?;
                let parsed: HashMap<String, serde_json::Value> = serde_json::from_str(&text)
                    .map_err(|e| ApiError::bad_request(format!("meta must be a JSON object: {e}")))?;
                meta = Some(parsed);
            }
            _ => {
                // Ignore unknown fields
            }
        }
    }

    let file_data = file_data.ok_or_else(|| ApiError::bad_request("file field is required"))?;
    let original_name = name
        .or(file_name)
        .ok_or_else(|| ApiError::bad_request("a filename is required (file or name field)"))?;

    // Phase 1: synchronous landing write -- its failure fails the upload.
    let record = state
        .lifecycle
        .store_new(
            file_data.freeze(),
            NewAttachment {
                original_name,
                declared_mime: file_content_type,
                parent_id,
                copy_storage,
                meta,
            },
        )
        .await?;

    // Phase 2: deferred validation and migration; this request does not
    // wait for either.
    state.lifecycle.schedule_processing(record.id.clone());

    tracing::debug!(attachment_id = %record.id, "attachment created");
    Ok(JSend::success(to_response(&record)))
}

pub async fn get_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<AttachmentResponse>>, ApiError> {
    let record = state.lifecycle.record(&id)?;
    Ok(JSend::success(to_response(&record)))
}

pub async fn delete_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<()>>, ApiError> {
    state.lifecycle.remove(&id).await?;
    tracing::debug!(attachment_id = %id, "attachment deleted");
    Ok(JSend::success(()))
}

pub async fn list_attachments(
    State(state): State<Arc<AppState>>,
    AppQuery(params): AppQuery<ListAttachmentsParams>,
) -> Result<Json<JSendPaginated<AttachmentResponse>>, ApiError> {
    if params.limit == 0 {
        return Err(ApiError::bad_request("limit must be greater than 0"));
    }

    let records = state
        .db
        .list_records(params.file_type.as_deref(), params.parent_id.as_deref())
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let total = records.len() as u64;
    let items: Vec<AttachmentResponse> = records
        .iter()
        .skip(params.offset as usize)
        .take(params.limit as usize)
        .map(to_response)
        .collect();

    Ok(JSendPaginated::success(
        items,
        Pagination {
            limit: params.limit,
            offset: params.offset,
            total,
        },
    ))
}

/// Move an attachment's bytes to another backend. Safe to re-invoke; the
/// migration converges on the requested backend.
pub async fn move_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppJson(req): AppJson<MoveAttachmentRequest>,
) -> Result<Json<JSend<AttachmentResponse>>, ApiError> {
    let target = req
        .backend
        .parse::<StorageKind>()
        .map_err(ApiError::bad_request)?;

    state.lifecycle.move_to_backend(&id, target).await?;

    let record = state.lifecycle.record(&id)?;
    tracing::debug!(attachment_id = %id, backend = %target, "attachment moved");
    Ok(JSend::success(to_response(&record)))
}

pub async fn rename_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppJson(req): AppJson<RenameAttachmentRequest>,
) -> Result<Json<JSend<AttachmentResponse>>, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::bad_request("name must not be empty"));
    }

    let record = state.lifecycle.rename(&id, &req.name).await?;
    tracing::debug!(attachment_id = %id, "attachment renamed");
    Ok(JSend::success(to_response(&record)))
}

pub async fn revalidate_attachment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<RevalidateResponse>>, ApiError> {
    let response = match state.lifecycle.revalidate(&id).await? {
        ProcessOutcome::Stored(_) => RevalidateResponse {
            outcome: "valid".to_string(),
            reason: None,
        },
        ProcessOutcome::Rejected(reason) => RevalidateResponse {
            outcome: "rejected".to_string(),
            reason: Some(reason),
        },
    };
    Ok(JSend::success(response))
}

// ============================================================================
// Helpers
// ============================================================================

fn to_response(record: &FileRecord) -> AttachmentResponse {
    AttachmentResponse {
        id: record.id.clone(),
        name: record.name.clone(),
        extension: record.extension.clone(),
        file_type: record.file_type,
        status: record.status,
        byte_size: record.total_size(),
        content_type: record.content_type().map(|s| s.to_string()),
        parent_id: record.parent_id.clone(),
        copy_storage: record.copy_storage,
        meta: record.meta.clone(),
        versions: record
            .versions
            .iter()
            .map(|(name, entry)| {
                (
                    name.clone(),
                    VersionResponse {
                        storage: entry.storage,
                        size: entry.size,
                        content_type: entry.content_type.clone(),
                    },
                )
            })
            .collect(),
        created_at: record.created_at.to_rfc3339(),
        updated_at: record.updated_at.to_rfc3339(),
    }
}
