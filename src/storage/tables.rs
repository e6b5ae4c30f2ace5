use redb::TableDefinition;

/// Attachment records: uuid -> FileRecord (msgpack)
pub const ATTACHMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("attachments");

/// Parent index: parent entity id -> msgpack Vec of attachment UUIDs
pub const PARENT_ATTACHMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("parent_attachments");

/// Blob store metadata: blob id -> BlobMeta (msgpack)
pub const BLOB_META: TableDefinition<&str, &[u8]> = TableDefinition::new("blob_meta");

/// Blob store chunks: (blob id, chunk index) -> raw chunk bytes
pub const BLOB_CHUNKS: TableDefinition<(&str, u32), &[u8]> = TableDefinition::new("blob_chunks");
