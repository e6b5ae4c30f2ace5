use std::collections::HashMap;

use attachment_store::storage::models::{
    AttachmentStatus, FileRecord, FileType, StorageKind, VersionEntry, ORIGINAL_VERSION,
};
use attachment_store::storage::Database;
use chrono::Utc;

fn test_db() -> (tempfile::TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("data")).unwrap();
    (dir, db)
}

fn sample_record(id: &str) -> FileRecord {
    let now = Utc::now();
    let mut versions = HashMap::new();
    versions.insert(
        ORIGINAL_VERSION.to_string(),
        VersionEntry {
            storage: StorageKind::Filesystem,
            location: format!("/tmp/attachments/{id}.original"),
            size: 1024,
            content_type: "image/png".to_string(),
        },
    );
    FileRecord {
        id: id.to_string(),
        name: "photo.png".to_string(),
        extension: Some("png".to_string()),
        file_type: FileType::Image,
        status: AttachmentStatus::Landed,
        created_at: now,
        updated_at: now,
        parent_id: None,
        copy_storage: None,
        meta: None,
        versions,
    }
}

fn sample_record_with_parent(id: &str, parent_id: &str) -> FileRecord {
    let mut record = sample_record(id);
    record.parent_id = Some(parent_id.to_string());
    record
}

#[test]
fn test_put_and_get_record() {
    let (_dir, db) = test_db();
    let record = sample_record("att-1");

    db.put_record(&record).unwrap();

    let retrieved = db.get_record("att-1").unwrap().expect("record should exist");
    assert_eq!(retrieved.id, "att-1");
    assert_eq!(retrieved.name, "photo.png");
    assert_eq!(retrieved.extension, Some("png".to_string()));
    assert_eq!(retrieved.file_type, FileType::Image);
    assert_eq!(retrieved.status, AttachmentStatus::Landed);

    let entry = retrieved.versions.get(ORIGINAL_VERSION).unwrap();
    assert_eq!(entry.storage, StorageKind::Filesystem);
    assert_eq!(entry.size, 1024);
    assert_eq!(entry.content_type, "image/png");
}

#[test]
fn test_get_record_not_found() {
    let (_dir, db) = test_db();
    assert!(db.get_record("nonexistent").unwrap().is_none());
}

#[test]
fn test_delete_record() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record("att-2")).unwrap();

    assert!(db.delete_record("att-2").unwrap());
    assert!(db.get_record("att-2").unwrap().is_none());
}

#[test]
fn test_delete_record_not_found() {
    let (_dir, db) = test_db();
    assert!(!db.delete_record("nonexistent").unwrap());
}

#[test]
fn test_list_records_with_type_filter() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record("img")).unwrap();

    let mut doc = sample_record("doc");
    doc.name = "report.pdf".to_string();
    doc.file_type = FileType::Document;
    db.put_record(&doc).unwrap();

    let images = db.list_records(Some("image"), None).unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].id, "img");

    let documents = db.list_records(Some("document"), None).unwrap();
    assert_eq!(documents.len(), 1);
    assert_eq!(documents[0].id, "doc");

    let all = db.list_records(None, None).unwrap();
    assert_eq!(all.len(), 2);
}

// ============================================================================
// parent index
// ============================================================================

#[test]
fn test_get_records_by_parent() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record_with_parent("p-a", "card-1")).unwrap();
    db.put_record(&sample_record_with_parent("p-b", "card-1")).unwrap();
    db.put_record(&sample_record_with_parent("p-c", "card-2")).unwrap();
    db.put_record(&sample_record("orphan")).unwrap();

    let card1 = db.get_records_by_parent("card-1").unwrap();
    assert_eq!(card1.len(), 2);

    let card2 = db.get_records_by_parent("card-2").unwrap();
    assert_eq!(card2.len(), 1);
    assert_eq!(card2[0].id, "p-c");

    assert!(db.get_records_by_parent("nonexistent").unwrap().is_empty());
}

#[test]
fn test_list_records_by_parent() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record_with_parent("l-a", "card-9")).unwrap();
    db.put_record(&sample_record("l-b")).unwrap();

    let for_card = db.list_records(None, Some("card-9")).unwrap();
    assert_eq!(for_card.len(), 1);
    assert_eq!(for_card[0].id, "l-a");
}

#[test]
fn test_delete_record_cleans_parent_index() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record_with_parent("del", "card-x")).unwrap();
    db.put_record(&sample_record_with_parent("keep", "card-x")).unwrap();

    db.delete_record("del").unwrap();

    let remaining = db.get_records_by_parent("card-x").unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "keep");
}

#[test]
fn test_delete_last_record_removes_parent_entry() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record_with_parent("only", "card-solo")).unwrap();

    db.delete_record("only").unwrap();

    assert!(db.get_records_by_parent("card-solo").unwrap().is_empty());
}

// ============================================================================
// compare-and-set updates
// ============================================================================

#[test]
fn test_commit_version_move_flips_tag_and_location() {
    let (_dir, db) = test_db();
    let record = sample_record("mv-1");
    let old_location = record.versions[ORIGINAL_VERSION].location.clone();
    db.put_record(&record).unwrap();

    let committed = db
        .commit_version_move(
            "mv-1",
            ORIGINAL_VERSION,
            StorageKind::Filesystem,
            &old_location,
            StorageKind::BlobStore,
            "blob-123",
        )
        .unwrap();
    assert!(committed);

    let updated = db.get_record("mv-1").unwrap().unwrap();
    let entry = updated.versions.get(ORIGINAL_VERSION).unwrap();
    assert_eq!(entry.storage, StorageKind::BlobStore);
    assert_eq!(entry.location, "blob-123");
    // Size and content type ride along unchanged
    assert_eq!(entry.size, 1024);
    assert_eq!(entry.content_type, "image/png");
}

#[test]
fn test_commit_version_move_rejects_stale_expectation() {
    let (_dir, db) = test_db();
    let record = sample_record("mv-2");
    db.put_record(&record).unwrap();

    // Wrong expected location: the caller's view is stale
    let committed = db
        .commit_version_move(
            "mv-2",
            ORIGINAL_VERSION,
            StorageKind::Filesystem,
            "/somewhere/else",
            StorageKind::BlobStore,
            "blob-456",
        )
        .unwrap();
    assert!(!committed);

    // Nothing changed
    let unchanged = db.get_record("mv-2").unwrap().unwrap();
    let entry = unchanged.versions.get(ORIGINAL_VERSION).unwrap();
    assert_eq!(entry.storage, StorageKind::Filesystem);
}

#[test]
fn test_commit_version_move_unknown_version_or_record() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record("mv-3")).unwrap();

    assert!(!db
        .commit_version_move(
            "mv-3",
            "thumbnail",
            StorageKind::Filesystem,
            "x",
            StorageKind::BlobStore,
            "y",
        )
        .unwrap());

    assert!(!db
        .commit_version_move(
            "ghost",
            ORIGINAL_VERSION,
            StorageKind::Filesystem,
            "x",
            StorageKind::BlobStore,
            "y",
        )
        .unwrap());
}

#[test]
fn test_set_status() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record("st-1")).unwrap();

    assert!(db.set_status("st-1", AttachmentStatus::Stored).unwrap());
    let record = db.get_record("st-1").unwrap().unwrap();
    assert_eq!(record.status, AttachmentStatus::Stored);

    assert!(!db.set_status("ghost", AttachmentStatus::Stored).unwrap());
}

#[test]
fn test_commit_rename_updates_name_extension_and_locations() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record("rn-1")).unwrap();

    let mut locations = HashMap::new();
    locations.insert(ORIGINAL_VERSION.to_string(), "new-token".to_string());

    assert!(db.commit_rename("rn-1", "Quarterly Report.PDF", &locations).unwrap());

    let record = db.get_record("rn-1").unwrap().unwrap();
    assert_eq!(record.name, "Quarterly Report.PDF");
    assert_eq!(record.extension, Some("pdf".to_string()));
    assert_eq!(
        record.versions[ORIGINAL_VERSION].location,
        "new-token".to_string()
    );
    // Tag untouched by a rename
    assert_eq!(
        record.versions[ORIGINAL_VERSION].storage,
        StorageKind::Filesystem
    );
}

#[test]
fn test_upsert_version_adds_derivative() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record("uv-1")).unwrap();

    let added = db
        .upsert_version(
            "uv-1",
            "thumbnail",
            VersionEntry {
                storage: StorageKind::Filesystem,
                location: "/tmp/attachments/uv-1.thumbnail".to_string(),
                size: 64,
                content_type: "image/png".to_string(),
            },
        )
        .unwrap();
    assert!(added);

    let record = db.get_record("uv-1").unwrap().unwrap();
    assert_eq!(record.versions.len(), 2);
    assert_eq!(record.versions["thumbnail"].size, 64);
    assert_eq!(record.total_size(), 1024 + 64);

    assert!(!db
        .upsert_version(
            "ghost",
            "thumbnail",
            VersionEntry {
                storage: StorageKind::Filesystem,
                location: "x".to_string(),
                size: 1,
                content_type: "image/png".to_string(),
            },
        )
        .unwrap());
}

#[test]
fn test_purge_all() {
    let (_dir, db) = test_db();
    db.put_record(&sample_record("p1")).unwrap();
    db.put_record(&sample_record_with_parent("p2", "card-1")).unwrap();

    let stats = db.purge_all().unwrap();
    assert_eq!(stats.attachments, 2);

    assert!(db.get_all_records().unwrap().is_empty());
    assert!(db.get_records_by_parent("card-1").unwrap().is_empty());
}
