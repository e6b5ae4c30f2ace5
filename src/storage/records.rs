use std::collections::HashMap;

use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{AttachmentStatus, FileRecord, StorageKind, VersionEntry};
use super::tables::*;

impl Database {
    // ========================================================================
    // Attachment record operations
    // ========================================================================

    /// Store an attachment record and update the parent index
    pub fn put_record(&self, record: &FileRecord) -> Result<(), DatabaseError> {
        debug_assert!(!record.id.is_empty(), "record id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(ATTACHMENTS)?;
            let data = rmp_serde::to_vec_named(record)?;
            table.insert(record.id.as_str(), data.as_slice())?;

            // Maintain parent index
            if let Some(ref parent_id) = record.parent_id {
                let mut parent_table = write_txn.open_table(PARENT_ATTACHMENTS)?;
                let mut ids: Vec<String> = parent_table
                    .get(parent_id.as_str())?
                    .map(|v| rmp_serde::from_slice(v.value()).unwrap_or_default())
                    .unwrap_or_default();

                if !ids.contains(&record.id) {
                    ids.push(record.id.clone());
                    let index_data = rmp_serde::to_vec_named(&ids)?;
                    parent_table.insert(parent_id.as_str(), index_data.as_slice())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get an attachment by its UUID
    pub fn get_record(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ATTACHMENTS)?;

        match table.get(id)? {
            Some(data) => {
                let record: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Get all attachments owned by a parent entity
    pub fn get_records_by_parent(&self, parent_id: &str) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let parent_table = read_txn.open_table(PARENT_ATTACHMENTS)?;
        let records_table = read_txn.open_table(ATTACHMENTS)?;

        let ids: Vec<String> = match parent_table.get(parent_id)? {
            Some(data) => rmp_serde::from_slice(data.value())?,
            None => return Ok(Vec::new()),
        };

        let mut records = Vec::new();
        for id in ids {
            if let Some(data) = records_table.get(id.as_str())? {
                let record: FileRecord = rmp_serde::from_slice(data.value())?;
                records.push(record);
            }
        }

        Ok(records)
    }

    /// Delete an attachment record and clean up the parent index.
    /// Byte cleanup at the backends is the lifecycle's job, not ours.
    pub fn delete_record(&self, id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let parent_id: Option<Option<String>> = {
            let table = write_txn.open_table(ATTACHMENTS)?;
            let parent_id = match table.get(id)? {
                Some(data) => {
                    let record: FileRecord = rmp_serde::from_slice(data.value())?;
                    Some(record.parent_id)
                }
                None => None,
            };
            parent_id
        };

        let deleted = match parent_id {
            Some(parent_id) => {
                {
                    let mut table = write_txn.open_table(ATTACHMENTS)?;
                    table.remove(id)?;
                }
                if let Some(ref parent_id) = parent_id {
                    let ids: Option<Vec<String>> = {
                        let parent_table = write_txn.open_table(PARENT_ATTACHMENTS)?;
                        let ids = match parent_table.get(parent_id.as_str())? {
                            Some(data) => Some(rmp_serde::from_slice(data.value())?),
                            None => None,
                        };
                        ids
                    };

                    if let Some(mut ids) = ids {
                        ids.retain(|aid| aid != id);
                        let mut parent_table = write_txn.open_table(PARENT_ATTACHMENTS)?;
                        if ids.is_empty() {
                            parent_table.remove(parent_id.as_str())?;
                        } else {
                            let new_data = rmp_serde::to_vec_named(&ids)?;
                            parent_table.insert(parent_id.as_str(), new_data.as_slice())?;
                        }
                    }
                }
                true
            }
            None => false,
        };

        write_txn.commit()?;
        Ok(deleted)
    }

    /// Get all attachment records
    pub fn get_all_records(&self) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(ATTACHMENTS)?;

        let mut records = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let record: FileRecord = rmp_serde::from_slice(value.value())?;
            records.push(record);
        }

        Ok(records)
    }

    /// List attachments with optional file_type and parent_id filters
    pub fn list_records(
        &self,
        file_type: Option<&str>,
        parent_id: Option<&str>,
    ) -> Result<Vec<FileRecord>, DatabaseError> {
        // Use the parent index when parent_id is provided
        let all = match parent_id {
            Some(pid) => self.get_records_by_parent(pid)?,
            None => self.get_all_records()?,
        };

        if let Some(ft) = file_type {
            Ok(all
                .into_iter()
                .filter(|r| {
                    let type_str = serde_json::to_string(&r.file_type)
                        .unwrap_or_default()
                        .trim_matches('"')
                        .to_string();
                    type_str == ft
                })
                .collect())
        } else {
            Ok(all)
        }
    }

    // ========================================================================
    // Single-document atomic updates
    //
    // Storage tags and location tokens are flipped compare-and-set inside one
    // write transaction, so a racing migration and rename can never produce a
    // lost update.
    // ========================================================================

    /// Commit a version move: flip `storage` and `location` for one version,
    /// but only if the entry still matches what the caller copied from.
    /// Returns false (without writing) when the record or version is gone or
    /// the entry no longer matches.
    pub fn commit_version_move(
        &self,
        id: &str,
        version: &str,
        expected_storage: StorageKind,
        expected_location: &str,
        new_storage: StorageKind,
        new_location: &str,
    ) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let committed = {
            let mut table = write_txn.open_table(ATTACHMENTS)?;
            let existing: Option<FileRecord> = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match existing {
                Some(mut record) => match record.versions.get_mut(version) {
                    Some(entry)
                        if entry.storage == expected_storage
                            && entry.location == expected_location =>
                    {
                        entry.storage = new_storage;
                        entry.location = new_location.to_string();
                        record.updated_at = chrono::Utc::now();

                        let serialized = rmp_serde::to_vec_named(&record)?;
                        table.insert(id, serialized.as_slice())?;
                        true
                    }
                    _ => false,
                },
                None => false,
            }
        };

        write_txn.commit()?;
        Ok(committed)
    }

    /// Update the lifecycle status of a record. Returns false when the
    /// record no longer exists (e.g. removed by a concurrent rejection).
    pub fn set_status(&self, id: &str, status: AttachmentStatus) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let updated = {
            let mut table = write_txn.open_table(ATTACHMENTS)?;
            let existing: Option<FileRecord> = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match existing {
                Some(mut record) => {
                    record.status = status;
                    record.updated_at = chrono::Utc::now();
                    let serialized = rmp_serde::to_vec_named(&record)?;
                    table.insert(id, serialized.as_slice())?;
                    true
                }
                None => false,
            }
        };

        write_txn.commit()?;
        Ok(updated)
    }

    /// Commit a rename: new display name, re-derived extension, and any
    /// location tokens the backends reissued. Storage tags are untouched.
    pub fn commit_rename(
        &self,
        id: &str,
        new_name: &str,
        new_locations: &HashMap<String, String>,
    ) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let updated = {
            let mut table = write_txn.open_table(ATTACHMENTS)?;
            let existing: Option<FileRecord> = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match existing {
                Some(mut record) => {
                    record.name = new_name.to_string();
                    record.extension = super::models::extension_of(new_name);
                    for (version, location) in new_locations {
                        if let Some(entry) = record.versions.get_mut(version) {
                            entry.location = location.clone();
                        }
                    }
                    record.updated_at = chrono::Utc::now();
                    let serialized = rmp_serde::to_vec_named(&record)?;
                    table.insert(id, serialized.as_slice())?;
                    true
                }
                None => false,
            }
        };

        write_txn.commit()?;
        Ok(updated)
    }

    /// Insert or replace one version entry. Used when a lazily generated
    /// derivative stamps its own backend tag.
    pub fn upsert_version(
        &self,
        id: &str,
        version: &str,
        entry: VersionEntry,
    ) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let updated = {
            let mut table = write_txn.open_table(ATTACHMENTS)?;
            let existing: Option<FileRecord> = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };

            match existing {
                Some(mut record) => {
                    record.versions.insert(version.to_string(), entry);
                    record.updated_at = chrono::Utc::now();
                    let serialized = rmp_serde::to_vec_named(&record)?;
                    table.insert(id, serialized.as_slice())?;
                    true
                }
                None => false,
            }
        };

        write_txn.commit()?;
        Ok(updated)
    }
}
