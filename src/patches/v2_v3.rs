//! Version 2 -> 3: backfill missing related-item guids, and make sure every
//! resource body has a version id row (spec.md §4.2, grounded on
//! `Patch2To3.cpp`).
//!
//! The second half has three sub-phases, run in order: (B1) confirm the
//! version-id tables `schema.sql` already declares actually exist, (B2)
//! relocate any resource body file still sitting at the flat v2 path
//! (`<noteLocalId>/<resourceLocalId>.dat`) into the versioned layout,
//! committing a version id for each, and (B3) adopt any file that already
//! lives in a versioned directory but predates a version-id row (a
//! directly-restored legacy data folder). `Patch1To2` in this crate already
//! writes new bodies straight into the versioned layout (see its module
//! doc), so B2/B3 only do work for resources that predate both patches.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Connection;

use crate::backup::{backup_database_files, backup_dir_name, remove_backup, restore_database_files_from_backup};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::resource_body::ResourceBodyStore;
use crate::settings::SqliteKeyValueStore;
use crate::version::{set_version, CancelToken, Patch, ProgressSender};
use crate::writer::Writer;

const SETTINGS_NAMESPACE: &str = "Patch2To3";
const NOTES_NOTEBOOK_GUIDS_FIXED_UP_KEY: &str = "NotesTableNotebookGuidsFixedUp";
const TAGS_PARENT_GUIDS_FIXED_UP_KEY: &str = "TagsTableParentGuidsFixedUp";
// Verbatim legacy key name: it gates the Resources.noteGuid backfill, not a
// tag-guid fixup. Kept as-is for on-disk compatibility with prior builds.
const RESOURCES_NOTE_GUIDS_FIXED_UP_KEY: &str = "ResourcesTableTagGuidsFixedUp";

const VERSION_ID_TABLES_CREATED_KEY: &str = "ResourceBodyVersionIdTablesCreated";
const VERSION_IDS_COMMITTED_KEY: &str = "ResourceBodyVersionIdsCommittedToDatabase";
const FILES_MOVED_KEY: &str = "ResourceBodyFilesMovedToVersionIdFolders";

pub struct Patch2To3 {
    // See the matching note on `Patch1To2`.
    _pool: Arc<ConnectionPool>,
    writer: Writer,
    config: EngineConfig,
    backup_dir: PathBuf,
}

impl Patch2To3 {
    pub fn new(pool: Arc<ConnectionPool>, writer: Writer, config: EngineConfig) -> Self {
        let backup_dir = config.storage_root.join(backup_dir_name(2, 3));
        Self {
            _pool: pool,
            writer,
            config,
            backup_dir,
        }
    }

    fn database_file_name(&self) -> String {
        self.config
            .database_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "qn.storage.sqlite".to_string())
    }

    async fn fix_missing_guid_fields(&self, progress: &ProgressSender) -> Result<()> {
        let notes_fixed_up = self
            .writer
            .submit(|conn| {
                SqliteKeyValueStore::get_bool(conn, SETTINGS_NAMESPACE, NOTES_NOTEBOOK_GUIDS_FIXED_UP_KEY)
            })
            .await?
            .unwrap_or(false);

        if !notes_fixed_up {
            self.writer
                .submit(|conn| {
                    conn.execute_batch(
                        "UPDATE Notes SET notebookGuid = (
                             SELECT guid FROM Notebooks WHERE Notebooks.localId = Notes.notebookLocalId
                         )
                         WHERE notebookGuid IS NULL;",
                    )?;
                    SqliteKeyValueStore::set_bool(conn, SETTINGS_NAMESPACE, NOTES_NOTEBOOK_GUIDS_FIXED_UP_KEY, true)
                })
                .await?;
        }
        let _ = progress.send(10);

        let tags_fixed_up = self
            .writer
            .submit(|conn| {
                SqliteKeyValueStore::get_bool(conn, SETTINGS_NAMESPACE, TAGS_PARENT_GUIDS_FIXED_UP_KEY)
            })
            .await?
            .unwrap_or(false);

        if !tags_fixed_up {
            self.writer
                .submit(|conn| {
                    conn.execute_batch(
                        "UPDATE Tags SET parentGuid = (
                             SELECT guid FROM Tags AS Parent WHERE Parent.localId = Tags.parentTagLocalId
                         )
                         WHERE parentGuid IS NULL AND parentTagLocalId IS NOT NULL;",
                    )?;
                    SqliteKeyValueStore::set_bool(conn, SETTINGS_NAMESPACE, TAGS_PARENT_GUIDS_FIXED_UP_KEY, true)
                })
                .await?;
        }
        let _ = progress.send(20);

        let resources_fixed_up = self
            .writer
            .submit(|conn| {
                SqliteKeyValueStore::get_bool(conn, SETTINGS_NAMESPACE, RESOURCES_NOTE_GUIDS_FIXED_UP_KEY)
            })
            .await?
            .unwrap_or(false);

        if !resources_fixed_up {
            self.writer
                .submit(|conn| {
                    conn.execute_batch(
                        "UPDATE Resources SET noteGuid = (
                             SELECT guid FROM Notes WHERE Notes.localId = Resources.noteLocalId
                         )
                         WHERE noteGuid IS NULL;",
                    )?;
                    SqliteKeyValueStore::set_bool(conn, SETTINGS_NAMESPACE, RESOURCES_NOTE_GUIDS_FIXED_UP_KEY, true)
                })
                .await?;
        }
        let _ = progress.send(40);

        Ok(())
    }

    async fn ensure_resource_body_version_ids(&self, progress: &ProgressSender) -> Result<()> {
        let tables_created = self
            .writer
            .submit(|conn| SqliteKeyValueStore::get_bool(conn, SETTINGS_NAMESPACE, VERSION_ID_TABLES_CREATED_KEY))
            .await?
            .unwrap_or(false);

        if !tables_created {
            self.writer
                .submit(|conn| {
                    for table in ["ResourceDataBodyVersionIds", "ResourceAlternateDataBodyVersionIds"] {
                        if !table_exists(conn, table)? {
                            return Err(crate::error::StorageError::MigrationFailure(format!(
                                "expected table {table} to already exist from schema.sql"
                            )));
                        }
                    }
                    SqliteKeyValueStore::set_bool(conn, SETTINGS_NAMESPACE, VERSION_ID_TABLES_CREATED_KEY, true)
                })
                .await?;
        }
        let _ = progress.send(55);

        let files_moved = self
            .writer
            .submit(|conn| SqliteKeyValueStore::get_bool(conn, SETTINGS_NAMESPACE, FILES_MOVED_KEY))
            .await?
            .unwrap_or(false);

        if !files_moved {
            let config = self.config.clone();
            let relocated = self
                .writer
                .submit(move |conn| {
                    let resource_body = ResourceBodyStore::new(&config);
                    let relocated = resource_body.relocate_flat_files(conn)?;
                    SqliteKeyValueStore::set_bool(conn, SETTINGS_NAMESPACE, FILES_MOVED_KEY, true)?;
                    Ok(relocated)
                })
                .await?;
            tracing::info!(
                target: "quill_storage::patches::v2_v3",
                count = relocated,
                "relocated flat v2 resource body files into version-id directories"
            );
        }
        let _ = progress.send(70);

        let ids_committed = self
            .writer
            .submit(|conn| SqliteKeyValueStore::get_bool(conn, SETTINGS_NAMESPACE, VERSION_IDS_COMMITTED_KEY))
            .await?
            .unwrap_or(false);

        if !ids_committed {
            let config = self.config.clone();
            let orphans = self
                .writer
                .submit(move |conn| {
                    let resource_body = ResourceBodyStore::new(&config);
                    let adopted = resource_body.adopt_unversioned_files(conn)?;
                    SqliteKeyValueStore::set_bool(conn, SETTINGS_NAMESPACE, VERSION_IDS_COMMITTED_KEY, true)?;
                    Ok(adopted)
                })
                .await?;
            tracing::info!(
                target: "quill_storage::patches::v2_v3",
                count = orphans,
                "adopted legacy resource body files without a version id row"
            );
        }
        let _ = progress.send(80);

        Ok(())
    }
}

fn table_exists(connection: &Connection, table: &str) -> Result<bool> {
    let exists: Option<String> = connection
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .ok();
    Ok(exists.is_some())
}

#[async_trait]
impl Patch for Patch2To3 {
    fn from_version(&self) -> i32 {
        2
    }

    fn to_version(&self) -> i32 {
        3
    }

    fn short_description(&self) -> String {
        "Backfill related-item guids and finalize resource body versioning".to_string()
    }

    fn long_description(&self) -> String {
        "Fills in notebook, tag-parent and note guid fields that earlier \
         builds could leave unset, and ensures every resource body file is \
         tracked by a version id row so resource writes are fully \
         transactional."
            .to_string()
    }

    async fn backup_local_storage(
        &self,
        progress: ProgressSender,
        _cancel: CancelToken,
    ) -> Result<()> {
        let storage_root = self.config.storage_root.clone();
        let database_file_name = self.database_file_name();
        let backup_dir = self.backup_dir.clone();

        tokio::task::spawn_blocking(move || {
            backup_database_files(&storage_root, &database_file_name, &backup_dir)
        })
        .await
        .map_err(|e| crate::error::StorageError::Runtime(format!("backup task panicked: {e}")))??;

        let _ = progress.send(100);
        Ok(())
    }

    async fn apply(&self, progress: ProgressSender, cancel: CancelToken) -> Result<()> {
        if cancel.is_canceled() {
            return Err(crate::error::StorageError::Canceled);
        }

        self.fix_missing_guid_fields(&progress).await?;
        self.ensure_resource_body_version_ids(&progress).await?;

        self.writer.submit(|conn| set_version(conn, 3)).await?;
        let _ = progress.send(100);

        Ok(())
    }

    async fn restore_local_storage_from_backup(
        &self,
        progress: ProgressSender,
        _cancel: CancelToken,
    ) -> Result<()> {
        let storage_root = self.config.storage_root.clone();
        let database_file_name = self.database_file_name();
        let backup_dir = self.backup_dir.clone();

        tokio::task::spawn_blocking(move || {
            restore_database_files_from_backup(&storage_root, &database_file_name, &backup_dir)
        })
        .await
        .map_err(|e| crate::error::StorageError::Runtime(format!("restore task panicked: {e}")))??;

        let _ = progress.send(100);
        Ok(())
    }

    async fn remove_local_storage_backup(&self) -> Result<()> {
        let backup_dir = self.backup_dir.clone();
        tokio::task::spawn_blocking(move || remove_backup(&backup_dir))
            .await
            .map_err(|e| crate::error::StorageError::Runtime(format!("cleanup task panicked: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TablesInitializer;
    use tempfile::TempDir;

    fn patch_in(dir: &TempDir) -> Patch2To3 {
        let config = EngineConfig::sqlite_at(dir.path());
        let pool = ConnectionPool::new(&config).unwrap();
        {
            let conn = pool.database().unwrap();
            let conn = conn.lock().unwrap();
            TablesInitializer::init_all(&conn).unwrap();
        }
        let writer = Writer::spawn(Arc::clone(&pool)).unwrap();
        Patch2To3::new(pool, writer, config)
    }

    #[tokio::test]
    async fn apply_backfills_notebook_guid_and_bumps_version() {
        let dir = TempDir::new().unwrap();
        let patch = patch_in(&dir);

        patch
            .writer
            .submit(|conn| {
                conn.execute(
                    "INSERT INTO Notebooks (localId, guid, name, nameLower) \
                     VALUES ('nb1', 'nb1-guid', 'Inbox', 'inbox')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO Notes (localId, notebookLocalId) VALUES ('note1', 'nb1')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let (tx, _rx) = tokio::sync::watch::channel(0u8);
        patch.apply(tx, CancelToken::new()).await.unwrap();

        let notebook_guid: Option<String> = patch
            .writer
            .submit(|conn| {
                Ok(conn.query_row(
                    "SELECT notebookGuid FROM Notes WHERE localId = 'note1'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        assert_eq!(notebook_guid.as_deref(), Some("nb1-guid"));

        let version: i32 = patch
            .writer
            .submit(|conn| Ok(conn.query_row("SELECT version FROM Auxiliary", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(version, 3);
    }

    #[tokio::test]
    async fn apply_relocates_flat_v2_resource_body_file() {
        let dir = TempDir::new().unwrap();
        let patch = patch_in(&dir);

        patch
            .writer
            .submit(|conn| {
                conn.execute(
                    "INSERT INTO Notebooks (localId, guid, name, nameLower) \
                     VALUES ('nb1', 'nb1-guid', 'Inbox', 'inbox')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO Notes (localId, notebookLocalId) VALUES ('note1', 'nb1')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO Resources (localId, noteLocalId) VALUES ('res1', 'note1')",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let flat_dir = patch.config.resources_data_dir().join("note1");
        std::fs::create_dir_all(&flat_dir).unwrap();
        let flat_path = flat_dir.join("res1.dat");
        std::fs::write(&flat_path, b"legacy body").unwrap();

        let (tx, _rx) = tokio::sync::watch::channel(0u8);
        patch.apply(tx, CancelToken::new()).await.unwrap();

        assert!(!flat_path.exists());

        let version_id: String = patch
            .writer
            .submit(|conn| {
                Ok(conn.query_row(
                    "SELECT versionId FROM ResourceDataBodyVersionIds WHERE resourceLocalId = 'res1'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .await
            .unwrap();
        let versioned_path = flat_dir.join("res1").join(format!("{version_id}.dat"));
        assert_eq!(std::fs::read(&versioned_path).unwrap(), b"legacy body");
    }

    #[tokio::test]
    async fn apply_is_idempotent_once_all_flags_are_set() {
        let dir = TempDir::new().unwrap();
        let patch = patch_in(&dir);

        let (tx1, _rx1) = tokio::sync::watch::channel(0u8);
        patch.apply(tx1, CancelToken::new()).await.unwrap();

        let (tx2, _rx2) = tokio::sync::watch::channel(0u8);
        patch.apply(tx2, CancelToken::new()).await.unwrap();

        let version: i32 = patch
            .writer
            .submit(|conn| Ok(conn.query_row("SELECT version FROM Auxiliary", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(version, 3);
    }
}
