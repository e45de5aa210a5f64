//! Version 1 -> 2: move resource data bodies out of SQLite BLOB columns and
//! into the resource body file store (spec.md §4.2, grounded on
//! `Patch1To2.cpp`).
//!
//! This crate has only ever shipped the versioned resource body layout
//! (`resource_body::ResourceBodyStore`), so unlike the original two-step
//! historical change (plain file, then a later patch adds a version-id
//! subfolder), this patch writes resource bodies straight into their final
//! versioned location. See `DESIGN.md` for the full writeup of that
//! decision.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Connection;

use crate::backup::{backup_database_files, backup_dir_name, remove_backup, restore_database_files_from_backup};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::pool::ConnectionPool;
use crate::resource_body::{BodyKind, ResourceBodyStore};
use crate::settings::SqliteKeyValueStore;
use crate::version::{set_version, CancelToken, Patch, ProgressSender};
use crate::writer::Writer;

const SETTINGS_NAMESPACE: &str = "Patch1To2";
const ALL_DATA_COPIED_KEY: &str = "AllResourceDataCopiedFromTableToFiles";
const COPIED_RESOURCE_IDS_KEY: &str = "LocalUidsOfResourcesCopiedToFiles";
const ALL_DATA_REMOVED_KEY: &str = "AllResourceDataRemovedFromResourceTable";

pub struct Patch1To2 {
    // Kept for symmetry with `VersionHandler::new` and in case a future
    // revision needs a read-only connection independent of the writer;
    // every operation this patch performs today goes through `writer`.
    _pool: Arc<ConnectionPool>,
    writer: Writer,
    config: EngineConfig,
    backup_dir: PathBuf,
}

impl Patch1To2 {
    pub fn new(pool: Arc<ConnectionPool>, writer: Writer, config: EngineConfig) -> Self {
        let backup_dir = config.storage_root.join(backup_dir_name(1, 2));
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
}

fn table_has_column(connection: &Connection, table: &str, column: &str) -> Result<bool> {
    let query = format!("PRAGMA table_info({table})");
    let mut statement = connection.prepare(&query)?;
    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[async_trait]
impl Patch for Patch1To2 {
    fn from_version(&self) -> i32 {
        1
    }

    fn to_version(&self) -> i32 {
        2
    }

    fn short_description(&self) -> String {
        "Move attachment data from the database into plain files".to_string()
    }

    fn long_description(&self) -> String {
        "Moves note attachment data out of the primary database file and into \
         separate files, avoiding the performance cost SQLite pays when large \
         blobs are stored inline in table rows."
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
        let resource_body = ResourceBodyStore::new(&self.config);

        let already_copied = self
            .writer
            .submit(|conn| SqliteKeyValueStore::get_bool(conn, SETTINGS_NAMESPACE, ALL_DATA_COPIED_KEY))
            .await?
            .unwrap_or(false);

        if !already_copied {
            if cancel.is_canceled() {
                return Err(crate::error::StorageError::Canceled);
            }

            let resources = self
                .writer
                .submit(|conn| -> Result<Vec<(String, String)>> {
                    if !table_has_column(conn, "Resources", "dataBody")? {
                        return Ok(Vec::new());
                    }
                    let mut statement =
                        conn.prepare("SELECT localId, noteLocalId FROM Resources")?;
                    let rows = statement
                        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    Ok(rows)
                })
                .await?;

            let already_processed: Vec<String> = self
                .writer
                .submit(|conn| {
                    Ok(SqliteKeyValueStore::get_string_list(conn, SETTINGS_NAMESPACE, COPIED_RESOURCE_IDS_KEY)?
                        .unwrap_or_default())
                })
                .await?;

            let total = resources.len().max(1);
            let mut processed: Vec<String> = already_processed.clone();

            for (index, (resource_local_id, note_local_id)) in resources.into_iter().enumerate() {
                if already_processed.contains(&resource_local_id) {
                    continue;
                }
                if cancel.is_canceled() {
                    return Err(crate::error::StorageError::Canceled);
                }

                let resource_local_id_for_job = resource_local_id.clone();
                let note_local_id_for_job = note_local_id.clone();
                let resource_body = resource_body.clone();

                self.writer
                    .submit(move |conn| {
                        let data: Option<Vec<u8>> = conn.query_row(
                            "SELECT dataBody FROM Resources WHERE localId = ?1",
                            [&resource_local_id_for_job],
                            |row| row.get(0),
                        )?;
                        let alternate_data: Option<Vec<u8>> = conn.query_row(
                            "SELECT alternateDataBody FROM Resources WHERE localId = ?1",
                            [&resource_local_id_for_job],
                            |row| row.get(0),
                        )?;

                        if let Some(bytes) = data {
                            let (version_id, _) = resource_body.stage_write(
                                conn,
                                BodyKind::Data,
                                &note_local_id_for_job,
                                &resource_local_id_for_job,
                                &bytes,
                            )?;
                            ResourceBodyStore::commit_version_id(
                                conn,
                                BodyKind::Data,
                                &resource_local_id_for_job,
                                &version_id,
                            )?;
                        }

                        if let Some(bytes) = alternate_data {
                            let (version_id, _) = resource_body.stage_write(
                                conn,
                                BodyKind::AlternateData,
                                &note_local_id_for_job,
                                &resource_local_id_for_job,
                                &bytes,
                            )?;
                            ResourceBodyStore::commit_version_id(
                                conn,
                                BodyKind::AlternateData,
                                &resource_local_id_for_job,
                                &version_id,
                            )?;
                        }

                        Ok(())
                    })
                    .await?;

                processed.push(resource_local_id);
                let processed_for_store = processed.clone();
                self.writer
                    .submit(move |conn| {
                        SqliteKeyValueStore::set_string_list(
                            conn,
                            SETTINGS_NAMESPACE,
                            COPIED_RESOURCE_IDS_KEY,
                            &processed_for_store,
                        )
                    })
                    .await?;

                let pct = 5 + ((index + 1) * 65 / total);
                let _ = progress.send(pct.min(70) as u8);
            }

            self.writer
                .submit(|conn| SqliteKeyValueStore::set_bool(conn, SETTINGS_NAMESPACE, ALL_DATA_COPIED_KEY, true))
                .await?;
            let _ = progress.send(70);
        }

        let already_removed = self
            .writer
            .submit(|conn| SqliteKeyValueStore::get_bool(conn, SETTINGS_NAMESPACE, ALL_DATA_REMOVED_KEY))
            .await?
            .unwrap_or(false);

        if !already_removed {
            self.writer
                .submit(|conn| {
                    if table_has_column(conn, "Resources", "dataBody")? {
                        conn.execute_batch(
                            "UPDATE Resources SET dataBody = NULL, alternateDataBody = NULL;",
                        )?;
                    }
                    Ok(())
                })
                .await?;
            let _ = progress.send(80);

            self.writer.submit(|conn| Ok(conn.execute_batch("VACUUM;")?)).await?;
            let _ = progress.send(90);

            self.writer
                .submit(|conn| SqliteKeyValueStore::set_bool(conn, SETTINGS_NAMESPACE, ALL_DATA_REMOVED_KEY, true))
                .await?;
        }

        let _ = progress.send(95);
        self.writer.submit(|conn| set_version(conn, 2)).await?;
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

    fn patch_in(dir: &TempDir) -> Patch1To2 {
        let config = EngineConfig::sqlite_at(dir.path());
        let pool = ConnectionPool::new(&config).unwrap();
        {
            let conn = pool.database().unwrap();
            let conn = conn.lock().unwrap();
            TablesInitializer::init_all(&conn).unwrap();
        }
        let writer = Writer::spawn(Arc::clone(&pool)).unwrap();
        Patch1To2::new(pool, writer, config)
    }

    #[tokio::test]
    async fn apply_on_a_fresh_database_bumps_version_with_nothing_to_move() {
        let dir = TempDir::new().unwrap();
        let patch = patch_in(&dir);

        let (tx, _rx) = tokio::sync::watch::channel(0u8);
        patch.apply(tx, CancelToken::new()).await.unwrap();

        let version: i32 = patch
            .writer
            .submit(|conn| Ok(conn.query_row("SELECT version FROM Auxiliary", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn apply_is_resumable_after_the_copy_flag_is_already_set() {
        let dir = TempDir::new().unwrap();
        let patch = patch_in(&dir);

        patch
            .writer
            .submit(|conn| {
                SqliteKeyValueStore::set_bool(conn, SETTINGS_NAMESPACE, ALL_DATA_COPIED_KEY, true)
            })
            .await
            .unwrap();

        let (tx, _rx) = tokio::sync::watch::channel(0u8);
        patch.apply(tx, CancelToken::new()).await.unwrap();

        let version: i32 = patch
            .writer
            .submit(|conn| Ok(conn.query_row("SELECT version FROM Auxiliary", [], |r| r.get(0))?))
            .await
            .unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn backup_then_restore_round_trips_the_database_file() {
        let dir = TempDir::new().unwrap();
        let patch = patch_in(&dir);

        let (tx, _rx) = tokio::sync::watch::channel(0u8);
        patch
            .backup_local_storage(tx, CancelToken::new())
            .await
            .unwrap();
        assert!(patch.backup_dir.join("qn.storage.sqlite").exists());

        patch.remove_local_storage_backup().await.unwrap();
        assert!(!patch.backup_dir.exists());
    }
}
