//! Resource binary-data storage (spec.md §4.3).
//!
//! A resource body or alternate-body lives, if present, at
//! `<accountStorage>/Resources/<data|alternateData>/<noteLocalId>/<resourceLocalId>/<versionId>.dat`.
//! The version id recorded in `ResourceDataBodyVersionIds` /
//! `ResourceAlternateDataBodyVersionIds` names the file that's currently
//! current; writers generate a fresh id on every write so the SQL commit
//! and the file write can be ordered without a shared transaction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, Connection};
use tokio::sync::RwLock;

use crate::config::EngineConfig;
use crate::error::{Result, StorageError};
use crate::models::new_local_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Data,
    AlternateData,
}

impl BodyKind {
    fn version_table(self) -> &'static str {
        match self {
            BodyKind::Data => "ResourceDataBodyVersionIds",
            BodyKind::AlternateData => "ResourceAlternateDataBodyVersionIds",
        }
    }
}

/// Coordinates the resource body file tree between the writer (renames,
/// deletes) and readers (opens for read), per spec.md §5's shared-resource
/// policy: readers hold the lock shared, the writer holds it exclusive for
/// the rename-and-commit step.
#[derive(Clone)]
pub struct ResourceBodyStore {
    data_root: PathBuf,
    alternate_data_root: PathBuf,
    lock: Arc<RwLock<()>>,
}

impl ResourceBodyStore {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            data_root: config.resources_data_dir(),
            alternate_data_root: config.resources_alternate_data_dir(),
            lock: Arc::new(RwLock::new(())),
        }
    }

    fn root_for(&self, kind: BodyKind) -> &Path {
        match kind {
            BodyKind::Data => &self.data_root,
            BodyKind::AlternateData => &self.alternate_data_root,
        }
    }

    fn dir_for(&self, kind: BodyKind, note_local_id: &str, resource_local_id: &str) -> PathBuf {
        self.root_for(kind).join(note_local_id).join(resource_local_id)
    }

    fn file_for(
        &self,
        kind: BodyKind,
        note_local_id: &str,
        resource_local_id: &str,
        version_id: &str,
    ) -> PathBuf {
        self.dir_for(kind, note_local_id, resource_local_id)
            .join(format!("{version_id}.dat"))
    }

    pub fn current_version_id(
        connection: &Connection,
        kind: BodyKind,
        resource_local_id: &str,
    ) -> Result<Option<String>> {
        let table = kind.version_table();
        let query = format!("SELECT versionId FROM {table} WHERE resourceLocalId = ?1");
        let version_id: Option<String> = connection
            .query_row(&query, params![resource_local_id], |row| row.get(0))
            .ok();
        Ok(version_id)
    }

    /// Reads the current body, if one exists. A version-id row with no
    /// matching file is a storage error, not a silent `None` (spec.md
    /// §4.3's "a missing file is reported as a storage error").
    pub fn read(
        &self,
        connection: &Connection,
        kind: BodyKind,
        note_local_id: &str,
        resource_local_id: &str,
    ) -> Result<Option<Vec<u8>>> {
        let Some(version_id) = Self::current_version_id(connection, kind, resource_local_id)?
        else {
            return Ok(None);
        };

        let path = self.file_for(kind, note_local_id, resource_local_id, &version_id);
        std::fs::read(&path)
            .map(Some)
            .map_err(|e| StorageError::io(format!("missing resource body file {}", path.display()), e))
    }

    /// Stage 1-3 of the write protocol (spec.md §4.3): generate a new
    /// version id, write the file, fsync. Returns the new version id and
    /// the previous one (if any) so the caller can commit the version-id
    /// update in the same SQL transaction and only then call
    /// `delete_stale` with the previous id.
    pub fn stage_write(
        &self,
        connection: &Connection,
        kind: BodyKind,
        note_local_id: &str,
        resource_local_id: &str,
        bytes: &[u8],
    ) -> Result<(String, Option<String>)> {
        let previous = Self::current_version_id(connection, kind, resource_local_id)?;
        let new_version_id = new_local_id();

        let dir = self.dir_for(kind, note_local_id, resource_local_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| StorageError::io(format!("failed to create {}", dir.display()), e))?;

        let path = self.file_for(kind, note_local_id, resource_local_id, &new_version_id);
        let mut file = std::fs::File::create(&path)
            .map_err(|e| StorageError::io(format!("failed to create {}", path.display()), e))?;

        use std::io::Write;
        file.write_all(bytes)
            .map_err(|e| StorageError::io(format!("failed to write {}", path.display()), e))?;
        file.sync_all()
            .map_err(|e| StorageError::io(format!("failed to fsync {}", path.display()), e))?;

        Ok((new_version_id, previous))
    }

    /// Commits the new version id into the version-id table. Must run
    /// inside the same SQL transaction as the rest of the resource
    /// metadata change (spec.md §4.3 stage 4).
    pub fn commit_version_id(
        connection: &Connection,
        kind: BodyKind,
        resource_local_id: &str,
        version_id: &str,
    ) -> Result<()> {
        let table = kind.version_table();
        let query = format!(
            "INSERT INTO {table} (resourceLocalId, versionId) VALUES (?1, ?2)
             ON CONFLICT(resourceLocalId) DO UPDATE SET versionId = excluded.versionId"
        );
        connection.execute(&query, params![resource_local_id, version_id])?;
        Ok(())
    }

    /// Stage 5: best-effort deletion of the file the new version replaced.
    /// Only ever called after the owning transaction has committed; safe
    /// to skip or fail (an orphan sweep will clean it up later).
    pub fn delete_stale(
        &self,
        kind: BodyKind,
        note_local_id: &str,
        resource_local_id: &str,
        stale_version_id: &str,
    ) {
        let path = self.file_for(kind, note_local_id, resource_local_id, stale_version_id);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    target: "quill_storage::resource_body",
                    path = %path.display(),
                    error = %e,
                    "failed to remove stale resource body file"
                );
            }
        }
    }

    /// Removes every body/alternate-body file belonging to `resource_local_id`
    /// (used when a resource — or its owning note/notebook — is expunged,
    /// spec.md §4.4/§3 cascade invariants).
    pub fn delete_all_for_resource(
        &self,
        note_local_id: &str,
        resource_local_id: &str,
    ) {
        for kind in [BodyKind::Data, BodyKind::AlternateData] {
            let dir = self.dir_for(kind, note_local_id, resource_local_id);
            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    pub fn lock(&self) -> Arc<RwLock<()>> {
        Arc::clone(&self.lock)
    }

    /// Finds resource body files on disk with no matching version-id row
    /// (a data folder restored from a build that predates version ids) and
    /// adopts the file that's there as the current version. Used by the
    /// 2->3 migration's self-healing pass (spec.md §4.2). Runs against
    /// `connection` directly so callers can invoke it from inside a writer
    /// job and keep the single-writer-thread invariant.
    pub fn adopt_unversioned_files(&self, connection: &Connection) -> Result<usize> {
        let mut adopted = 0;
        for kind in [BodyKind::Data, BodyKind::AlternateData] {
            adopted += adopt_unversioned_files_for_kind(connection, kind, self.root_for(kind))?;
        }
        Ok(adopted)
    }

    /// Relocates the flat v2 on-disk layout (`<noteLocalId>/<resourceLocalId>.dat`)
    /// into the versioned layout (`<noteLocalId>/<resourceLocalId>/<versionId>.dat`),
    /// generating and committing a version id for each file moved. Used by
    /// the 2->3 migration's "introduce version-id directories / move files"
    /// phase (spec.md §4.2.2(B), §8 scenario 3). Runs against `connection`
    /// directly so callers can invoke it from inside a writer job.
    pub fn relocate_flat_files(&self, connection: &Connection) -> Result<usize> {
        let mut relocated = 0;
        for kind in [BodyKind::Data, BodyKind::AlternateData] {
            relocated += relocate_flat_files_for_kind(connection, kind, self.root_for(kind))?;
        }
        Ok(relocated)
    }

    /// Background sweeper (spec.md §9's open question, resolved: implement
    /// it). Walks `Resources/**`, and for every
    /// `<noteLocalId>/<resourceLocalId>/<versionId>.dat` file whose
    /// `versionId` is not the one recorded in the version-id table for that
    /// resource, deletes it.
    pub fn sweep_orphans(&self, connection: &Connection) -> Result<usize> {
        let mut removed = 0;
        for kind in [BodyKind::Data, BodyKind::AlternateData] {
            removed += self.sweep_orphans_for_kind(connection, kind)?;
        }
        Ok(removed)
    }

    fn sweep_orphans_for_kind(&self, connection: &Connection, kind: BodyKind) -> Result<usize> {
        let root = self.root_for(kind).to_path_buf();
        if !root.exists() {
            return Ok(0);
        }

        let mut removed = 0;
        let note_dirs = std::fs::read_dir(&root)
            .map_err(|e| StorageError::io(format!("failed to read {}", root.display()), e))?;

        for note_entry in note_dirs.flatten() {
            if !note_entry.path().is_dir() {
                continue;
            }
            let Ok(resource_dirs) = std::fs::read_dir(note_entry.path()) else {
                continue;
            };

            for resource_entry in resource_dirs.flatten() {
                let resource_dir = resource_entry.path();
                if !resource_dir.is_dir() {
                    continue;
                }
                let resource_local_id = resource_entry.file_name().to_string_lossy().to_string();
                let current = Self::current_version_id(connection, kind, &resource_local_id)?;

                let Ok(files) = std::fs::read_dir(&resource_dir) else {
                    continue;
                };

                for file_entry in files.flatten() {
                    let path = file_entry.path();
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    let is_current = current.as_deref() == Some(stem);
                    if !is_current {
                        if std::fs::remove_file(&path).is_ok() {
                            removed += 1;
                        }
                    }
                }
            }
        }

        Ok(removed)
    }
}

fn adopt_unversioned_files_for_kind(
    connection: &Connection,
    kind: BodyKind,
    root: &Path,
) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut adopted = 0;
    let note_dirs = std::fs::read_dir(root)
        .map_err(|e| StorageError::io(format!("failed to read {}", root.display()), e))?;

    for note_entry in note_dirs.flatten() {
        if !note_entry.path().is_dir() {
            continue;
        }
        let Ok(resource_dirs) = std::fs::read_dir(note_entry.path()) else {
            continue;
        };

        for resource_entry in resource_dirs.flatten() {
            let resource_dir = resource_entry.path();
            if !resource_dir.is_dir() {
                continue;
            }
            let resource_local_id = resource_entry.file_name().to_string_lossy().to_string();
            if ResourceBodyStore::current_version_id(connection, kind, &resource_local_id)?.is_some() {
                continue;
            }

            let Ok(files) = std::fs::read_dir(&resource_dir) else {
                continue;
            };
            let Some(file) = files.flatten().next() else {
                continue;
            };
            let path = file.path();
            let Some(version_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            ResourceBodyStore::commit_version_id(connection, kind, &resource_local_id, version_id)?;
            adopted += 1;
        }
    }

    Ok(adopted)
}

/// Walks `root` for flat files directly inside a note directory — i.e.
/// `<root>/<noteLocalId>/<resourceLocalId>.dat`, not yet nested under a
/// `<resourceLocalId>/` directory of their own — and moves each into the
/// versioned layout, committing a freshly generated version id for it.
/// Resources already relocated (nested under a `<resourceLocalId>/`
/// directory) are left for `adopt_unversioned_files_for_kind` to handle.
fn relocate_flat_files_for_kind(connection: &Connection, kind: BodyKind, root: &Path) -> Result<usize> {
    if !root.exists() {
        return Ok(0);
    }

    let mut relocated = 0;
    let note_dirs = std::fs::read_dir(root)
        .map_err(|e| StorageError::io(format!("failed to read {}", root.display()), e))?;

    for note_entry in note_dirs.flatten() {
        let note_dir = note_entry.path();
        if !note_dir.is_dir() {
            continue;
        }

        let Ok(entries) = std::fs::read_dir(&note_dir) else {
            continue;
        };

        for entry in entries.flatten() {
            let flat_path = entry.path();
            if !flat_path.is_file() {
                continue;
            }
            let Some(resource_local_id) = flat_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if flat_path.extension().and_then(|e| e.to_str()) != Some("dat") {
                continue;
            }
            let resource_local_id = resource_local_id.to_string();

            let version_dir = note_dir.join(&resource_local_id);
            std::fs::create_dir_all(&version_dir)
                .map_err(|e| StorageError::io(format!("failed to create {}", version_dir.display()), e))?;

            let version_id = new_local_id();
            let versioned_path = version_dir.join(format!("{version_id}.dat"));
            std::fs::rename(&flat_path, &versioned_path).map_err(|e| {
                StorageError::io(
                    format!("failed to relocate {} to {}", flat_path.display(), versioned_path.display()),
                    e,
                )
            })?;

            ResourceBodyStore::commit_version_id(connection, kind, &resource_local_id, &version_id)?;
            relocated += 1;
        }
    }

    Ok(relocated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TablesInitializer;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Connection, ResourceBodyStore) {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::sqlite_at(dir.path());
        let conn = Connection::open_in_memory().unwrap();
        TablesInitializer::init_all(&conn).unwrap();
        let store = ResourceBodyStore::new(&config);
        (dir, conn, store)
    }

    #[test]
    fn write_read_and_replace_round_trips() {
        let (_dir, conn, store) = setup();

        let (v1, previous) = store
            .stage_write(&conn, BodyKind::Data, "note1", "res1", b"hello")
            .unwrap();
        assert!(previous.is_none());
        ResourceBodyStore::commit_version_id(&conn, BodyKind::Data, "res1", &v1).unwrap();

        let read_back = store.read(&conn, BodyKind::Data, "note1", "res1").unwrap();
        assert_eq!(read_back, Some(b"hello".to_vec()));

        let (v2, previous) = store
            .stage_write(&conn, BodyKind::Data, "note1", "res1", b"world")
            .unwrap();
        assert_eq!(previous, Some(v1.clone()));
        ResourceBodyStore::commit_version_id(&conn, BodyKind::Data, "res1", &v2).unwrap();
        store.delete_stale(BodyKind::Data, "note1", "res1", &v1);

        let read_back = store.read(&conn, BodyKind::Data, "note1", "res1").unwrap();
        assert_eq!(read_back, Some(b"world".to_vec()));

        let old_path = store.file_for(BodyKind::Data, "note1", "res1", &v1);
        assert!(!old_path.exists());
    }

    #[test]
    fn missing_file_for_known_version_id_is_a_storage_error() {
        let (_dir, conn, store) = setup();
        ResourceBodyStore::commit_version_id(&conn, BodyKind::Data, "res1", "ghost-version")
            .unwrap();

        let result = store.read(&conn, BodyKind::Data, "note1", "res1");
        assert!(result.is_err());
    }

    #[test]
    fn relocate_flat_files_moves_legacy_layout_into_versioned_directory() {
        let (_dir, conn, store) = setup();

        let note_dir = store.root_for(BodyKind::Data).join("note1");
        std::fs::create_dir_all(&note_dir).unwrap();
        let flat_path = note_dir.join("res1.dat");
        std::fs::write(&flat_path, b"legacy body").unwrap();

        let relocated = store.relocate_flat_files(&conn).unwrap();
        assert_eq!(relocated, 1);
        assert!(!flat_path.exists());

        let version_id = ResourceBodyStore::current_version_id(&conn, BodyKind::Data, "res1")
            .unwrap()
            .expect("version id committed after relocation");
        let versioned_path = store.file_for(BodyKind::Data, "note1", "res1", &version_id);
        assert_eq!(std::fs::read(&versioned_path).unwrap(), b"legacy body");

        // A second pass is a no-op: nothing flat remains to relocate.
        assert_eq!(store.relocate_flat_files(&conn).unwrap(), 0);
    }

    #[test]
    fn sweep_removes_orphans_but_keeps_current_file() {
        let (_dir, conn, store) = setup();

        let (v1, _) = store
            .stage_write(&conn, BodyKind::Data, "note1", "res1", b"hello")
            .unwrap();
        ResourceBodyStore::commit_version_id(&conn, BodyKind::Data, "res1", &v1).unwrap();

        // Simulate a crash between writing a new file and committing the
        // version id update: an orphan file sits next to the current one.
        let orphan_path = store.file_for(BodyKind::Data, "note1", "res1", "orphan-version");
        std::fs::write(&orphan_path, b"orphaned").unwrap();

        let removed = store.sweep_orphans(&conn).unwrap();
        assert_eq!(removed, 1);
        assert!(!orphan_path.exists());
        assert!(store
            .file_for(BodyKind::Data, "note1", "res1", &v1)
            .exists());
    }
}
