//! Backup/restore of the local storage database around a patch application
//! (spec.md §4.2, grounded on `PatchUtils.cpp`'s backup/restore helpers).

use std::path::{Path, PathBuf};

use crate::error::{Result, StorageError};

const SIDECAR_SUFFIXES: [&str; 2] = ["-wal", "-shm"];

/// Copies the main database file plus its WAL/SHM sidecars (if present) from
/// `storage_root` into a fresh `backup_dir`.
pub fn backup_database_files(
    storage_root: &Path,
    database_file_name: &str,
    backup_dir: &Path,
) -> Result<()> {
    std::fs::create_dir_all(backup_dir)
        .map_err(|e| StorageError::io(format!("failed to create {}", backup_dir.display()), e))?;

    let source = storage_root.join(database_file_name);
    if source.exists() {
        copy_file(&source, &backup_dir.join(database_file_name))?;
    }

    for suffix in SIDECAR_SUFFIXES {
        let sidecar_name = format!("{database_file_name}{suffix}");
        let sidecar = storage_root.join(&sidecar_name);
        if sidecar.exists() {
            copy_file(&sidecar, &backup_dir.join(&sidecar_name))?;
        }
    }

    Ok(())
}

/// Restores the database file and sidecars from `backup_dir` back into
/// `storage_root`, overwriting whatever partial upgrade is there.
pub fn restore_database_files_from_backup(
    storage_root: &Path,
    database_file_name: &str,
    backup_dir: &Path,
) -> Result<()> {
    let backed_up = backup_dir.join(database_file_name);
    if backed_up.exists() {
        copy_file(&backed_up, &storage_root.join(database_file_name))?;
    }

    for suffix in SIDECAR_SUFFIXES {
        let sidecar_name = format!("{database_file_name}{suffix}");
        let backed_up_sidecar = backup_dir.join(&sidecar_name);
        let destination = storage_root.join(&sidecar_name);
        if backed_up_sidecar.exists() {
            copy_file(&backed_up_sidecar, &destination)?;
        } else {
            let _ = std::fs::remove_file(&destination);
        }
    }

    Ok(())
}

/// Deletes a patch's backup directory once the patch has applied cleanly.
pub fn remove_backup(backup_dir: &Path) -> Result<()> {
    if backup_dir.exists() {
        std::fs::remove_dir_all(backup_dir)
            .map_err(|e| StorageError::io(format!("failed to remove {}", backup_dir.display()), e))?;
    }
    Ok(())
}

/// Directory name for a patch's backup, matching the original's
/// `backup_upgrade_<from>_to_<to>_<ISO8601>` naming (spec.md §4.2).
pub fn backup_dir_name(from_version: i32, to_version: i32) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%dT%H-%M-%S%.3f");
    format!("backup_upgrade_{from_version}_to_{to_version}_{timestamp}")
}

pub fn backup_dir_path(storage_root: &Path, from_version: i32, to_version: i32) -> PathBuf {
    storage_root.join(backup_dir_name(from_version, to_version))
}

fn copy_file(from: &Path, to: &Path) -> Result<()> {
    std::fs::copy(from, to)
        .map(|_| ())
        .map_err(|e| StorageError::io(format!("failed to copy {} to {}", from.display(), to.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn backup_and_restore_round_trip_main_file_and_sidecars() {
        let storage = TempDir::new().unwrap();
        let backup = TempDir::new().unwrap();

        std::fs::write(storage.path().join("qn.storage.sqlite"), b"db-bytes").unwrap();
        std::fs::write(storage.path().join("qn.storage.sqlite-wal"), b"wal-bytes").unwrap();

        backup_database_files(storage.path(), "qn.storage.sqlite", backup.path()).unwrap();
        assert!(backup.path().join("qn.storage.sqlite").exists());
        assert!(backup.path().join("qn.storage.sqlite-wal").exists());
        assert!(!backup.path().join("qn.storage.sqlite-shm").exists());

        std::fs::write(storage.path().join("qn.storage.sqlite"), b"corrupted").unwrap();

        restore_database_files_from_backup(storage.path(), "qn.storage.sqlite", backup.path())
            .unwrap();

        let restored = std::fs::read(storage.path().join("qn.storage.sqlite")).unwrap();
        assert_eq!(restored, b"db-bytes");
    }

    #[test]
    fn remove_backup_deletes_the_directory() {
        let backup = TempDir::new().unwrap();
        std::fs::write(backup.path().join("qn.storage.sqlite"), b"x").unwrap();
        remove_backup(backup.path()).unwrap();
        assert!(!backup.path().exists());
    }
}
