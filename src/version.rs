//! Schema version handler and patch orchestration (spec.md §4.2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::config::EngineConfig;
use crate::error::{Result, StorageError};
use crate::patches::{v1_v2::Patch1To2, v2_v3::Patch2To3};
use crate::pool::ConnectionPool;
use crate::writer::Writer;

/// The engine constant from spec.md §4.2: the highest schema version this
/// build knows how to read and migrate to.
pub const HIGHEST_SUPPORTED_VERSION: i32 = 3;

/// Cooperative cancellation for backup/restore (spec.md §5): each progress
/// step checks this before doing more work.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Progress channel for a long-running patch stage (0-100), spec.md §4.2.
pub type ProgressSender = watch::Sender<u8>;

/// One migration step (spec.md §4.2's "Patch" contract).
#[async_trait]
pub trait Patch: Send + Sync {
    fn from_version(&self) -> i32;
    fn to_version(&self) -> i32;
    fn short_description(&self) -> String;
    fn long_description(&self) -> String;

    async fn backup_local_storage(
        &self,
        progress: ProgressSender,
        cancel: CancelToken,
    ) -> Result<()>;

    async fn apply(&self, progress: ProgressSender, cancel: CancelToken) -> Result<()>;

    async fn restore_local_storage_from_backup(
        &self,
        progress: ProgressSender,
        cancel: CancelToken,
    ) -> Result<()>;

    async fn remove_local_storage_backup(&self) -> Result<()>;
}

/// Reads/writes the schema version; enumerates patches required to reach
/// `HIGHEST_SUPPORTED_VERSION` (spec.md §4.2).
pub struct VersionHandler {
    pool: Arc<ConnectionPool>,
    writer: Writer,
    config: EngineConfig,
}

impl VersionHandler {
    pub fn new(pool: Arc<ConnectionPool>, writer: Writer, config: EngineConfig) -> Self {
        Self {
            pool,
            writer,
            config,
        }
    }

    pub async fn version(&self) -> Result<i32> {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let connection = pool.database()?;
            let connection = connection.lock().unwrap_or_else(|e| e.into_inner());
            version_impl(&connection)
        })
        .await
        .map_err(|e| StorageError::Runtime(format!("version query task panicked: {e}")))?
    }

    pub fn highest_supported_version(&self) -> i32 {
        HIGHEST_SUPPORTED_VERSION
    }

    pub async fn is_version_too_high(&self) -> Result<bool> {
        Ok(self.version().await? > self.highest_supported_version())
    }

    pub async fn requires_upgrade(&self) -> Result<bool> {
        Ok(self.version().await? < self.highest_supported_version())
    }

    pub async fn required_patches(&self) -> Result<Vec<Arc<dyn Patch>>> {
        let current = self.version().await?;
        let mut patches: Vec<Arc<dyn Patch>> = Vec::new();

        if current < 2 {
            patches.push(Arc::new(Patch1To2::new(
                Arc::clone(&self.pool),
                self.writer.clone(),
                self.config.clone(),
            )));
        }

        if current < 3 {
            patches.push(Arc::new(Patch2To3::new(
                Arc::clone(&self.pool),
                self.writer.clone(),
                self.config.clone(),
            )));
        }

        Ok(patches)
    }
}

fn version_impl(connection: &rusqlite::Connection) -> Result<i32> {
    let version: Option<i32> = connection
        .query_row("SELECT version FROM Auxiliary LIMIT 1", [], |row| row.get(0))
        .ok();

    match version {
        Some(v) => Ok(v),
        None => {
            tracing::debug!(
                target: "quill_storage::version",
                "no version row found, assuming version 1"
            );
            Ok(1)
        }
    }
}

/// Sets the schema version, keeping `Auxiliary` to its single-row invariant
/// (the table carries no primary key, so a bare `INSERT OR REPLACE` would
/// accumulate rows across patches). Patches call this once they've finished
/// applying, never raw SQL against `Auxiliary`.
pub fn set_version(connection: &rusqlite::Connection, version: i32) -> Result<()> {
    let updated = connection.execute("UPDATE Auxiliary SET version = ?1", rusqlite::params![version])?;
    if updated == 0 {
        connection.execute(
            "INSERT INTO Auxiliary (version) VALUES (?1)",
            rusqlite::params![version],
        )?;
    }
    Ok(())
}

/// Backup -> apply | restore -> remove backup -> bump version
/// (spec.md §4.2 orchestration).
pub async fn upgrade_to_highest_version(handler: &VersionHandler) -> Result<()> {
    let patches = handler.required_patches().await?;
    for patch in patches {
        tracing::info!(
            target: "quill_storage::version",
            from = patch.from_version(),
            to = patch.to_version(),
            "applying local storage patch"
        );

        let (backup_progress_tx, _) = watch::channel(0u8);
        patch
            .backup_local_storage(backup_progress_tx, CancelToken::new())
            .await?;

        let (apply_progress_tx, _) = watch::channel(0u8);
        let apply_result = patch.apply(apply_progress_tx, CancelToken::new()).await;

        match apply_result {
            Ok(()) => {
                patch.remove_local_storage_backup().await?;
            }
            Err(err) => {
                tracing::warn!(
                    target: "quill_storage::version",
                    error = %err,
                    "patch failed, restoring from backup"
                );
                let (restore_progress_tx, _) = watch::channel(0u8);
                patch
                    .restore_local_storage_from_backup(restore_progress_tx, CancelToken::new())
                    .await?;
                return Err(StorageError::MigrationFailure(format!(
                    "patch {}->{} failed and was rolled back: {err}",
                    patch.from_version(),
                    patch.to_version()
                )));
            }
        }
    }

    Ok(())
}
