//! Entity handlers (spec.md §4.4): one module per entity kind, each
//! exposing put/find/expunge/count operations. Reads run on the blocking
//! pool against a thread-local connection; writes are submitted to the
//! single writer thread and followed by a `Notifier` event once the
//! transaction that produced them has committed.

pub mod notebooks;
pub mod notes;
pub mod resources;
pub mod saved_searches;
pub mod tags;
pub mod users;

use std::sync::Arc;

use crate::notifier::Notifier;
use crate::pool::ConnectionPool;
use crate::resource_body::ResourceBodyStore;
use crate::writer::Writer;

/// Shared plumbing every entity handler is built from.
#[derive(Clone)]
pub struct HandlerContext {
    pub pool: Arc<ConnectionPool>,
    pub writer: Writer,
    pub notifier: Arc<Notifier>,
    pub resource_body: Arc<ResourceBodyStore>,
}

/// Runs a read-only closure against the calling account's connection on the
/// blocking pool, per spec.md §4.1's reader model.
pub(crate) async fn read<F, T>(pool: Arc<ConnectionPool>, f: F) -> crate::error::Result<T>
where
    F: FnOnce(&rusqlite::Connection) -> crate::error::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let connection = pool.database()?;
        let connection = connection.lock().unwrap_or_else(|e| e.into_inner());
        f(&connection)
    })
    .await
    .map_err(|e| crate::error::StorageError::Runtime(format!("read task panicked: {e}")))?
}

/// Wraps `f` in a manual `BEGIN IMMEDIATE`/`COMMIT`/`ROLLBACK` since
/// `rusqlite::Connection::transaction` needs `&mut Connection`, which a
/// writer job (handed only `&Connection`, per spec.md §4.4) never has.
pub(crate) fn in_transaction<T>(
    connection: &rusqlite::Connection,
    f: impl FnOnce(&rusqlite::Connection) -> crate::error::Result<T>,
) -> crate::error::Result<T> {
    connection.execute_batch("BEGIN IMMEDIATE")?;
    match f(connection) {
        Ok(value) => {
            connection.execute_batch("COMMIT")?;
            Ok(value)
        }
        Err(e) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

/// Maps a SQLite UNIQUE constraint violation to a `Conflict` error carrying
/// `message`; every other error passes through unchanged.
pub(crate) fn conflict_on_unique_violation(
    err: crate::error::StorageError,
    message: impl Into<String>,
) -> crate::error::StorageError {
    if let crate::error::StorageError::StorageOperation { source: Some(ref source), .. } = err {
        if let rusqlite::Error::SqliteFailure(ref sqlite_err, _) = source {
            if sqlite_err.code == rusqlite::ErrorCode::ConstraintViolation {
                return crate::error::StorageError::Conflict(message.into());
            }
        }
    }
    err
}
