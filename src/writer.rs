//! Single writer thread + exclusive write transaction discipline
//! (spec.md §4.4, §5).
//!
//! All mutating SQL runs on one dedicated OS thread; callers submit a
//! closure and await its result. Because the writer applies jobs strictly
//! in submission order and nothing else ever touches the writer's
//! connection, write transactions never interleave.

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, StorageError};
use crate::pool::ConnectionPool;

type WriteJob = Box<dyn FnOnce(&Connection) + Send>;

/// Handle to the writer thread. Cloning is cheap (it's just a channel
/// sender); every clone posts to the same underlying thread.
#[derive(Clone)]
pub struct Writer {
    sender: mpsc::UnboundedSender<WriteJob>,
    /// Process-wide writer mutex (spec.md §5): held for the duration of
    /// every transaction so that two `Engine` instances pointed at the same
    /// database file never interleave writes, even though each has its own
    /// writer thread.
    process_mutex: Arc<std::sync::Mutex<()>>,
}

impl Writer {
    pub fn spawn(pool: Arc<ConnectionPool>) -> Result<Self> {
        Self::spawn_with_mutex(pool, Arc::new(std::sync::Mutex::new(())))
    }

    /// Like `spawn`, but shares `process_mutex` with another `Writer` —
    /// used to model two engine instances backed by the same database
    /// file (spec.md §5's "multi-process pathological case", tested here
    /// in-process).
    pub fn spawn_with_mutex(
        pool: Arc<ConnectionPool>,
        process_mutex: Arc<std::sync::Mutex<()>>,
    ) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<WriteJob>();
        let mutex_for_thread = Arc::clone(&process_mutex);

        let connection = pool.database()?;

        std::thread::Builder::new()
            .name("quill-storage-writer".to_string())
            .spawn(move || {
                while let Some(job) = receiver.blocking_recv() {
                    let _guard = mutex_for_thread
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    let conn = connection
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    job(&conn);
                }
            })
            .map_err(|e| StorageError::Runtime(format!("failed to spawn writer thread: {e}")))?;

        Ok(Self {
            sender,
            process_mutex,
        })
    }

    pub fn process_mutex(&self) -> Arc<std::sync::Mutex<()>> {
        Arc::clone(&self.process_mutex)
    }

    /// Posts `f` to the writer thread and awaits its result. Jobs run in
    /// the order they were submitted (spec.md §5).
    pub async fn submit<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();

        let job: WriteJob = Box::new(move |conn| {
            let result = f(conn);
            let _ = response_tx.send(result);
        });

        self.sender
            .send(job)
            .map_err(|_| StorageError::Runtime("writer thread is no longer running".to_string()))?;

        response_rx
            .await
            .map_err(|_| StorageError::Runtime("writer thread dropped the response".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::schema::TablesInitializer;
    use tempfile::TempDir;

    fn writer_in(dir: &TempDir) -> Writer {
        let config = EngineConfig::sqlite_at(dir.path());
        let pool = ConnectionPool::new(&config).unwrap();
        let writer = Writer::spawn(pool).unwrap();
        writer
    }

    #[tokio::test]
    async fn submitted_jobs_run_in_order() {
        let dir = TempDir::new().unwrap();
        let writer = writer_in(&dir);

        writer
            .submit(|conn| {
                TablesInitializer::init_all(conn)?;
                conn.execute("UPDATE Auxiliary SET version = 1", [])?;
                Ok(())
            })
            .await
            .unwrap();

        for _ in 0..50 {
            writer
                .submit(|conn| {
                    conn.execute("UPDATE Auxiliary SET version = version + 1", [])?;
                    Ok(())
                })
                .await
                .unwrap();
        }

        let version: i64 = writer
            .submit(|conn| Ok(conn.query_row("SELECT version FROM Auxiliary", [], |r| r.get(0))?))
            .await
            .unwrap();

        assert_eq!(version, 51);
    }

    #[tokio::test]
    async fn errors_propagate_to_the_caller() {
        let dir = TempDir::new().unwrap();
        let writer = writer_in(&dir);

        let result: Result<()> = writer
            .submit(|conn| {
                conn.execute("SELECT * FROM NoSuchTable", [])?;
                Ok(())
            })
            .await;

        assert!(result.is_err());
    }
}
