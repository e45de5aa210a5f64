//! Connection pool (spec.md §4.1).
//!
//! Hands out a `rusqlite::Connection` to the calling thread, opening one on
//! first use, and guarantees distinct threads never share a connection.
//! `rusqlite::Connection` is `!Sync`, so "per calling thread" is enforced
//! here the same way the original keys connections by the OS thread that
//! asked for one — in this crate that's whichever worker thread is running
//! the current `spawn_blocking` closure.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::thread::ThreadId;

use rusqlite::Connection;

use crate::config::EngineConfig;
use crate::error::{Result, StorageError};

struct ConnectionRecord {
    connection: Arc<std::sync::Mutex<Connection>>,
}

/// Per-thread SQL connections over a single database file (spec.md §4.1).
pub struct ConnectionPool {
    database_path: PathBuf,
    page_size: u32,
    connections: RwLock<HashMap<ThreadId, ConnectionRecord>>,
}

thread_local! {
    /// Drop guard that removes this thread's connection record from the
    /// owning pool when the thread exits. This replaces the original's
    /// "weak self captured in a thread-finished callback" pattern (spec.md
    /// §9) with a handle whose lifetime is tied to the thread itself.
    static THREAD_GUARD: RefCell<Option<ThreadGuard>> = const { RefCell::new(None) };
}

struct ThreadGuard {
    pool: Weak<ConnectionPool>,
    thread_id: ThreadId,
}

impl Drop for ThreadGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.upgrade() {
            let mut connections = pool.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.remove(&self.thread_id);
        }
    }
}

impl ConnectionPool {
    /// Opens (lazily, on first `database()` call) connections backed by
    /// `config`. Fails fast only if the database path's parent directory
    /// does not exist and cannot be created — everything else about
    /// opening a connection is deferred to the first `database()` call, per
    /// spec.md §4.1.
    pub fn new(config: &EngineConfig) -> Result<Arc<Self>> {
        if config.database_path.as_os_str().is_empty() {
            return Err(StorageError::InvalidArgument(
                "EngineConfig.database_path must not be empty".to_string(),
            ));
        }

        if let Some(parent) = config.database_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }

        Ok(Arc::new(Self {
            database_path: config.database_path.clone(),
            page_size: os_page_size(),
            connections: RwLock::new(HashMap::new()),
        }))
    }

    /// Returns a connection bound to the calling thread, opening one on
    /// first call from that thread.
    pub fn database(self: &Arc<Self>) -> Result<Arc<std::sync::Mutex<Connection>>> {
        let thread_id = std::thread::current().id();

        {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            if let Some(record) = connections.get(&thread_id) {
                return Ok(Arc::clone(&record.connection));
            }
        }

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        // Double-checked: another writer may have raced us to this thread id
        // (impossible in practice since a thread id is only ever observed
        // by its own thread, but cheap to keep correct).
        if let Some(record) = connections.get(&thread_id) {
            return Ok(Arc::clone(&record.connection));
        }

        let connection = self.open_connection()?;
        let connection = Arc::new(std::sync::Mutex::new(connection));
        connections.insert(
            thread_id,
            ConnectionRecord {
                connection: Arc::clone(&connection),
            },
        );
        drop(connections);

        THREAD_GUARD.with(|guard| {
            *guard.borrow_mut() = Some(ThreadGuard {
                pool: Arc::downgrade(self),
                thread_id,
            });
        });

        Ok(connection)
    }

    fn open_connection(&self) -> Result<Connection> {
        let connection = Connection::open(&self.database_path).map_err(|e| {
            StorageError::StorageOpen {
                message: format!("failed to open {}", self.database_path.display()),
                source: Some(e),
            }
        })?;

        connection
            .execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| StorageError::StorageOpen {
                message: "failed to enable foreign keys for the local storage database \
                          connection"
                    .to_string(),
                source: Some(e),
            })?;

        connection
            .pragma_update(None, "page_size", self.page_size)
            .map_err(|e| StorageError::StorageOpen {
                message: "failed to set page size for the local storage database connection"
                    .to_string(),
                source: Some(e),
            })?;

        tracing::debug!(
            target: "quill_storage::pool",
            thread = ?std::thread::current().id(),
            "opened local storage connection"
        );

        Ok(connection)
    }

    /// Number of currently-live per-thread connections. Exposed for tests
    /// (spec.md §8 scenario 1).
    pub fn live_connection_count(&self) -> usize {
        self.connections.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// The OS page size SQLite should use for new databases (spec.md §4.1:
/// "sets `page_size` to the OS page size"). 4096 is the page size on every
/// platform this crate ships for; a dedicated `libc`/`page_size` dependency
/// would buy nothing over hardcoding the one value that's ever observed.
fn os_page_size() -> u32 {
    4096
}
