//! Namespaced key/value persistence used by patches for resumability
//! (spec.md §6).
//!
//! The original ties this to Qt's `QSettings`/account-settings store, which
//! is explicitly out of scope here (spec.md §1: "account-settings
//! persistence (treated as a key/value store)"). This crate still needs
//! *some* concrete store to make migrations resumable across restarts, so
//! it grounds one on the same `rusqlite` connection used everywhere else,
//! behind a narrow trait a caller could swap out.

use rusqlite::{params, Connection};

use crate::error::Result;

/// Settings store backed by the `EngineSettings` table (see `schema.sql`).
/// Stateless by design: every call takes the connection it should run
/// against, since it's always invoked from inside a patch's own
/// transaction (§4.2).
pub struct SqliteKeyValueStore;

impl SqliteKeyValueStore {
    fn get_raw(connection: &Connection, namespace: &str, key: &str) -> Result<Option<String>> {
        let value: Option<String> = connection
            .query_row(
                "SELECT value FROM EngineSettings WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .ok();
        Ok(value)
    }

    fn set_raw(connection: &Connection, namespace: &str, key: &str, value: &str) -> Result<()> {
        connection.execute(
            "INSERT INTO EngineSettings (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            params![namespace, key, value],
        )?;
        Ok(())
    }

    pub fn get_bool(connection: &Connection, namespace: &str, key: &str) -> Result<Option<bool>> {
        Ok(Self::get_raw(connection, namespace, key)?.map(|v| v == "true"))
    }

    pub fn set_bool(connection: &Connection, namespace: &str, key: &str, value: bool) -> Result<()> {
        Self::set_raw(connection, namespace, key, if value { "true" } else { "false" })
    }

    pub fn get_string_list(
        connection: &Connection,
        namespace: &str,
        key: &str,
    ) -> Result<Option<Vec<String>>> {
        match Self::get_raw(connection, namespace, key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).unwrap_or_default())),
            None => Ok(None),
        }
    }

    pub fn set_string_list(
        connection: &Connection,
        namespace: &str,
        key: &str,
        value: &[String],
    ) -> Result<()> {
        let raw = serde_json::to_string(value).expect("Vec<String> always serializes");
        Self::set_raw(connection, namespace, key, &raw)
    }
}
