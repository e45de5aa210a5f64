//! Tables initializer (spec.md §4's "Tables Initializer" component).

use rusqlite::Connection;

use crate::error::Result;

/// The golden schema text, loaded verbatim; `tests::init_all_creates_every_entity_table`
/// checks that applying it produces every table this crate knows about.
pub const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Idempotent schema creation taking an open connection.
///
/// spec.md §9 resolves the "two signatures in the source" open question in
/// favor of this static, idempotent form; there is no instance method and
/// no `DatabaseInfo`-taking legacy overload.
pub struct TablesInitializer;

impl TablesInitializer {
    /// Creates every table/index this crate knows about and, for a database
    /// that has never carried a version row, stamps it straight to
    /// `HIGHEST_SUPPORTED_VERSION` — a brand-new account has no legacy rows
    /// to migrate, so it should never need to run a patch (spec.md §8
    /// scenario 2). An account carried over from an older build already has
    /// its own version row, which this leaves untouched.
    pub fn init_all(connection: &Connection) -> Result<()> {
        connection.execute_batch(SCHEMA_SQL)?;
        connection.execute(
            "INSERT INTO Auxiliary (version) \
             SELECT ?1 WHERE NOT EXISTS (SELECT 1 FROM Auxiliary)",
            rusqlite::params![crate::version::HIGHEST_SUPPORTED_VERSION],
        )?;
        tracing::debug!(target: "quill_storage::schema", "schema initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn init_all_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        TablesInitializer::init_all(&conn).unwrap();
        TablesInitializer::init_all(&conn).unwrap();

        let table_count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='Notebooks'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(table_count, 1);

        let version_row_count: i64 = conn
            .query_row("SELECT COUNT(*) FROM Auxiliary", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version_row_count, 1);
    }

    #[test]
    fn init_all_stamps_a_brand_new_database_at_the_highest_supported_version() {
        let conn = Connection::open_in_memory().unwrap();
        TablesInitializer::init_all(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM Auxiliary", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, crate::version::HIGHEST_SUPPORTED_VERSION);
    }

    #[test]
    fn init_all_never_overwrites_an_existing_version_row() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn.execute("INSERT INTO Auxiliary (version) VALUES (1)", []).unwrap();

        TablesInitializer::init_all(&conn).unwrap();

        let version: i32 = conn
            .query_row("SELECT version FROM Auxiliary", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn init_all_creates_every_entity_table() {
        let conn = Connection::open_in_memory().unwrap();
        TablesInitializer::init_all(&conn).unwrap();

        for table in [
            "Auxiliary",
            "Notebooks",
            "Notes",
            "Tags",
            "NoteTags",
            "Resources",
            "ResourceDataBodyVersionIds",
            "ResourceAlternateDataBodyVersionIds",
            "SavedSearches",
            "LinkedNotebooks",
            "Users",
            "UserViewedPromotions",
            "UserRecentMailedAddresses",
            "EngineSettings",
        ] {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = ?1",
                    [table],
                    |r| r.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }
}
