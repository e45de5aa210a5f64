//! Engine construction parameters (spec.md §4.1 / §6).

use std::path::PathBuf;

/// Arguments needed to open a per-account storage engine.
///
/// Mirrors the `ConnectionPool` constructor's argument list in the
/// original (host, user, password, database path, driver name, connection
/// options) plus the account storage root that §6's filesystem layout is
/// rooted at.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database_path: PathBuf,
    pub driver_name: String,
    pub connection_options: String,
    /// `<accountStorage>` from spec.md §6. Resources and backups live
    /// under this root.
    pub storage_root: PathBuf,
}

impl EngineConfig {
    /// Construct a config for a single-file SQLite database rooted at
    /// `storage_root`, matching the layout in spec.md §6
    /// (`qn.storage.sqlite` at the account storage root).
    pub fn sqlite_at(storage_root: impl Into<PathBuf>) -> Self {
        let storage_root = storage_root.into();
        Self {
            host: String::new(),
            user: String::new(),
            password: String::new(),
            database_path: storage_root.join("qn.storage.sqlite"),
            driver_name: "QSQLITE".to_string(),
            connection_options: String::new(),
            storage_root,
        }
    }

    pub fn resources_data_dir(&self) -> PathBuf {
        self.storage_root.join("Resources").join("data")
    }

    pub fn resources_alternate_data_dir(&self) -> PathBuf {
        self.storage_root.join("Resources").join("alternateData")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_at_places_db_file_at_storage_root() {
        let cfg = EngineConfig::sqlite_at("/tmp/account-1");
        assert_eq!(
            cfg.database_path,
            PathBuf::from("/tmp/account-1/qn.storage.sqlite")
        );
        assert_eq!(
            cfg.resources_data_dir(),
            PathBuf::from("/tmp/account-1/Resources/data")
        );
    }
}
