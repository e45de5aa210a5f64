//! Per-account local storage engine for Evernote-style notebooks, notes,
//! resources, tags and saved searches (spec.md §1).

pub mod backup;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod notifier;
pub mod patches;
pub mod pool;
pub mod resource_body;
pub mod schema;
pub mod settings;
pub mod sync;
pub mod version;
pub mod writer;

pub use config::EngineConfig;
pub use error::{Result, StorageError};
