//! Sync reconciliation (spec.md §4.5/§4.6): caching the name/guid indexes a
//! sync driver needs to decide what changed, resolving conflicts a full or
//! incremental sync surfaces, and purging items a full sync proved are no
//! longer on the server.
//!
//! Grounded on libquentier's `NotebookSyncCache`/`TagSyncCache`/
//! `SavedSearchSyncCache`/`NoteSyncCache`, `NotebookSyncConflictResolver`
//! family, and `FullSyncStaleDataItemsExpunger`. [`cache`] keeps its maps
//! current off the shared [`crate::notifier::Notifier`] instead of the
//! original's direct signal/slot wiring into `LocalStorageManagerPrivate`;
//! [`resolver`] and [`expunger`] call the handlers directly since every
//! lookup they need already resolves in one `await`.

pub mod cache;
pub mod expunger;
pub mod resolver;
