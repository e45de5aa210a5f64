//! Saved search CRUD (spec.md §3 Saved Searches, §4.4).

use rusqlite::{params, Connection};

use crate::error::{Result, StorageError};
use crate::handlers::{conflict_on_unique_violation, read, HandlerContext};
use crate::models::SavedSearch;
use crate::notifier::StorageEvent;

fn row_to_saved_search(row: &rusqlite::Row) -> rusqlite::Result<SavedSearch> {
    Ok(SavedSearch {
        local_id: row.get("localId")?,
        guid: row.get("guid")?,
        update_sequence_number: row.get("updateSequenceNumber")?,
        name: row.get("name")?,
        query: row.get("query")?,
        is_locally_modified: row.get("isLocallyModified")?,
        is_local_only: row.get("isLocalOnly")?,
    })
}

const SELECT_COLUMNS: &str =
    "localId, guid, updateSequenceNumber, name, query, isLocallyModified, isLocalOnly";

#[derive(Clone)]
pub struct SavedSearchHandler {
    ctx: HandlerContext,
}

impl SavedSearchHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub async fn put(&self, saved_search: SavedSearch) -> Result<SavedSearch> {
        let name_lower = saved_search.name.to_lowercase();
        let notifier = self.ctx.notifier.clone();

        let result = self
            .ctx
            .writer
            .submit(move |conn| {
                conn.execute(
                    "INSERT INTO SavedSearches (
                         localId, guid, updateSequenceNumber, name, nameLower, query,
                         isLocallyModified, isLocalOnly
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                     ON CONFLICT(localId) DO UPDATE SET
                         guid = excluded.guid,
                         updateSequenceNumber = excluded.updateSequenceNumber,
                         name = excluded.name,
                         nameLower = excluded.nameLower,
                         query = excluded.query,
                         isLocallyModified = excluded.isLocallyModified,
                         isLocalOnly = excluded.isLocalOnly",
                    params![
                        saved_search.local_id,
                        saved_search.guid,
                        saved_search.update_sequence_number,
                        saved_search.name,
                        name_lower,
                        saved_search.query,
                        saved_search.is_locally_modified,
                        saved_search.is_local_only,
                    ],
                )?;
                Ok(saved_search)
            })
            .await
            .map_err(|e| {
                conflict_on_unique_violation(e, "a saved search with this name already exists")
            })?;

        notifier.publish(StorageEvent::SavedSearchPut(result.clone()));
        Ok(result)
    }

    pub async fn find_by_local_id(&self, local_id: &str) -> Result<Option<SavedSearch>> {
        let local_id = local_id.to_string();
        read(self.ctx.pool.clone(), move |conn| find_by(conn, "localId", &local_id)).await
    }

    pub async fn find_by_guid(&self, guid: &str) -> Result<Option<SavedSearch>> {
        let guid = guid.to_string();
        read(self.ctx.pool.clone(), move |conn| find_by(conn, "guid", &guid)).await
    }

    /// Case-insensitive name lookup (matching the
    /// `SavedSearchNameUpperIndex` uniqueness scope, which is global:
    /// saved searches have no linked-notebook scope). Used by sync
    /// conflict resolution (spec.md §4.5).
    pub async fn find_by_name(&self, name: &str) -> Result<Option<SavedSearch>> {
        let name_lower = name.to_lowercase();
        read(self.ctx.pool.clone(), move |conn| {
            let query = format!("SELECT {SELECT_COLUMNS} FROM SavedSearches WHERE nameLower = ?1");
            match conn.query_row(&query, params![name_lower], row_to_saved_search) {
                Ok(search) => Ok(Some(search)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(other) => Err(other.into()),
            }
        })
        .await
    }

    pub async fn expunge_by_local_id(&self, local_id: &str) -> Result<()> {
        let local_id = local_id.to_string();
        let notifier = self.ctx.notifier.clone();
        self.ctx
            .writer
            .submit(move |conn| {
                conn.execute("DELETE FROM SavedSearches WHERE localId = ?1", params![local_id])?;
                Ok(local_id)
            })
            .await
            .map(|local_id| notifier.publish(StorageEvent::SavedSearchExpunged(local_id)))
    }

    pub async fn expunge_by_guid(&self, guid: &str) -> Result<()> {
        let local_id = self
            .find_by_guid(guid)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("saved search with guid {guid} not found")))?
            .local_id;
        self.expunge_by_local_id(&local_id).await
    }

    pub async fn count(&self) -> Result<i64> {
        read(self.ctx.pool.clone(), |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM SavedSearches", [], |r| r.get(0))?)
        })
        .await
    }

    /// Lists every saved search. Saved searches have no linked-notebook
    /// scope. Used to fill a `SavedSearchSyncCache` and by the stale-item
    /// expunger (spec.md §4.5/§4.6).
    pub async fn list_all(&self) -> Result<Vec<SavedSearch>> {
        read(self.ctx.pool.clone(), |conn| {
            let query = format!("SELECT {SELECT_COLUMNS} FROM SavedSearches");
            let mut statement = conn.prepare(&query)?;
            let rows = statement.query_map([], row_to_saved_search)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// One page of every saved search, ordered by localId for a stable
    /// cursor. Used by `SavedSearchSyncCache::fill` (spec.md §4.5), which
    /// pages until a page comes back shorter than `limit`.
    pub async fn list_page(&self, offset: i64, limit: i64) -> Result<Vec<SavedSearch>> {
        read(self.ctx.pool.clone(), move |conn| {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM SavedSearches ORDER BY localId LIMIT ?1 OFFSET ?2"
            );
            let mut statement = conn.prepare(&query)?;
            let rows = statement.query_map(params![limit, offset], row_to_saved_search)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

fn find_by(connection: &Connection, column: &str, value: &str) -> Result<Option<SavedSearch>> {
    let query = format!("SELECT {SELECT_COLUMNS} FROM SavedSearches WHERE {column} = ?1");
    match connection.query_row(&query, params![value], row_to_saved_search) {
        Ok(saved_search) => Ok(Some(saved_search)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(other) => Err(other.into()),
    }
}
