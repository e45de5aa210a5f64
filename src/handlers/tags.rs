//! Tag CRUD (spec.md §3 Tags, §4.4).

use rusqlite::{params, Connection};

use crate::error::{Result, StorageError};
use crate::handlers::{conflict_on_unique_violation, read, HandlerContext};
use crate::models::Tag;
use crate::notifier::StorageEvent;

fn row_to_tag(row: &rusqlite::Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        local_id: row.get("localId")?,
        guid: row.get("guid")?,
        update_sequence_number: row.get("updateSequenceNumber")?,
        linked_notebook_guid: row.get("linkedNotebookGuid")?,
        name: row.get("name")?,
        parent_tag_local_id: row.get("parentTagLocalId")?,
        parent_guid: row.get("parentGuid")?,
        is_locally_modified: row.get("isLocallyModified")?,
        is_local_only: row.get("isLocalOnly")?,
    })
}

const SELECT_COLUMNS: &str = "localId, guid, linkedNotebookGuid, updateSequenceNumber, name, \
     parentTagLocalId, parentGuid, isLocallyModified, isLocalOnly";

#[derive(Clone)]
pub struct TagHandler {
    ctx: HandlerContext,
}

impl TagHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub async fn put(&self, tag: Tag) -> Result<Tag> {
        let name_lower = tag.name.to_lowercase();
        let notifier = self.ctx.notifier.clone();

        let result = self
            .ctx
            .writer
            .submit(move |conn| {
                conn.execute(
                    "INSERT INTO Tags (
                         localId, guid, linkedNotebookGuid, updateSequenceNumber, name,
                         nameLower, parentTagLocalId, parentGuid, isLocallyModified, isLocalOnly
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                     ON CONFLICT(localId) DO UPDATE SET
                         guid = excluded.guid,
                         linkedNotebookGuid = excluded.linkedNotebookGuid,
                         updateSequenceNumber = excluded.updateSequenceNumber,
                         name = excluded.name,
                         nameLower = excluded.nameLower,
                         parentTagLocalId = excluded.parentTagLocalId,
                         parentGuid = excluded.parentGuid,
                         isLocallyModified = excluded.isLocallyModified,
                         isLocalOnly = excluded.isLocalOnly",
                    params![
                        tag.local_id,
                        tag.guid,
                        tag.linked_notebook_guid,
                        tag.update_sequence_number,
                        tag.name,
                        name_lower,
                        tag.parent_tag_local_id,
                        tag.parent_guid,
                        tag.is_locally_modified,
                        tag.is_local_only,
                    ],
                )?;
                Ok(tag)
            })
            .await
            .map_err(|e| conflict_on_unique_violation(e, "a tag with this name already exists in this scope"))?;

        notifier.publish(StorageEvent::TagPut(result.clone()));
        Ok(result)
    }

    pub async fn find_by_local_id(&self, local_id: &str) -> Result<Option<Tag>> {
        let local_id = local_id.to_string();
        read(self.ctx.pool.clone(), move |conn| find_by(conn, "localId", &local_id)).await
    }

    pub async fn find_by_guid(&self, guid: &str) -> Result<Option<Tag>> {
        let guid = guid.to_string();
        read(self.ctx.pool.clone(), move |conn| find_by(conn, "guid", &guid)).await
    }

    /// Case-insensitive name lookup scoped to `linked_notebook_guid`
    /// (matching the `TagNameUpperIndex` uniqueness scope). Used by sync
    /// conflict resolution (spec.md §4.5).
    pub async fn find_by_name(&self, name: &str, linked_notebook_guid: Option<&str>) -> Result<Option<Tag>> {
        let name_lower = name.to_lowercase();
        let linked_notebook_guid = linked_notebook_guid.map(str::to_string);
        read(self.ctx.pool.clone(), move |conn| {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM Tags WHERE nameLower = ?1 AND linkedNotebookGuid IS ?2"
            );
            match conn.query_row(&query, params![name_lower, linked_notebook_guid], row_to_tag) {
                Ok(tag) => Ok(Some(tag)),
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
                conn.execute("DELETE FROM Tags WHERE localId = ?1", params![local_id])?;
                Ok(local_id)
            })
            .await
            .map(|local_id| notifier.publish(StorageEvent::TagExpunged(local_id)))
    }

    pub async fn expunge_by_guid(&self, guid: &str) -> Result<()> {
        let local_id = self
            .find_by_guid(guid)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("tag with guid {guid} not found")))?
            .local_id;
        self.expunge_by_local_id(&local_id).await
    }

    pub async fn count(&self) -> Result<i64> {
        read(self.ctx.pool.clone(), |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM Tags", [], |r| r.get(0))?)
        })
        .await
    }

    /// Lists every tag in `linked_notebook_guid`'s scope (`None` for the
    /// user's own account). Used to fill a `TagSyncCache` and by the
    /// stale-item expunger (spec.md §4.5/§4.6).
    pub async fn list_by_linked_notebook_guid(
        &self,
        linked_notebook_guid: Option<&str>,
    ) -> Result<Vec<Tag>> {
        let linked_notebook_guid = linked_notebook_guid.map(str::to_string);
        read(self.ctx.pool.clone(), move |conn| {
            let query = format!("SELECT {SELECT_COLUMNS} FROM Tags WHERE linkedNotebookGuid IS ?1");
            let mut statement = conn.prepare(&query)?;
            let rows = statement.query_map(params![linked_notebook_guid], row_to_tag)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// One page of `linked_notebook_guid`'s scope, ordered by localId for a
    /// stable cursor. Used by `TagSyncCache::fill` (spec.md §4.5), which
    /// pages until a page comes back shorter than `limit`.
    pub async fn list_page(
        &self,
        linked_notebook_guid: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Tag>> {
        let linked_notebook_guid = linked_notebook_guid.map(str::to_string);
        read(self.ctx.pool.clone(), move |conn| {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM Tags WHERE linkedNotebookGuid IS ?1 \
                 ORDER BY localId LIMIT ?2 OFFSET ?3"
            );
            let mut statement = conn.prepare(&query)?;
            let rows = statement.query_map(params![linked_notebook_guid, limit, offset], row_to_tag)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

fn find_by(connection: &Connection, column: &str, value: &str) -> Result<Option<Tag>> {
    let query = format!("SELECT {SELECT_COLUMNS} FROM Tags WHERE {column} = ?1");
    match connection.query_row(&query, params![value], row_to_tag) {
        Ok(tag) => Ok(Some(tag)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(other) => Err(other.into()),
    }
}
