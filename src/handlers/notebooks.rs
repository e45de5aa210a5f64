//! Notebook CRUD (spec.md §3 Notebooks, §4.4).

use std::sync::Arc;

use rusqlite::{params, Connection};

use crate::error::{Result, StorageError};
use crate::handlers::{conflict_on_unique_violation, read, HandlerContext};
use crate::models::Notebook;
use crate::notifier::StorageEvent;

fn row_to_notebook(row: &rusqlite::Row) -> rusqlite::Result<Notebook> {
    Ok(Notebook {
        local_id: row.get("localId")?,
        guid: row.get("guid")?,
        update_sequence_number: row.get("updateSequenceNumber")?,
        linked_notebook_guid: row.get("linkedNotebookGuid")?,
        name: row.get("name")?,
        is_default: row.get("isDefault")?,
        is_last_used: row.get("isLastUsed")?,
        stack: row.get("stack")?,
        is_locally_modified: row.get("isLocallyModified")?,
        is_local_only: row.get("isLocalOnly")?,
        created_at: row.get("createdAt")?,
        updated_at: row.get("updatedAt")?,
    })
}

const SELECT_COLUMNS: &str = "localId, guid, linkedNotebookGuid, updateSequenceNumber, name, \
     isDefault, isLastUsed, stack, isLocallyModified, isLocalOnly, createdAt, updatedAt";

#[derive(Clone)]
pub struct NotebookHandler {
    ctx: HandlerContext,
}

impl NotebookHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub async fn put(&self, notebook: Notebook) -> Result<Notebook> {
        let name_lower = notebook.name.to_lowercase();
        let notifier = self.ctx.notifier.clone();

        let result = self
            .ctx
            .writer
            .submit(move |conn| {
                conn.execute(
                    "INSERT INTO Notebooks (
                         localId, guid, linkedNotebookGuid, updateSequenceNumber, name,
                         nameLower, isDefault, isLastUsed, stack, isLocallyModified,
                         isLocalOnly, createdAt, updatedAt
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(localId) DO UPDATE SET
                         guid = excluded.guid,
                         linkedNotebookGuid = excluded.linkedNotebookGuid,
                         updateSequenceNumber = excluded.updateSequenceNumber,
                         name = excluded.name,
                         nameLower = excluded.nameLower,
                         isDefault = excluded.isDefault,
                         isLastUsed = excluded.isLastUsed,
                         stack = excluded.stack,
                         isLocallyModified = excluded.isLocallyModified,
                         isLocalOnly = excluded.isLocalOnly,
                         updatedAt = excluded.updatedAt",
                    params![
                        notebook.local_id,
                        notebook.guid,
                        notebook.linked_notebook_guid,
                        notebook.update_sequence_number,
                        notebook.name,
                        name_lower,
                        notebook.is_default,
                        notebook.is_last_used,
                        notebook.stack,
                        notebook.is_locally_modified,
                        notebook.is_local_only,
                        notebook.created_at,
                        notebook.updated_at,
                    ],
                )?;
                Ok(notebook)
            })
            .await
            .map_err(|e| {
                conflict_on_unique_violation(
                    e,
                    "a notebook with this name already exists in this scope",
                )
            })?;

        notifier.publish(StorageEvent::NotebookPut(result.clone()));
        Ok(result)
    }

    pub async fn find_by_local_id(&self, local_id: &str) -> Result<Option<Notebook>> {
        let local_id = local_id.to_string();
        read(self.ctx.pool.clone(), move |conn| find_by(conn, "localId", &local_id)).await
    }

    pub async fn find_by_guid(&self, guid: &str) -> Result<Option<Notebook>> {
        let guid = guid.to_string();
        read(self.ctx.pool.clone(), move |conn| find_by(conn, "guid", &guid)).await
    }

    /// Case-insensitive name lookup scoped to `linked_notebook_guid`
    /// (matching the `NotebookNameUpperIndex` uniqueness scope). Used by
    /// sync conflict resolution (spec.md §4.5).
    pub async fn find_by_name(
        &self,
        name: &str,
        linked_notebook_guid: Option<&str>,
    ) -> Result<Option<Notebook>> {
        let name_lower = name.to_lowercase();
        let linked_notebook_guid = linked_notebook_guid.map(str::to_string);
        read(self.ctx.pool.clone(), move |conn| {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM Notebooks \
                 WHERE nameLower = ?1 AND linkedNotebookGuid IS ?2"
            );
            match conn.query_row(&query, params![name_lower, linked_notebook_guid], row_to_notebook) {
                Ok(notebook) => Ok(Some(notebook)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(other) => Err(other.into()),
            }
        })
        .await
    }

    pub async fn expunge_by_local_id(&self, local_id: &str) -> Result<()> {
        let local_id = local_id.to_string();
        let notifier = self.ctx.notifier.clone();
        let resource_body = Arc::clone(&self.ctx.resource_body);
        self.ctx
            .writer
            .submit(move |conn| {
                let affected_resources = cascaded_resources_for_notebook(conn, &local_id)?;
                conn.execute("DELETE FROM Notebooks WHERE localId = ?1", params![local_id])?;
                for (note_local_id, resource_local_id) in affected_resources {
                    resource_body.delete_all_for_resource(&note_local_id, &resource_local_id);
                }
                Ok(local_id)
            })
            .await
            .map(|local_id| notifier.publish(StorageEvent::NotebookExpunged(local_id)))
    }

    pub async fn expunge_by_guid(&self, guid: &str) -> Result<()> {
        let local_id = self
            .find_by_guid(guid)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("notebook with guid {guid} not found")))?
            .local_id;
        self.expunge_by_local_id(&local_id).await
    }

    pub async fn count(&self) -> Result<i64> {
        read(self.ctx.pool.clone(), |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM Notebooks", [], |r| r.get(0))?)
        })
        .await
    }

    /// Lists every notebook in `linked_notebook_guid`'s scope (`None` for
    /// the user's own account). Used to fill a `NotebookSyncCache` and by
    /// the stale-item expunger (spec.md §4.5/§4.6).
    pub async fn list_by_linked_notebook_guid(
        &self,
        linked_notebook_guid: Option<&str>,
    ) -> Result<Vec<Notebook>> {
        let linked_notebook_guid = linked_notebook_guid.map(str::to_string);
        read(self.ctx.pool.clone(), move |conn| {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM Notebooks WHERE linkedNotebookGuid IS ?1"
            );
            let mut statement = conn.prepare(&query)?;
            let rows = statement.query_map(params![linked_notebook_guid], row_to_notebook)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    /// One page of `linked_notebook_guid`'s scope, ordered by localId for a
    /// stable cursor. Used by `NotebookSyncCache::fill` (spec.md §4.5),
    /// which pages until a page comes back shorter than `limit`.
    pub async fn list_page(
        &self,
        linked_notebook_guid: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Notebook>> {
        let linked_notebook_guid = linked_notebook_guid.map(str::to_string);
        read(self.ctx.pool.clone(), move |conn| {
            let query = format!(
                "SELECT {SELECT_COLUMNS} FROM Notebooks WHERE linkedNotebookGuid IS ?1 \
                 ORDER BY localId LIMIT ?2 OFFSET ?3"
            );
            let mut statement = conn.prepare(&query)?;
            let rows = statement.query_map(params![linked_notebook_guid, limit, offset], row_to_notebook)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

fn find_by(connection: &Connection, column: &str, value: &str) -> Result<Option<Notebook>> {
    let query = format!("SELECT {SELECT_COLUMNS} FROM Notebooks WHERE {column} = ?1");
    match connection.query_row(&query, params![value], row_to_notebook) {
        Ok(notebook) => Ok(Some(notebook)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(other) => Err(other.into()),
    }
}

/// Resources that the FK cascade is about to delete along with this
/// notebook's notes, queried before the delete so their on-disk bodies can
/// be removed afterward (spec.md §4.4).
fn cascaded_resources_for_notebook(
    connection: &Connection,
    notebook_local_id: &str,
) -> Result<Vec<(String, String)>> {
    let mut statement = connection.prepare(
        "SELECT r.noteLocalId, r.localId FROM Resources r \
         JOIN Notes n ON n.localId = r.noteLocalId \
         WHERE n.notebookLocalId = ?1",
    )?;
    let rows = statement.query_map(params![notebook_local_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::notifier::Notifier;
    use crate::pool::ConnectionPool;
    use crate::resource_body::ResourceBodyStore;
    use crate::schema::TablesInitializer;
    use crate::writer::Writer;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn handler_in(dir: &TempDir) -> NotebookHandler {
        let config = EngineConfig::sqlite_at(dir.path());
        let pool = ConnectionPool::new(&config).unwrap();
        {
            let conn = pool.database().unwrap();
            let conn = conn.lock().unwrap();
            TablesInitializer::init_all(&conn).unwrap();
        }
        let writer = Writer::spawn(Arc::clone(&pool)).unwrap();
        let ctx = HandlerContext {
            pool,
            writer,
            notifier: Arc::new(Notifier::default()),
            resource_body: Arc::new(ResourceBodyStore::new(&config)),
        };
        NotebookHandler::new(ctx)
    }

    #[tokio::test]
    async fn put_then_find_by_local_id_round_trips() {
        let dir = TempDir::new().unwrap();
        let handler = handler_in(&dir);

        let notebook = Notebook::new("Inbox");
        handler.put(notebook.clone()).await.unwrap();

        let found = handler.find_by_local_id(&notebook.local_id).await.unwrap().unwrap();
        assert_eq!(found.name, "Inbox");
    }

    #[tokio::test]
    async fn duplicate_name_in_the_same_scope_is_a_conflict() {
        let dir = TempDir::new().unwrap();
        let handler = handler_in(&dir);

        handler.put(Notebook::new("Inbox")).await.unwrap();
        let result = handler.put(Notebook::new("inbox")).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn expunge_by_local_id_removes_the_row() {
        let dir = TempDir::new().unwrap();
        let handler = handler_in(&dir);

        let notebook = Notebook::new("Inbox");
        handler.put(notebook.clone()).await.unwrap();
        handler.expunge_by_local_id(&notebook.local_id).await.unwrap();

        assert!(handler.find_by_local_id(&notebook.local_id).await.unwrap().is_none());
        assert_eq!(handler.count().await.unwrap(), 0);
    }

    /// Expunging a notebook FK-cascades away its notes' resources; the
    /// resource body files backing them must disappear too (spec.md §4.4,
    /// P5), not just the rows.
    #[tokio::test]
    async fn expunge_by_local_id_removes_cascaded_resource_body_files() {
        use crate::handlers::notes::NoteHandler;
        use crate::handlers::resources::ResourceHandler;
        use crate::models::{Note, Resource, ResourceDataRef};

        let dir = TempDir::new().unwrap();
        let config = EngineConfig::sqlite_at(dir.path());
        let pool = ConnectionPool::new(&config).unwrap();
        {
            let conn = pool.database().unwrap();
            let conn = conn.lock().unwrap();
            TablesInitializer::init_all(&conn).unwrap();
        }
        let writer = Writer::spawn(Arc::clone(&pool)).unwrap();
        let ctx = HandlerContext {
            pool,
            writer,
            notifier: Arc::new(Notifier::default()),
            resource_body: Arc::new(ResourceBodyStore::new(&config)),
        };

        let notebook_handler = NotebookHandler::new(ctx.clone());
        let note_handler = NoteHandler::new(ctx.clone());
        let resource_handler = ResourceHandler::new(ctx.clone());

        let notebook = notebook_handler.put(Notebook::new("Work")).await.unwrap();
        let note = note_handler.put(Note::new(notebook.local_id.clone())).await.unwrap();
        let mut resource = Resource::new(note.local_id.clone());
        resource.data = Some(ResourceDataRef { hash: vec![1], size: 5, body: Some(b"hello".to_vec()) });
        let resource = resource_handler.put(resource).await.unwrap();

        let body_dir = config.resources_data_dir().join(&note.local_id).join(&resource.local_id);
        assert!(body_dir.exists());

        notebook_handler.expunge_by_local_id(&notebook.local_id).await.unwrap();

        assert!(!body_dir.exists());
    }
}
