//! Note CRUD, including the `NoteTags` junction table (spec.md §3 Notes,
//! §4.4).

use std::sync::Arc;

use rusqlite::{params, Connection};

use crate::error::{Result, StorageError};
use crate::handlers::{conflict_on_unique_violation, in_transaction, read, HandlerContext};
use crate::models::Note;
use crate::notifier::StorageEvent;

fn row_to_note(row: &rusqlite::Row) -> rusqlite::Result<Note> {
    Ok(Note {
        local_id: row.get("localId")?,
        guid: row.get("guid")?,
        update_sequence_number: row.get("updateSequenceNumber")?,
        notebook_local_id: row.get("notebookLocalId")?,
        notebook_guid: row.get("notebookGuid")?,
        title: row.get("title")?,
        content: row.get("content")?,
        content_hash: row.get("contentHash")?,
        content_length: row.get("contentLength")?,
        tag_local_ids: Vec::new(),
        tag_guids: Vec::new(),
        is_locally_modified: row.get("isLocallyModified")?,
        is_local_only: row.get("isLocalOnly")?,
        created_at: row.get("createdAt")?,
        updated_at: row.get("updatedAt")?,
    })
}

const SELECT_COLUMNS: &str = "localId, guid, notebookLocalId, notebookGuid, updateSequenceNumber, \
     title, content, contentHash, contentLength, isLocallyModified, isLocalOnly, createdAt, updatedAt";

#[derive(Clone)]
pub struct NoteHandler {
    ctx: HandlerContext,
}

impl NoteHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub async fn put(&self, note: Note) -> Result<Note> {
        let notifier = self.ctx.notifier.clone();

        let result = self
            .ctx
            .writer
            .submit(move |conn| {
                in_transaction(conn, |conn| {
                    conn.execute(
                        "INSERT INTO Notes (
                             localId, guid, notebookLocalId, notebookGuid, updateSequenceNumber,
                             title, content, contentHash, contentLength, isLocallyModified,
                             isLocalOnly, createdAt, updatedAt
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                         ON CONFLICT(localId) DO UPDATE SET
                             guid = excluded.guid,
                             notebookLocalId = excluded.notebookLocalId,
                             notebookGuid = excluded.notebookGuid,
                             updateSequenceNumber = excluded.updateSequenceNumber,
                             title = excluded.title,
                             content = excluded.content,
                             contentHash = excluded.contentHash,
                             contentLength = excluded.contentLength,
                             isLocallyModified = excluded.isLocallyModified,
                             isLocalOnly = excluded.isLocalOnly,
                             updatedAt = excluded.updatedAt",
                        params![
                            note.local_id,
                            note.guid,
                            note.notebook_local_id,
                            note.notebook_guid,
                            note.update_sequence_number,
                            note.title,
                            note.content,
                            note.content_hash,
                            note.content_length,
                            note.is_locally_modified,
                            note.is_local_only,
                            note.created_at,
                            note.updated_at,
                        ],
                    )?;

                    conn.execute(
                        "DELETE FROM NoteTags WHERE noteLocalId = ?1",
                        params![note.local_id],
                    )?;
                    for (index, tag_local_id) in note.tag_local_ids.iter().enumerate() {
                        conn.execute(
                            "INSERT INTO NoteTags (noteLocalId, tagLocalId, tagGuid, tagIndexInNote)
                             VALUES (?1, ?2, ?3, ?4)",
                            params![
                                note.local_id,
                                tag_local_id,
                                note.tag_guids.get(index),
                                index as i64,
                            ],
                        )?;
                    }

                    Ok(note)
                })
            })
            .await
            .map_err(|e| conflict_on_unique_violation(e, "a note with this guid already exists"))?;

        notifier.publish(StorageEvent::NotePut(result.clone()));
        Ok(result)
    }

    pub async fn find_by_local_id(&self, local_id: &str) -> Result<Option<Note>> {
        let local_id = local_id.to_string();
        read(self.ctx.pool.clone(), move |conn| find_by(conn, "localId", &local_id)).await
    }

    pub async fn find_by_guid(&self, guid: &str) -> Result<Option<Note>> {
        let guid = guid.to_string();
        read(self.ctx.pool.clone(), move |conn| find_by(conn, "guid", &guid)).await
    }

    pub async fn expunge_by_local_id(&self, local_id: &str) -> Result<()> {
        let local_id = local_id.to_string();
        let notifier = self.ctx.notifier.clone();
        let resource_body = Arc::clone(&self.ctx.resource_body);
        self.ctx
            .writer
            .submit(move |conn| {
                let affected_resources = cascaded_resources_for_note(conn, &local_id)?;
                conn.execute("DELETE FROM Notes WHERE localId = ?1", params![local_id])?;
                for resource_local_id in affected_resources {
                    resource_body.delete_all_for_resource(&local_id, &resource_local_id);
                }
                Ok(local_id)
            })
            .await
            .map(|local_id| notifier.publish(StorageEvent::NoteExpunged(local_id)))
    }

    pub async fn expunge_by_guid(&self, guid: &str) -> Result<()> {
        let local_id = self
            .find_by_guid(guid)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("note with guid {guid} not found")))?
            .local_id;
        self.expunge_by_local_id(&local_id).await
    }

    pub async fn count(&self) -> Result<i64> {
        read(self.ctx.pool.clone(), |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM Notes", [], |r| r.get(0))?)
        })
        .await
    }

    /// Lists every note whose owning notebook is in `linked_notebook_guid`'s
    /// scope (`None` for the user's own account). Tag associations are not
    /// hydrated; used by the stale-item expunger (spec.md §4.6), which only
    /// needs guid/notebook-guid/dirty-flag bookkeeping.
    pub async fn list_by_linked_notebook_guid(
        &self,
        linked_notebook_guid: Option<&str>,
    ) -> Result<Vec<Note>> {
        let linked_notebook_guid = linked_notebook_guid.map(str::to_string);
        read(self.ctx.pool.clone(), move |conn| {
            let mut statement = conn.prepare(
                "SELECT n.localId, n.guid, n.notebookLocalId, n.notebookGuid, \
                        n.updateSequenceNumber, n.title, n.content, n.contentHash, \
                        n.contentLength, n.isLocallyModified, n.isLocalOnly, n.createdAt, \
                        n.updatedAt \
                 FROM Notes n \
                 JOIN Notebooks b ON b.localId = n.notebookLocalId \
                 WHERE b.linkedNotebookGuid IS ?1",
            )?;
            let rows = statement.query_map(params![linked_notebook_guid], row_to_note)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    pub async fn count_per_notebook(&self, notebook_local_id: &str) -> Result<i64> {
        let notebook_local_id = notebook_local_id.to_string();
        read(self.ctx.pool.clone(), move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM Notes WHERE notebookLocalId = ?1",
                params![notebook_local_id],
                |r| r.get(0),
            )?)
        })
        .await
    }

    /// One page of `linked_notebook_guid`'s scope, ordered by localId for a
    /// stable cursor. Tag associations are not hydrated, matching
    /// `list_by_linked_notebook_guid`. Used by `NoteSyncCache::fill`
    /// (spec.md §4.5), which pages until a page comes back shorter than
    /// `limit`.
    pub async fn list_page(
        &self,
        linked_notebook_guid: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Note>> {
        let linked_notebook_guid = linked_notebook_guid.map(str::to_string);
        read(self.ctx.pool.clone(), move |conn| {
            let mut statement = conn.prepare(
                "SELECT n.localId, n.guid, n.notebookLocalId, n.notebookGuid, \
                        n.updateSequenceNumber, n.title, n.content, n.contentHash, \
                        n.contentLength, n.isLocallyModified, n.isLocalOnly, n.createdAt, \
                        n.updatedAt \
                 FROM Notes n \
                 JOIN Notebooks b ON b.localId = n.notebookLocalId \
                 WHERE b.linkedNotebookGuid IS ?1 \
                 ORDER BY n.localId LIMIT ?2 OFFSET ?3",
            )?;
            let rows = statement.query_map(params![linked_notebook_guid, limit, offset], row_to_note)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

/// Resources the FK cascade is about to delete along with this note,
/// queried before the delete so their on-disk bodies can be removed
/// afterward (spec.md §4.4).
fn cascaded_resources_for_note(connection: &Connection, note_local_id: &str) -> Result<Vec<String>> {
    let mut statement = connection.prepare("SELECT localId FROM Resources WHERE noteLocalId = ?1")?;
    let rows = statement.query_map(params![note_local_id], |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn find_by(connection: &Connection, column: &str, value: &str) -> Result<Option<Note>> {
    let query = format!("SELECT {SELECT_COLUMNS} FROM Notes WHERE {column} = ?1");
    let mut note = match connection.query_row(&query, params![value], row_to_note) {
        Ok(note) => note,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(other) => return Err(other.into()),
    };
    let (tag_local_ids, tag_guids) = load_tag_associations(connection, &note.local_id)?;
    note.tag_local_ids = tag_local_ids;
    note.tag_guids = tag_guids;
    Ok(Some(note))
}

fn load_tag_associations(connection: &Connection, note_local_id: &str) -> Result<(Vec<String>, Vec<String>)> {
    let mut statement = connection.prepare(
        "SELECT tagLocalId, tagGuid FROM NoteTags WHERE noteLocalId = ?1 ORDER BY tagIndexInNote",
    )?;
    let rows = statement.query_map(params![note_local_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?;

    let mut tag_local_ids = Vec::new();
    let mut tag_guids = Vec::new();
    for row in rows {
        let (tag_local_id, tag_guid) = row?;
        tag_local_ids.push(tag_local_id);
        if let Some(guid) = tag_guid {
            tag_guids.push(guid);
        }
    }
    Ok((tag_local_ids, tag_guids))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::handlers::notebooks::NotebookHandler;
    use crate::handlers::tags::TagHandler;
    use crate::models::{Notebook, Tag};
    use crate::notifier::Notifier;
    use crate::pool::ConnectionPool;
    use crate::resource_body::ResourceBodyStore;
    use crate::schema::TablesInitializer;
    use crate::writer::Writer;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn ctx_in(dir: &TempDir) -> HandlerContext {
        let config = EngineConfig::sqlite_at(dir.path());
        let pool = ConnectionPool::new(&config).unwrap();
        {
            let conn = pool.database().unwrap();
            let conn = conn.lock().unwrap();
            TablesInitializer::init_all(&conn).unwrap();
        }
        let writer = Writer::spawn(Arc::clone(&pool)).unwrap();
        HandlerContext {
            pool,
            writer,
            notifier: Arc::new(Notifier::default()),
            resource_body: Arc::new(ResourceBodyStore::new(&config)),
        }
    }

    #[tokio::test]
    async fn put_then_find_round_trips_tag_associations_in_order() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);

        let notebook = Notebook::new("Inbox");
        NotebookHandler::new(ctx.clone()).put(notebook.clone()).await.unwrap();

        let tag_handler = TagHandler::new(ctx.clone());
        let first_tag = tag_handler.put(Tag::new("first")).await.unwrap();
        let second_tag = tag_handler.put(Tag::new("second")).await.unwrap();

        let note_handler = NoteHandler::new(ctx);
        let mut note = Note::new(notebook.local_id.clone());
        note.title = Some("Shopping list".to_string());
        note.tag_local_ids = vec![first_tag.local_id.clone(), second_tag.local_id.clone()];
        note_handler.put(note.clone()).await.unwrap();

        let found = note_handler.find_by_local_id(&note.local_id).await.unwrap().unwrap();
        assert_eq!(found.title.as_deref(), Some("Shopping list"));
        assert_eq!(found.tag_local_ids, vec![first_tag.local_id, second_tag.local_id]);
    }

    #[tokio::test]
    async fn putting_again_replaces_the_tag_set() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);

        let notebook = Notebook::new("Inbox");
        NotebookHandler::new(ctx.clone()).put(notebook.clone()).await.unwrap();

        let tag_handler = TagHandler::new(ctx.clone());
        let tag = tag_handler.put(Tag::new("keep")).await.unwrap();
        let dropped = tag_handler.put(Tag::new("drop")).await.unwrap();

        let note_handler = NoteHandler::new(ctx);
        let mut note = Note::new(notebook.local_id.clone());
        note.tag_local_ids = vec![dropped.local_id.clone()];
        note_handler.put(note.clone()).await.unwrap();

        note.tag_local_ids = vec![tag.local_id.clone()];
        note_handler.put(note.clone()).await.unwrap();

        let found = note_handler.find_by_local_id(&note.local_id).await.unwrap().unwrap();
        assert_eq!(found.tag_local_ids, vec![tag.local_id]);
    }

    #[tokio::test]
    async fn expunge_by_local_id_removes_the_row() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);

        let notebook = Notebook::new("Inbox");
        NotebookHandler::new(ctx.clone()).put(notebook.clone()).await.unwrap();

        let note_handler = NoteHandler::new(ctx);
        let note = Note::new(notebook.local_id.clone());
        note_handler.put(note.clone()).await.unwrap();

        note_handler.expunge_by_local_id(&note.local_id).await.unwrap();
        assert!(note_handler.find_by_local_id(&note.local_id).await.unwrap().is_none());
        assert_eq!(note_handler.count_per_notebook(&notebook.local_id).await.unwrap(), 0);
    }

    /// Expunging a note FK-cascades away its resources; the resource body
    /// files backing them must disappear too (spec.md §4.4, P5).
    #[tokio::test]
    async fn expunge_by_local_id_removes_cascaded_resource_body_files() {
        use crate::handlers::resources::ResourceHandler;
        use crate::models::{Resource, ResourceDataRef};

        let dir = TempDir::new().unwrap();
        let config = EngineConfig::sqlite_at(dir.path());
        let ctx = ctx_in(&dir);

        let notebook = Notebook::new("Inbox");
        NotebookHandler::new(ctx.clone()).put(notebook.clone()).await.unwrap();

        let note_handler = NoteHandler::new(ctx.clone());
        let note = note_handler.put(Note::new(notebook.local_id.clone())).await.unwrap();

        let resource_handler = ResourceHandler::new(ctx);
        let mut resource = Resource::new(note.local_id.clone());
        resource.data = Some(ResourceDataRef { hash: vec![1], size: 5, body: Some(b"hello".to_vec()) });
        let resource = resource_handler.put(resource).await.unwrap();

        let body_dir = config.resources_data_dir().join(&note.local_id).join(&resource.local_id);
        assert!(body_dir.exists());

        note_handler.expunge_by_local_id(&note.local_id).await.unwrap();

        assert!(!body_dir.exists());
    }
}
