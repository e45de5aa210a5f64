//! Resource CRUD, including binary-body staging through `ResourceBodyStore`
//! (spec.md §3 Resources, §4.3, §4.4).

use std::sync::Arc;

use rusqlite::{params, Connection};

use crate::error::{Result, StorageError};
use crate::handlers::{conflict_on_unique_violation, in_transaction, read, HandlerContext};
use crate::models::{FetchOptions, Resource, ResourceDataRef};
use crate::notifier::StorageEvent;
use crate::resource_body::{BodyKind, ResourceBodyStore};

const SELECT_COLUMNS: &str = "localId, guid, noteLocalId, noteGuid, updateSequenceNumber, mime, \
     width, height, dataHash, dataSize, alternateDataHash, alternateDataSize, recognitionHash, \
     recognitionSize, recognitionBody, isLocallyModified, indexInNote";

fn row_to_resource(row: &rusqlite::Row) -> rusqlite::Result<Resource> {
    let data_hash: Option<Vec<u8>> = row.get("dataHash")?;
    let data_size: Option<i64> = row.get("dataSize")?;
    let alternate_hash: Option<Vec<u8>> = row.get("alternateDataHash")?;
    let alternate_size: Option<i64> = row.get("alternateDataSize")?;
    let recognition_hash: Option<Vec<u8>> = row.get("recognitionHash")?;
    let recognition_size: Option<i64> = row.get("recognitionSize")?;
    let recognition_body: Option<Vec<u8>> = row.get("recognitionBody")?;

    Ok(Resource {
        local_id: row.get("localId")?,
        guid: row.get("guid")?,
        update_sequence_number: row.get("updateSequenceNumber")?,
        note_local_id: row.get("noteLocalId")?,
        note_guid: row.get("noteGuid")?,
        mime: row.get("mime")?,
        width: row.get("width")?,
        height: row.get("height")?,
        data: data_hash.map(|hash| ResourceDataRef { hash, size: data_size.unwrap_or(0), body: None }),
        alternate_data: alternate_hash
            .map(|hash| ResourceDataRef { hash, size: alternate_size.unwrap_or(0), body: None }),
        recognition: recognition_hash.map(|hash| ResourceDataRef {
            hash,
            size: recognition_size.unwrap_or(0),
            body: recognition_body,
        }),
        is_locally_modified: row.get("isLocallyModified")?,
        index_in_note: row.get("indexInNote")?,
    })
}

pub struct ResourceHandler {
    ctx: HandlerContext,
}

impl ResourceHandler {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub async fn put(&self, resource: Resource) -> Result<Resource> {
        let resource_body = Arc::clone(&self.ctx.resource_body);
        let notifier = self.ctx.notifier.clone();

        let result = self
            .ctx
            .writer
            .submit(move |conn| {
                let data_stage = stage_body_write(
                    &resource_body,
                    conn,
                    BodyKind::Data,
                    &resource.note_local_id,
                    &resource.local_id,
                    &resource.data,
                )?;
                let alternate_stage = stage_body_write(
                    &resource_body,
                    conn,
                    BodyKind::AlternateData,
                    &resource.note_local_id,
                    &resource.local_id,
                    &resource.alternate_data,
                )?;

                in_transaction(conn, |conn| {
                    conn.execute(
                        "INSERT INTO Resources (
                             localId, guid, noteLocalId, noteGuid, updateSequenceNumber, mime,
                             width, height, dataHash, dataSize, alternateDataHash,
                             alternateDataSize, recognitionHash, recognitionSize, recognitionBody,
                             isLocallyModified, indexInNote
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                         ON CONFLICT(localId) DO UPDATE SET
                             guid = excluded.guid,
                             noteLocalId = excluded.noteLocalId,
                             noteGuid = excluded.noteGuid,
                             updateSequenceNumber = excluded.updateSequenceNumber,
                             mime = excluded.mime,
                             width = excluded.width,
                             height = excluded.height,
                             dataHash = excluded.dataHash,
                             dataSize = excluded.dataSize,
                             alternateDataHash = excluded.alternateDataHash,
                             alternateDataSize = excluded.alternateDataSize,
                             recognitionHash = excluded.recognitionHash,
                             recognitionSize = excluded.recognitionSize,
                             recognitionBody = excluded.recognitionBody,
                             isLocallyModified = excluded.isLocallyModified,
                             indexInNote = excluded.indexInNote",
                        params![
                            resource.local_id,
                            resource.guid,
                            resource.note_local_id,
                            resource.note_guid,
                            resource.update_sequence_number,
                            resource.mime,
                            resource.width,
                            resource.height,
                            resource.data.as_ref().map(|d| d.hash.clone()),
                            resource.data.as_ref().map(|d| d.size),
                            resource.alternate_data.as_ref().map(|d| d.hash.clone()),
                            resource.alternate_data.as_ref().map(|d| d.size),
                            resource.recognition.as_ref().map(|d| d.hash.clone()),
                            resource.recognition.as_ref().map(|d| d.size),
                            resource.recognition.as_ref().and_then(|d| d.body.clone()),
                            resource.is_locally_modified,
                            resource.index_in_note,
                        ],
                    )?;

                    if let Some((version_id, _)) = &data_stage {
                        ResourceBodyStore::commit_version_id(
                            conn,
                            BodyKind::Data,
                            &resource.local_id,
                            version_id,
                        )?;
                    }
                    if let Some((version_id, _)) = &alternate_stage {
                        ResourceBodyStore::commit_version_id(
                            conn,
                            BodyKind::AlternateData,
                            &resource.local_id,
                            version_id,
                        )?;
                    }
                    Ok(())
                })?;

                if let Some((_, Some(previous))) = &data_stage {
                    resource_body.delete_stale(
                        BodyKind::Data,
                        &resource.note_local_id,
                        &resource.local_id,
                        previous,
                    );
                }
                if let Some((_, Some(previous))) = &alternate_stage {
                    resource_body.delete_stale(
                        BodyKind::AlternateData,
                        &resource.note_local_id,
                        &resource.local_id,
                        previous,
                    );
                }

                Ok(resource)
            })
            .await
            .map_err(|e| conflict_on_unique_violation(e, "a resource with this guid already exists"))?;

        notifier.publish(StorageEvent::ResourcePut(result.clone()));
        Ok(result)
    }

    pub async fn find_by_local_id(
        &self,
        local_id: &str,
        options: FetchOptions,
    ) -> Result<Option<Resource>> {
        let local_id = local_id.to_string();
        let resource_body = Arc::clone(&self.ctx.resource_body);
        read(self.ctx.pool.clone(), move |conn| {
            find_by(conn, &resource_body, "localId", &local_id, options)
        })
        .await
    }

    pub async fn find_by_guid(&self, guid: &str, options: FetchOptions) -> Result<Option<Resource>> {
        let guid = guid.to_string();
        let resource_body = Arc::clone(&self.ctx.resource_body);
        read(self.ctx.pool.clone(), move |conn| {
            find_by(conn, &resource_body, "guid", &guid, options)
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
                let note_local_id: Option<String> = conn
                    .query_row(
                        "SELECT noteLocalId FROM Resources WHERE localId = ?1",
                        params![local_id],
                        |r| r.get(0),
                    )
                    .ok();
                conn.execute("DELETE FROM Resources WHERE localId = ?1", params![local_id])?;
                if let Some(note_local_id) = note_local_id {
                    resource_body.delete_all_for_resource(&note_local_id, &local_id);
                }
                Ok(local_id)
            })
            .await
            .map(|local_id| notifier.publish(StorageEvent::ResourceExpunged(local_id)))
    }

    pub async fn expunge_by_guid(&self, guid: &str) -> Result<()> {
        let local_id = self
            .find_by_guid(guid, FetchOptions::metadata_only())
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("resource with guid {guid} not found")))?
            .local_id;
        self.expunge_by_local_id(&local_id).await
    }

    pub async fn count(&self) -> Result<i64> {
        read(self.ctx.pool.clone(), |conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM Resources", [], |r| r.get(0))?)
        })
        .await
    }

    pub async fn count_per_note(&self, note_local_id: &str) -> Result<i64> {
        let note_local_id = note_local_id.to_string();
        read(self.ctx.pool.clone(), move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM Resources WHERE noteLocalId = ?1",
                params![note_local_id],
                |r| r.get(0),
            )?)
        })
        .await
    }
}

/// Stages a body write (if `data_ref` carries fresh bytes) without touching
/// SQL beyond the read needed to find the previous version id. Returns
/// `(new_version_id, previous_version_id)` so the caller can commit the
/// version-id row inside its own transaction and only delete the stale
/// file once that transaction has committed.
fn stage_body_write(
    resource_body: &ResourceBodyStore,
    connection: &Connection,
    kind: BodyKind,
    note_local_id: &str,
    resource_local_id: &str,
    data_ref: &Option<ResourceDataRef>,
) -> Result<Option<(String, Option<String>)>> {
    let Some(data_ref) = data_ref else { return Ok(None) };
    let Some(bytes) = &data_ref.body else { return Ok(None) };
    resource_body
        .stage_write(connection, kind, note_local_id, resource_local_id, bytes)
        .map(Some)
}

fn find_by(
    connection: &Connection,
    resource_body: &ResourceBodyStore,
    column: &str,
    value: &str,
    options: FetchOptions,
) -> Result<Option<Resource>> {
    let query = format!("SELECT {SELECT_COLUMNS} FROM Resources WHERE {column} = ?1");
    let mut resource = match connection.query_row(&query, params![value], row_to_resource) {
        Ok(resource) => resource,
        Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
        Err(other) => return Err(other.into()),
    };

    if !options.with_resource_metadata {
        resource.recognition = None;
    }

    if options.with_resource_binary_data {
        if let Some(data_ref) = &mut resource.data {
            data_ref.body =
                resource_body.read(connection, BodyKind::Data, &resource.note_local_id, &resource.local_id)?;
        }
        if let Some(data_ref) = &mut resource.alternate_data {
            data_ref.body = resource_body.read(
                connection,
                BodyKind::AlternateData,
                &resource.note_local_id,
                &resource.local_id,
            )?;
        }
    }

    Ok(Some(resource))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::handlers::notebooks::NotebookHandler;
    use crate::handlers::notes::NoteHandler;
    use crate::models::{Note, Notebook};
    use crate::notifier::Notifier;
    use crate::pool::ConnectionPool;
    use crate::schema::TablesInitializer;
    use crate::writer::Writer;
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

    async fn note_in(ctx: &HandlerContext) -> Note {
        let notebook = Notebook::new("Inbox");
        NotebookHandler::new(ctx.clone()).put(notebook.clone()).await.unwrap();
        let note = Note::new(notebook.local_id);
        NoteHandler::new(ctx.clone()).put(note.clone()).await.unwrap();
        note
    }

    #[tokio::test]
    async fn put_then_find_with_binary_data_round_trips_the_body() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let note = note_in(&ctx).await;

        let handler = ResourceHandler::new(ctx);
        let mut resource = Resource::new(note.local_id);
        resource.mime = Some("image/png".to_string());
        resource.data = Some(ResourceDataRef { hash: vec![1, 2, 3], size: 3, body: Some(vec![9, 9, 9]) });
        handler.put(resource.clone()).await.unwrap();

        let metadata_only = handler
            .find_by_local_id(&resource.local_id, FetchOptions::metadata_only())
            .await
            .unwrap()
            .unwrap();
        assert!(metadata_only.data.unwrap().body.is_none());

        let full = handler
            .find_by_local_id(&resource.local_id, FetchOptions::full())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.data.unwrap().body, Some(vec![9, 9, 9]));
    }

    #[tokio::test]
    async fn replacing_the_body_removes_the_old_file() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let note = note_in(&ctx).await;

        let handler = ResourceHandler::new(ctx);
        let mut resource = Resource::new(note.local_id);
        resource.data = Some(ResourceDataRef { hash: vec![1], size: 1, body: Some(vec![1]) });
        handler.put(resource.clone()).await.unwrap();

        resource.data = Some(ResourceDataRef { hash: vec![2], size: 1, body: Some(vec![2]) });
        handler.put(resource.clone()).await.unwrap();

        let full = handler
            .find_by_local_id(&resource.local_id, FetchOptions::full())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(full.data.unwrap().body, Some(vec![2]));
    }

    #[tokio::test]
    async fn expunge_removes_row_and_body_files() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx_in(&dir);
        let note = note_in(&ctx).await;

        let handler = ResourceHandler::new(ctx);
        let mut resource = Resource::new(note.local_id.clone());
        resource.data = Some(ResourceDataRef { hash: vec![1], size: 1, body: Some(vec![1]) });
        handler.put(resource.clone()).await.unwrap();

        handler.expunge_by_local_id(&resource.local_id).await.unwrap();
        assert!(handler
            .find_by_local_id(&resource.local_id, FetchOptions::metadata_only())
            .await
            .unwrap()
            .is_none());
        assert_eq!(handler.count_per_note(&note.local_id).await.unwrap(), 0);
    }
}
