//! End-to-end tests exercising the storage engine the way a caller would
//! assemble it: open a pool, bring the schema up to the highest supported
//! version, then drive handlers/sync through a shared `HandlerContext`.
//!
//! Unit tests inside each module already cover that module's own
//! invariants in isolation; these tests are about the seams between them -
//! migrating a pre-existing database and then using it, a note that
//! carries resources and tags together, and a conflict resolution pass
//! feeding the stale-item expunger the way a sync session would.

use std::sync::Arc;

use tempfile::TempDir;

use quill_storage::config::EngineConfig;
use quill_storage::handlers::notebooks::NotebookHandler;
use quill_storage::handlers::notes::NoteHandler;
use quill_storage::handlers::resources::ResourceHandler;
use quill_storage::handlers::saved_searches::SavedSearchHandler;
use quill_storage::handlers::tags::TagHandler;
use quill_storage::handlers::HandlerContext;
use quill_storage::models::{FetchOptions, Note, Notebook, Resource, ResourceDataRef, SavedSearch, Tag};
use quill_storage::notifier::Notifier;
use quill_storage::pool::ConnectionPool;
use quill_storage::resource_body::ResourceBodyStore;
use quill_storage::schema::TablesInitializer;
use quill_storage::sync::expunger::{FullSyncStaleDataItemsExpunger, SyncedGuids};
use quill_storage::sync::resolver::{resolve_notebook_conflict, resolve_tag_conflict};
use quill_storage::version::{set_version, upgrade_to_highest_version, VersionHandler, HIGHEST_SUPPORTED_VERSION};
use quill_storage::writer::Writer;

fn open_engine(dir: &TempDir) -> (HandlerContext, Arc<ConnectionPool>, EngineConfig) {
    let config = EngineConfig::sqlite_at(dir.path());
    let pool = ConnectionPool::new(&config).unwrap();
    {
        let conn = pool.database().unwrap();
        let conn = conn.lock().unwrap();
        TablesInitializer::init_all(&conn).unwrap();
    }
    let writer = Writer::spawn(Arc::clone(&pool)).unwrap();
    let ctx = HandlerContext {
        pool: Arc::clone(&pool),
        writer,
        notifier: Arc::new(Notifier::default()),
        resource_body: Arc::new(ResourceBodyStore::new(&config)),
    };
    (ctx, pool, config)
}

/// A brand-new account opens straight at the current schema version and
/// has nothing left to migrate (spec.md §4.2).
#[tokio::test]
async fn fresh_account_opens_at_highest_version_with_no_patches() {
    let dir = TempDir::new().unwrap();
    let (ctx, pool, config) = open_engine(&dir);

    let version_handler = VersionHandler::new(Arc::clone(&pool), ctx.writer.clone(), config);
    assert!(version_handler.required_patches().await.unwrap().is_empty());
    assert!(!version_handler.requires_upgrade().await.unwrap());

    // Upgrading an already-current database is a no-op, not an error.
    upgrade_to_highest_version(&version_handler).await.unwrap();
    assert_eq!(version_handler.version().await.unwrap(), HIGHEST_SUPPORTED_VERSION);
}

/// A database stuck at version 1 (the oldest supported starting point)
/// runs both patches in order and lands at the current version with its
/// data intact.
#[tokio::test]
async fn upgrading_a_version_one_database_preserves_existing_rows() {
    let dir = TempDir::new().unwrap();
    let (ctx, pool, config) = open_engine(&dir);

    let notebook = Notebook::new("Inbox");
    NotebookHandler::new(ctx.clone()).put(notebook.clone()).await.unwrap();

    // The schema starts a fresh database at the current version; roll the
    // Auxiliary row back to 1 to exercise the upgrade path the way an
    // account carried over from an older build would.
    ctx.writer.submit(|conn| set_version(conn, 1)).await.unwrap();

    let version_handler = VersionHandler::new(Arc::clone(&pool), ctx.writer.clone(), config);
    assert_eq!(version_handler.required_patches().await.unwrap().len(), 2);

    upgrade_to_highest_version(&version_handler).await.unwrap();
    assert_eq!(version_handler.version().await.unwrap(), HIGHEST_SUPPORTED_VERSION);

    let notebook_handler = NotebookHandler::new(ctx);
    let still_there = notebook_handler.find_by_local_id(&notebook.local_id).await.unwrap().unwrap();
    assert_eq!(still_there.name, "Inbox");
}

/// A note with tags and a resource attached round-trips the full object
/// graph through separate handlers sharing one context, the way a note
/// editor would build and then reload a note (spec.md §3/§4.4).
#[tokio::test]
async fn note_with_tags_and_a_resource_round_trips_across_handlers() {
    let dir = TempDir::new().unwrap();
    let (ctx, _pool, _config) = open_engine(&dir);

    let notebook_handler = NotebookHandler::new(ctx.clone());
    let notebook = notebook_handler.put(Notebook::new("Work")).await.unwrap();

    let tag_handler = TagHandler::new(ctx.clone());
    let tag = tag_handler.put(Tag::new("important")).await.unwrap();

    let note_handler = NoteHandler::new(ctx.clone());
    let mut note = Note::new(notebook.local_id.clone());
    note.title = Some("Kickoff notes".to_string());
    note.tag_local_ids = vec![tag.local_id.clone()];
    let note = note_handler.put(note).await.unwrap();

    let resource_handler = ResourceHandler::new(ctx);
    let mut resource = Resource::new(note.local_id.clone());
    resource.mime = Some("text/plain".to_string());
    resource.data = Some(ResourceDataRef { hash: vec![7, 7, 7], size: 3, body: Some(b"hi!".to_vec()) });
    resource_handler.put(resource.clone()).await.unwrap();

    let reloaded_note = note_handler.find_by_local_id(&note.local_id).await.unwrap().unwrap();
    assert_eq!(reloaded_note.tag_local_ids, vec![tag.local_id]);

    let reloaded_resource = resource_handler
        .find_by_local_id(&resource.local_id, FetchOptions::full())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded_resource.data.unwrap().body, Some(b"hi!".to_vec()));
    assert_eq!(resource_handler.count_per_note(&note.local_id).await.unwrap(), 1);
}

/// A tag override conflict clears the local parent pointer so it gets
/// recomputed from the remote's `parentGuid`, per spec.md §4.5's
/// tag-specific addendum to the notebook/tag/saved-search resolution flow.
#[tokio::test]
async fn tag_override_conflict_clears_stale_parent_local_id() {
    let dir = TempDir::new().unwrap();
    let (ctx, _pool, _config) = open_engine(&dir);
    let tag_handler = TagHandler::new(ctx);

    let mut stale_parent = Tag::new("Old parent");
    stale_parent.guid = Some("old-parent-guid".to_string());
    let stale_parent = tag_handler.put(stale_parent).await.unwrap();

    let mut local = Tag::new("Active");
    local.guid = Some("shared-guid".to_string());
    local.parent_tag_local_id = Some(stale_parent.local_id);
    local.is_locally_modified = true;
    let local = tag_handler.put(local.clone()).await.unwrap();

    let mut remote = local.clone();
    remote.parent_guid = Some("new-parent-guid".to_string());
    remote.is_locally_modified = true;

    let resolved = resolve_tag_conflict(&tag_handler, remote, local).await.unwrap();
    assert!(resolved.parent_tag_local_id.is_none());
    assert_eq!(resolved.parent_guid.as_deref(), Some("new-parent-guid"));
}

/// A full sync pass: conflict resolution for one surviving notebook
/// followed by the stale-item purge for everything the sync didn't touch,
/// run back to back against one context the way an incremental sync
/// session would (spec.md §4.5 into §4.6).
#[tokio::test]
async fn conflict_resolution_then_stale_item_purge_in_one_session() {
    let dir = TempDir::new().unwrap();
    let (ctx, _pool, _config) = open_engine(&dir);

    let notebook_handler = NotebookHandler::new(ctx.clone());
    let mut kept_locally = Notebook::new("Inbox");
    kept_locally.guid = Some("inbox-guid".to_string());
    kept_locally.is_locally_modified = true;
    let kept_locally = notebook_handler.put(kept_locally).await.unwrap();

    let mut remote_update = kept_locally.clone();
    remote_update.local_id = String::new();
    remote_update.update_sequence_number = Some(42);
    remote_update.is_locally_modified = true;
    let resolved = resolve_notebook_conflict(&notebook_handler, remote_update, kept_locally.clone())
        .await
        .unwrap();
    assert_eq!(resolved.local_id, kept_locally.local_id);
    assert!(!resolved.is_locally_modified);

    let mut untouched = Notebook::new("Leftover");
    untouched.guid = Some("leftover-guid".to_string());
    untouched.is_locally_modified = false;
    notebook_handler.put(untouched).await.unwrap();

    let saved_search_handler = SavedSearchHandler::new(ctx.clone());
    saved_search_handler.put(SavedSearch::new("Unread", "tag:unread")).await.unwrap();

    let mut synced = SyncedGuids::default();
    synced.notebook_guids.insert("inbox-guid".to_string());

    let expunger = FullSyncStaleDataItemsExpunger::new(ctx);
    let report = expunger.expunge_stale_items(None, &synced).await.unwrap();

    assert_eq!(report.notebooks_expunged, 1);
    assert_eq!(report.saved_searches_expunged, 1);
    assert_eq!(notebook_handler.count().await.unwrap(), 1);
    let surviving = notebook_handler.find_by_local_id(&kept_locally.local_id).await.unwrap().unwrap();
    assert_eq!(surviving.update_sequence_number, Some(42));
}
