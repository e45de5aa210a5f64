//! Sync conflict resolution for notebooks, tags and saved searches
//! (spec.md §4.5), grounded on libquentier's
//! `NotebookSyncConflictResolver`/`TagSyncConflictResolver`/
//! `SavedSearchSyncConflictResolver`.
//!
//! The original is a signal/slot state machine that waits on round trips
//! to a separate local-storage event loop (cache filling, find, add,
//! update each a queued request/response pair). Every operation this
//! crate's handlers expose already resolves in one `await`, so the same
//! decision tree collapses into a single linear `async fn` per entity with
//! no explicit state enum.

use crate::error::Result;
use crate::handlers::notebooks::NotebookHandler;
use crate::handlers::saved_searches::SavedSearchHandler;
use crate::handlers::tags::TagHandler;
use crate::models::{Notebook, SavedSearch, Tag};

/// Resolves a conflict between a notebook freshly downloaded from the
/// server (`remote`, guid and name always set) and the local notebook that
/// conflicts with it (matched by guid beforehand by the caller).
pub async fn resolve_notebook_conflict(
    handler: &NotebookHandler,
    remote: Notebook,
    local_conflict: Notebook,
) -> Result<Notebook> {
    if local_conflict.name.eq_ignore_ascii_case(&remote.name) {
        resolve_notebook_conflict_by_name(handler, remote, local_conflict).await
    } else {
        let linked_notebook_guid = remote.linked_notebook_guid.clone();
        match handler.find_by_name(&remote.name, linked_notebook_guid.as_deref()).await? {
            None => override_notebook(handler, remote, local_conflict).await,
            Some(duplicate_by_name) => {
                resolve_notebook_conflict_by_name(handler, remote, duplicate_by_name).await
            }
        }
    }
}

async fn resolve_notebook_conflict_by_name(
    handler: &NotebookHandler,
    remote: Notebook,
    local_conflict: Notebook,
) -> Result<Notebook> {
    if local_conflict.guid == remote.guid {
        return override_notebook(handler, remote, local_conflict).await;
    }

    if local_conflict.linked_notebook_guid != remote.linked_notebook_guid {
        return adopt_remote_notebook(handler, remote).await;
    }

    let renamed_name = unique_notebook_name(
        handler,
        &local_conflict.name,
        local_conflict.linked_notebook_guid.as_deref(),
    )
    .await?;
    let mut renamed = local_conflict;
    renamed.name = renamed_name;
    renamed.is_locally_modified = true;
    handler.put(renamed).await?;

    adopt_remote_notebook(handler, remote).await
}

async fn adopt_remote_notebook(handler: &NotebookHandler, remote: Notebook) -> Result<Notebook> {
    let existing_by_guid = match &remote.guid {
        Some(guid) => handler.find_by_guid(guid).await?,
        None => None,
    };
    let mut notebook = remote;
    if let Some(existing) = existing_by_guid {
        notebook.local_id = existing.local_id;
    }
    notebook.is_locally_modified = false;
    notebook.is_local_only = false;
    handler.put(notebook).await
}

async fn override_notebook(handler: &NotebookHandler, remote: Notebook, local_conflict: Notebook) -> Result<Notebook> {
    let mut notebook = remote;
    notebook.local_id = local_conflict.local_id;
    notebook.is_locally_modified = false;
    notebook.is_local_only = false;
    if notebook.linked_notebook_guid.is_some() {
        // A notebook arriving from a linked notebook being marked default
        // or last-used wouldn't make sense among this account's own
        // notebooks with those flags.
        notebook.is_default = false;
        notebook.is_last_used = false;
    }
    handler.put(notebook).await
}

async fn unique_notebook_name(
    handler: &NotebookHandler,
    base_name: &str,
    linked_notebook_guid: Option<&str>,
) -> Result<String> {
    let mut candidate = format!("{base_name} - conflicting");
    let mut suffix = 1u32;
    while handler.find_by_name(&candidate, linked_notebook_guid).await?.is_some() {
        candidate = format!("{base_name} - conflicting ({suffix})");
        suffix += 1;
    }
    Ok(candidate)
}

/// Resolves a conflict between a remote tag and the local tag it conflicts
/// with, following the same shape as [`resolve_notebook_conflict`].
pub async fn resolve_tag_conflict(handler: &TagHandler, remote: Tag, local_conflict: Tag) -> Result<Tag> {
    if local_conflict.name.eq_ignore_ascii_case(&remote.name) {
        resolve_tag_conflict_by_name(handler, remote, local_conflict).await
    } else {
        let linked_notebook_guid = remote.linked_notebook_guid.clone();
        match handler.find_by_name(&remote.name, linked_notebook_guid.as_deref()).await? {
            None => override_tag(handler, remote, local_conflict).await,
            Some(duplicate_by_name) => resolve_tag_conflict_by_name(handler, remote, duplicate_by_name).await,
        }
    }
}

async fn resolve_tag_conflict_by_name(handler: &TagHandler, remote: Tag, local_conflict: Tag) -> Result<Tag> {
    if local_conflict.guid == remote.guid {
        return override_tag(handler, remote, local_conflict).await;
    }

    if local_conflict.linked_notebook_guid != remote.linked_notebook_guid {
        return adopt_remote_tag(handler, remote).await;
    }

    let renamed_name =
        unique_tag_name(handler, &local_conflict.name, local_conflict.linked_notebook_guid.as_deref()).await?;
    let mut renamed = local_conflict;
    renamed.name = renamed_name;
    renamed.is_locally_modified = true;
    handler.put(renamed).await?;

    adopt_remote_tag(handler, remote).await
}

async fn adopt_remote_tag(handler: &TagHandler, remote: Tag) -> Result<Tag> {
    let existing_by_guid = match &remote.guid {
        Some(guid) => handler.find_by_guid(guid).await?,
        None => None,
    };
    let mut tag = remote;
    if let Some(existing) = existing_by_guid {
        tag.local_id = existing.local_id;
    }
    tag.is_locally_modified = false;
    tag.is_local_only = false;
    handler.put(tag).await
}

async fn override_tag(handler: &TagHandler, remote: Tag, local_conflict: Tag) -> Result<Tag> {
    let mut tag = remote;
    tag.local_id = local_conflict.local_id;
    tag.is_locally_modified = false;
    tag.is_local_only = false;
    // Cleared so storage recomputes it from parentGuid via the FK instead of
    // trusting a local_id that may no longer match after the override.
    tag.parent_tag_local_id = None;
    handler.put(tag).await
}

async fn unique_tag_name(handler: &TagHandler, base_name: &str, linked_notebook_guid: Option<&str>) -> Result<String> {
    let mut candidate = format!("{base_name} - conflicting");
    let mut suffix = 1u32;
    while handler.find_by_name(&candidate, linked_notebook_guid).await?.is_some() {
        candidate = format!("{base_name} - conflicting ({suffix})");
        suffix += 1;
    }
    Ok(candidate)
}

/// Resolves a conflict between a remote saved search and the local one it
/// conflicts with. Saved searches have no linked-notebook scope, so the
/// "different scope" branch the notebook/tag resolvers have doesn't apply
/// here.
pub async fn resolve_saved_search_conflict(
    handler: &SavedSearchHandler,
    remote: SavedSearch,
    local_conflict: SavedSearch,
) -> Result<SavedSearch> {
    if local_conflict.name.eq_ignore_ascii_case(&remote.name) {
        resolve_saved_search_conflict_by_name(handler, remote, local_conflict).await
    } else {
        match handler.find_by_name(&remote.name).await? {
            None => override_saved_search(handler, remote, local_conflict).await,
            Some(duplicate_by_name) => {
                resolve_saved_search_conflict_by_name(handler, remote, duplicate_by_name).await
            }
        }
    }
}

async fn resolve_saved_search_conflict_by_name(
    handler: &SavedSearchHandler,
    remote: SavedSearch,
    local_conflict: SavedSearch,
) -> Result<SavedSearch> {
    if local_conflict.guid == remote.guid {
        return override_saved_search(handler, remote, local_conflict).await;
    }

    let mut candidate = format!("{} - conflicting", local_conflict.name);
    let mut suffix = 1u32;
    while handler.find_by_name(&candidate).await?.is_some() {
        candidate = format!("{} - conflicting ({suffix})", local_conflict.name);
        suffix += 1;
    }
    let mut renamed = local_conflict;
    renamed.name = candidate;
    renamed.is_locally_modified = true;
    handler.put(renamed).await?;

    let existing_by_guid = match &remote.guid {
        Some(guid) => handler.find_by_guid(guid).await?,
        None => None,
    };
    let mut search = remote;
    if let Some(existing) = existing_by_guid {
        search.local_id = existing.local_id;
    }
    search.is_locally_modified = false;
    search.is_local_only = false;
    handler.put(search).await
}

async fn override_saved_search(
    handler: &SavedSearchHandler,
    remote: SavedSearch,
    local_conflict: SavedSearch,
) -> Result<SavedSearch> {
    let mut search = remote;
    search.local_id = local_conflict.local_id;
    search.is_locally_modified = false;
    search.is_local_only = false;
    handler.put(search).await
}
