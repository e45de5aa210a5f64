//! Entity value types (spec.md §3).
//!
//! These are plain value structs: the handlers (`crate::handlers`) own all
//! the I/O, the sync layer (`crate::sync`) owns all the reconciliation
//! logic. A struct here never reaches back into a connection or a cache.

use serde::{Deserialize, Serialize};

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A freshly generated, locally unique identifier.
pub fn new_local_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Notebook {
    pub local_id: String,
    pub guid: Option<String>,
    pub update_sequence_number: Option<i64>,
    pub linked_notebook_guid: Option<String>,
    pub name: String,
    pub is_default: bool,
    pub is_last_used: bool,
    pub stack: Option<String>,
    pub is_locally_modified: bool,
    pub is_local_only: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Notebook {
    pub fn new(name: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            local_id: new_local_id(),
            name: name.into(),
            is_locally_modified: true,
            is_local_only: true,
            created_at: Some(now.clone()),
            updated_at: Some(now),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Note {
    pub local_id: String,
    pub guid: Option<String>,
    pub update_sequence_number: Option<i64>,
    pub notebook_local_id: String,
    pub notebook_guid: Option<String>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub content_hash: Option<Vec<u8>>,
    pub content_length: Option<i64>,
    pub tag_local_ids: Vec<String>,
    pub tag_guids: Vec<String>,
    pub is_locally_modified: bool,
    pub is_local_only: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Note {
    pub fn new(notebook_local_id: impl Into<String>) -> Self {
        let now = now_rfc3339();
        Self {
            local_id: new_local_id(),
            notebook_local_id: notebook_local_id.into(),
            is_locally_modified: true,
            is_local_only: true,
            created_at: Some(now.clone()),
            updated_at: Some(now),
            ..Default::default()
        }
    }
}

/// A resource (attachment) body stream descriptor: the bytes themselves
/// live in a file (§4.3), never in this struct's serialized form inside the
/// database row.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceDataRef {
    pub hash: Vec<u8>,
    pub size: i64,
    pub body: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Resource {
    pub local_id: String,
    pub guid: Option<String>,
    pub update_sequence_number: Option<i64>,
    pub note_local_id: String,
    pub note_guid: Option<String>,
    pub mime: Option<String>,
    pub width: Option<i32>,
    pub height: Option<i32>,
    pub data: Option<ResourceDataRef>,
    pub alternate_data: Option<ResourceDataRef>,
    pub recognition: Option<ResourceDataRef>,
    pub is_locally_modified: bool,
    pub index_in_note: i64,
}

impl Resource {
    pub fn new(note_local_id: impl Into<String>) -> Self {
        Self {
            local_id: new_local_id(),
            note_local_id: note_local_id.into(),
            is_locally_modified: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Tag {
    pub local_id: String,
    pub guid: Option<String>,
    pub update_sequence_number: Option<i64>,
    pub linked_notebook_guid: Option<String>,
    pub name: String,
    pub parent_tag_local_id: Option<String>,
    pub parent_guid: Option<String>,
    pub is_locally_modified: bool,
    pub is_local_only: bool,
}

impl Tag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            local_id: new_local_id(),
            name: name.into(),
            is_locally_modified: true,
            is_local_only: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SavedSearch {
    pub local_id: String,
    pub guid: Option<String>,
    pub update_sequence_number: Option<i64>,
    pub name: String,
    pub query: String,
    pub is_locally_modified: bool,
    pub is_local_only: bool,
}

impl SavedSearch {
    pub fn new(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            local_id: new_local_id(),
            name: name.into(),
            query: query.into(),
            is_locally_modified: true,
            is_local_only: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LinkedNotebook {
    pub guid: String,
    pub shard_id: Option<String>,
    pub username: Option<String>,
    pub share_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub email: Option<String>,
    pub viewed_promotions: Vec<String>,
    pub recent_mailed_addresses: Vec<String>,
}

impl User {
    pub fn new(user_id: i64) -> Self {
        Self {
            user_id,
            ..Default::default()
        }
    }
}

/// Selects which parts of a Note/Resource to materialize on a read.
///
/// Reading resource binary bodies is comparatively expensive (it opens a
/// file per resource, §4.3) so callers opt in explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    pub with_resource_metadata: bool,
    pub with_resource_binary_data: bool,
}

impl FetchOptions {
    /// Resource attributes (e.g. recognition data) without binary bodies.
    pub fn metadata_only() -> Self {
        Self {
            with_resource_metadata: true,
            with_resource_binary_data: false,
        }
    }

    pub fn full() -> Self {
        Self {
            with_resource_metadata: true,
            with_resource_binary_data: true,
        }
    }
}
