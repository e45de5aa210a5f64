//! Sync caches (spec.md §4.5), one per entity type, grounded on
//! libquentier's `NotebookSyncCache`/`TagSyncCache`/`SavedSearchSyncCache`/
//! `NoteSyncCache`.
//!
//! The original fills its maps with a paged local-storage request/response
//! round trip and keeps them current by listening to the same local-storage
//! manager's `put`/`expunge` signals. There is no separate signal bus here:
//! `fill` pages through the matching handler's `list_page`, and a background
//! task subscribed to the shared [`crate::notifier::Notifier`] keeps the
//! maps current afterward, mirroring the original's "paged fill, then
//! signal-driven updates" shape with channels instead of Qt signals.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::handlers::notebooks::NotebookHandler;
use crate::handlers::notes::NoteHandler;
use crate::handlers::saved_searches::SavedSearchHandler;
use crate::handlers::tags::TagHandler;
use crate::models::{Note, Notebook, SavedSearch, Tag};
use crate::notifier::{Notifier, StorageEvent};

/// Page size for a cache's initial scan (spec.md §4.5: "page size is a
/// cache constant").
const PAGE_SIZE: i64 = 200;

/// `nameByLocalId` / `nameByGuid` / `guidByName` / `dirtyItemsByGuid`
/// (spec.md §4.5), entity-agnostic so each public cache type below is a
/// thin, typed wrapper around one of these.
struct EntityIndex<T> {
    name_by_local_id: HashMap<String, String>,
    name_by_guid: HashMap<String, String>,
    guid_by_name: HashMap<String, String>,
    dirty_items_by_guid: HashMap<String, T>,
}

impl<T> Default for EntityIndex<T> {
    fn default() -> Self {
        Self {
            name_by_local_id: HashMap::new(),
            name_by_guid: HashMap::new(),
            guid_by_name: HashMap::new(),
            dirty_items_by_guid: HashMap::new(),
        }
    }
}

impl<T: Clone> EntityIndex<T> {
    fn upsert(&mut self, local_id: &str, guid: Option<&str>, name: &str, dirty_item: Option<T>) {
        if let Some(old_name) = self.name_by_local_id.get(local_id).cloned() {
            if let Some(old_guid) = self.guid_by_name.get(&old_name).cloned() {
                if Some(old_guid.as_str()) != guid {
                    self.name_by_guid.remove(&old_guid);
                    self.guid_by_name.remove(&old_name);
                    self.dirty_items_by_guid.remove(&old_guid);
                }
            }
        }

        self.name_by_local_id.insert(local_id.to_string(), name.to_string());
        if let Some(guid) = guid {
            self.name_by_guid.insert(guid.to_string(), name.to_string());
            self.guid_by_name.insert(name.to_string(), guid.to_string());
            match dirty_item {
                Some(item) => {
                    self.dirty_items_by_guid.insert(guid.to_string(), item);
                }
                None => {
                    self.dirty_items_by_guid.remove(guid);
                }
            }
        }
    }

    fn remove_by_local_id(&mut self, local_id: &str) {
        let Some(name) = self.name_by_local_id.remove(local_id) else {
            return;
        };
        if let Some(guid) = self.guid_by_name.remove(&name) {
            self.name_by_guid.remove(&guid);
            self.dirty_items_by_guid.remove(&guid);
        }
    }
}

/// `isFilled`/`filled` (spec.md §4.5): `watch` already stores its latest
/// value, so a late caller awaiting `filled()` observes a cache that
/// finished its scan before it started waiting, with no missed-wakeup race.
struct FillSignal {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Default for FillSignal {
    fn default() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }
}

impl FillSignal {
    fn mark_filled(&self) {
        let _ = self.tx.send(true);
    }

    fn is_filled(&self) -> bool {
        *self.rx.borrow()
    }

    async fn filled(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|filled| *filled).await;
    }
}

macro_rules! read_accessors {
    ($maps:expr) => {
        /// The item's current name, if the cache has observed it.
        pub fn name_by_local_id(&self, local_id: &str) -> Option<String> {
            $maps(self).lock().unwrap().name_by_local_id.get(local_id).cloned()
        }

        /// The item's current name, keyed by its server guid.
        pub fn name_by_guid(&self, guid: &str) -> Option<String> {
            $maps(self).lock().unwrap().name_by_guid.get(guid).cloned()
        }

        /// The guid of the item currently holding `name`, if any.
        pub fn guid_by_name(&self, name: &str) -> Option<String> {
            $maps(self).lock().unwrap().guid_by_name.get(name).cloned()
        }

        pub fn is_filled(&self) -> bool {
            self.fill_signal.is_filled()
        }

        pub async fn filled(&self) {
            self.fill_signal.filled().await
        }
    };
}

/// Notebooks modified locally and not yet pushed, scoped like `Notebook`
/// cache itself (spec.md §4.5): keyed by guid so the resolver/expunger can
/// look one up without a round trip to storage.
pub struct NotebookSyncCache {
    handler: NotebookHandler,
    linked_notebook_guid: Option<String>,
    maps: Arc<Mutex<EntityIndex<Notebook>>>,
    fill_signal: Arc<FillSignal>,
    subscription: JoinHandle<()>,
}

impl NotebookSyncCache {
    pub fn new(handler: NotebookHandler, notifier: &Notifier, linked_notebook_guid: Option<String>) -> Self {
        let maps = Arc::new(Mutex::new(EntityIndex::default()));
        let fill_signal = Arc::new(FillSignal::default());

        let mut events = notifier.subscribe();
        let task_maps = Arc::clone(&maps);
        let scope = linked_notebook_guid.clone();
        let subscription = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    StorageEvent::NotebookPut(notebook) if notebook.linked_notebook_guid == scope => {
                        let dirty = notebook.is_locally_modified.then(|| notebook.clone());
                        task_maps
                            .lock()
                            .unwrap()
                            .upsert(&notebook.local_id, notebook.guid.as_deref(), &notebook.name, dirty);
                    }
                    StorageEvent::NotebookExpunged(local_id) => {
                        task_maps.lock().unwrap().remove_by_local_id(&local_id);
                    }
                    _ => {}
                }
            }
        });

        Self {
            handler,
            linked_notebook_guid,
            maps,
            fill_signal,
            subscription,
        }
    }

    /// Pages through every notebook in scope and populates the maps, then
    /// signals `filled` (spec.md §4.5).
    pub async fn fill(&self) -> Result<()> {
        let mut offset = 0i64;
        loop {
            let page = self
                .handler
                .list_page(self.linked_notebook_guid.as_deref(), offset, PAGE_SIZE)
                .await?;
            let page_len = page.len() as i64;
            {
                let mut maps = self.maps.lock().unwrap();
                for notebook in &page {
                    let dirty = notebook.is_locally_modified.then(|| notebook.clone());
                    maps.upsert(&notebook.local_id, notebook.guid.as_deref(), &notebook.name, dirty);
                }
            }
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        self.fill_signal.mark_filled();
        Ok(())
    }

    pub fn dirty_items_by_guid(&self) -> Vec<Notebook> {
        self.maps.lock().unwrap().dirty_items_by_guid.values().cloned().collect()
    }

    read_accessors!(|cache: &Self| &cache.maps);
}

impl Drop for NotebookSyncCache {
    fn drop(&mut self) {
        self.subscription.abort();
    }
}

/// Same shape as [`NotebookSyncCache`], scoped the same way (spec.md §4.5).
pub struct TagSyncCache {
    handler: TagHandler,
    linked_notebook_guid: Option<String>,
    maps: Arc<Mutex<EntityIndex<Tag>>>,
    fill_signal: Arc<FillSignal>,
    subscription: JoinHandle<()>,
}

impl TagSyncCache {
    pub fn new(handler: TagHandler, notifier: &Notifier, linked_notebook_guid: Option<String>) -> Self {
        let maps = Arc::new(Mutex::new(EntityIndex::default()));
        let fill_signal = Arc::new(FillSignal::default());

        let mut events = notifier.subscribe();
        let task_maps = Arc::clone(&maps);
        let scope = linked_notebook_guid.clone();
        let subscription = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    StorageEvent::TagPut(tag) if tag.linked_notebook_guid == scope => {
                        let dirty = tag.is_locally_modified.then(|| tag.clone());
                        task_maps.lock().unwrap().upsert(&tag.local_id, tag.guid.as_deref(), &tag.name, dirty);
                    }
                    StorageEvent::TagExpunged(local_id) => {
                        task_maps.lock().unwrap().remove_by_local_id(&local_id);
                    }
                    _ => {}
                }
            }
        });

        Self {
            handler,
            linked_notebook_guid,
            maps,
            fill_signal,
            subscription,
        }
    }

    pub async fn fill(&self) -> Result<()> {
        let mut offset = 0i64;
        loop {
            let page = self
                .handler
                .list_page(self.linked_notebook_guid.as_deref(), offset, PAGE_SIZE)
                .await?;
            let page_len = page.len() as i64;
            {
                let mut maps = self.maps.lock().unwrap();
                for tag in &page {
                    let dirty = tag.is_locally_modified.then(|| tag.clone());
                    maps.upsert(&tag.local_id, tag.guid.as_deref(), &tag.name, dirty);
                }
            }
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        self.fill_signal.mark_filled();
        Ok(())
    }

    pub fn dirty_items_by_guid(&self) -> Vec<Tag> {
        self.maps.lock().unwrap().dirty_items_by_guid.values().cloned().collect()
    }

    read_accessors!(|cache: &Self| &cache.maps);
}

impl Drop for TagSyncCache {
    fn drop(&mut self) {
        self.subscription.abort();
    }
}

/// Unscoped (spec.md §4.5: "the saved-search cache has no such scope").
pub struct SavedSearchSyncCache {
    handler: SavedSearchHandler,
    maps: Arc<Mutex<EntityIndex<SavedSearch>>>,
    fill_signal: Arc<FillSignal>,
    subscription: JoinHandle<()>,
}

impl SavedSearchSyncCache {
    pub fn new(handler: SavedSearchHandler, notifier: &Notifier) -> Self {
        let maps = Arc::new(Mutex::new(EntityIndex::default()));
        let fill_signal = Arc::new(FillSignal::default());

        let mut events = notifier.subscribe();
        let task_maps = Arc::clone(&maps);
        let subscription = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    StorageEvent::SavedSearchPut(search) => {
                        let dirty = search.is_locally_modified.then(|| search.clone());
                        task_maps
                            .lock()
                            .unwrap()
                            .upsert(&search.local_id, search.guid.as_deref(), &search.name, dirty);
                    }
                    StorageEvent::SavedSearchExpunged(local_id) => {
                        task_maps.lock().unwrap().remove_by_local_id(&local_id);
                    }
                    _ => {}
                }
            }
        });

        Self {
            handler,
            maps,
            fill_signal,
            subscription,
        }
    }

    pub async fn fill(&self) -> Result<()> {
        let mut offset = 0i64;
        loop {
            let page = self.handler.list_page(offset, PAGE_SIZE).await?;
            let page_len = page.len() as i64;
            {
                let mut maps = self.maps.lock().unwrap();
                for search in &page {
                    let dirty = search.is_locally_modified.then(|| search.clone());
                    maps.upsert(&search.local_id, search.guid.as_deref(), &search.name, dirty);
                }
            }
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        self.fill_signal.mark_filled();
        Ok(())
    }

    pub fn dirty_items_by_guid(&self) -> Vec<SavedSearch> {
        self.maps.lock().unwrap().dirty_items_by_guid.values().cloned().collect()
    }

    read_accessors!(|cache: &Self| &cache.maps);
}

impl Drop for SavedSearchSyncCache {
    fn drop(&mut self) {
        self.subscription.abort();
    }
}

/// Scoped like the notebook/tag caches, but a note carries no
/// `linkedNotebookGuid` of its own — only its owning notebook's guid — so
/// scope membership is tracked separately as the set of in-scope notebook
/// local ids, refreshed from `fill()` and kept current from Notebook events
/// the same background task also observes. `title` stands in for the
/// "name" this cache type shares with the others; notes have no conflict
/// resolver keyed on it (spec.md §4.5 only defines one for notebook, tag
/// and saved-search), so it's consulted here only through
/// `dirtyItemsByGuid`.
pub struct NoteSyncCache {
    handler: NoteHandler,
    notebook_handler: NotebookHandler,
    linked_notebook_guid: Option<String>,
    maps: Arc<Mutex<EntityIndex<Note>>>,
    notebook_scope: Arc<Mutex<HashSet<String>>>,
    fill_signal: Arc<FillSignal>,
    subscription: JoinHandle<()>,
}

impl NoteSyncCache {
    pub fn new(
        handler: NoteHandler,
        notebook_handler: NotebookHandler,
        notifier: &Notifier,
        linked_notebook_guid: Option<String>,
    ) -> Self {
        let maps = Arc::new(Mutex::new(EntityIndex::default()));
        let fill_signal = Arc::new(FillSignal::default());
        let notebook_scope: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let mut events = notifier.subscribe();
        let task_maps = Arc::clone(&maps);
        let task_scope = Arc::clone(&notebook_scope);
        let scope = linked_notebook_guid.clone();
        let subscription = tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    StorageEvent::NotebookPut(notebook) => {
                        let mut notebook_scope = task_scope.lock().unwrap();
                        if notebook.linked_notebook_guid == scope {
                            notebook_scope.insert(notebook.local_id);
                        } else {
                            notebook_scope.remove(&notebook.local_id);
                        }
                    }
                    StorageEvent::NotebookExpunged(local_id) => {
                        task_scope.lock().unwrap().remove(&local_id);
                    }
                    StorageEvent::NotePut(note) => {
                        let in_scope = task_scope.lock().unwrap().contains(&note.notebook_local_id);
                        let mut maps = task_maps.lock().unwrap();
                        if in_scope {
                            let name = note.title.clone().unwrap_or_default();
                            let dirty = note.is_locally_modified.then(|| note.clone());
                            maps.upsert(&note.local_id, note.guid.as_deref(), &name, dirty);
                        } else {
                            maps.remove_by_local_id(&note.local_id);
                        }
                    }
                    StorageEvent::NoteExpunged(local_id) => {
                        task_maps.lock().unwrap().remove_by_local_id(&local_id);
                    }
                    _ => {}
                }
            }
        });

        Self {
            handler,
            notebook_handler,
            linked_notebook_guid,
            maps,
            notebook_scope,
            fill_signal,
            subscription,
        }
    }

    /// Rebuilds the in-scope notebook set, then pages through every note in
    /// scope and populates the maps (spec.md §4.5).
    pub async fn fill(&self) -> Result<()> {
        let notebooks = self
            .notebook_handler
            .list_by_linked_notebook_guid(self.linked_notebook_guid.as_deref())
            .await?;
        *self.notebook_scope.lock().unwrap() = notebooks.into_iter().map(|n| n.local_id).collect();

        let mut offset = 0i64;
        loop {
            let page = self
                .handler
                .list_page(self.linked_notebook_guid.as_deref(), offset, PAGE_SIZE)
                .await?;
            let page_len = page.len() as i64;
            {
                let mut maps = self.maps.lock().unwrap();
                for note in &page {
                    let name = note.title.clone().unwrap_or_default();
                    let dirty = note.is_locally_modified.then(|| note.clone());
                    maps.upsert(&note.local_id, note.guid.as_deref(), &name, dirty);
                }
            }
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        self.fill_signal.mark_filled();
        Ok(())
    }

    pub fn dirty_items_by_guid(&self) -> Vec<Note> {
        self.maps.lock().unwrap().dirty_items_by_guid.values().cloned().collect()
    }

    read_accessors!(|cache: &Self| &cache.maps);
}

impl Drop for NoteSyncCache {
    fn drop(&mut self) {
        self.subscription.abort();
    }
}
