//! Fan-out of put/update/expunge events to subscribers (spec.md §4's
//! "Notifier" component, §6 "Notifier events").

use tokio::sync::broadcast;

use crate::models::{Note, Notebook, Resource, SavedSearch, Tag};

/// Published strictly after (and only after) the write transaction that
/// produced it commits (spec.md §5).
#[derive(Debug, Clone)]
pub enum StorageEvent {
    NotebookPut(Notebook),
    NotebookExpunged(String),
    NotePut(Note),
    NoteExpunged(String),
    ResourcePut(Resource),
    ResourceExpunged(String),
    TagPut(Tag),
    TagExpunged(String),
    SavedSearchPut(SavedSearch),
    SavedSearchExpunged(String),
}

/// Thin wrapper over a `broadcast` channel. Lagging subscribers drop the
/// oldest events rather than block the writer — the writer must never wait
/// on a subscriber, per spec.md §5's ordering guarantees.
pub struct Notifier {
    sender: broadcast::Sender<StorageEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StorageEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: StorageEvent) {
        // No subscribers is the common case for a freshly opened engine;
        // that's not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Notebook;

    #[tokio::test]
    async fn subscriber_observes_published_event() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();

        let notebook = Notebook::new("Inbox");
        notifier.publish(StorageEvent::NotebookPut(notebook.clone()));

        match rx.recv().await.unwrap() {
            StorageEvent::NotebookPut(received) => {
                assert_eq!(received.local_id, notebook.local_id);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
