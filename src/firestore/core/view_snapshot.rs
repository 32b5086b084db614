use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};

use crate::firestore::core::Query;
use crate::firestore::model::{DocumentKey, DocumentKeySet, DocumentSet, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DocumentChangeType {
    Added,
    Removed,
    Modified,
    /// Only the document's metadata (pending writes) changed.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: DocumentChangeType,
    pub document: MutableDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Results come from the local cache and may be stale.
    Local,
    /// Results are consistent with the server.
    Synced,
}

/// The client's best guess at whether the backend is reachable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OnlineState {
    Unknown,
    Online,
    Offline,
}

/// Collapses a sequence of per-document changes into the net change for each key.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        use DocumentChangeType::*;

        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        let merged = match (old.change_type, change.change_type) {
            (Added, Metadata) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Metadata, Removed) => Some(change),
            (Metadata, Modified) => Some(change),
            (Metadata, Metadata) => Some(change),
            (Modified, Modified) => Some(change),
            (Modified, Metadata) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => panic!(
                "unsupported document change combination {old_type:?} followed by {new_type:?} for {key}"
            ),
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// What a query listener observes after each change.
#[derive(Clone)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys of documents in `docs` with pending local writes.
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    /// Whether the target was resumed from previously cached results.
    pub has_cached_results: bool,
}

impl Debug for ViewSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewSnapshot")
            .field("query", &self.query.canonical_id())
            .field("docs", &self.docs)
            .field("doc_changes", &self.doc_changes)
            .field("from_cache", &self.from_cache)
            .field("has_pending_writes", &self.has_pending_writes())
            .field("sync_state_changed", &self.sync_state_changed)
            .field("excludes_metadata_changes", &self.excludes_metadata_changes)
            .finish()
    }
}

impl ViewSnapshot {
    /// A snapshot where every document is reported as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: DocumentChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_docs = documents.empty_like();
        Self {
            query,
            docs: documents,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Whether the snapshot reflects the server with no pending local writes.
    pub fn is_settled(&self) -> bool {
        !self.from_cache && !self.has_pending_writes()
    }
}

impl PartialEq for ViewSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.from_cache == other.from_cache
            && self.has_cached_results == other.has_cached_results
            && self.sync_state_changed == other.sync_state_changed
            && self.mutated_keys == other.mutated_keys
            && self.excludes_metadata_changes == other.excludes_metadata_changes
            && self.query == other.query
            && self.docs == other.docs
            && self.old_docs == other.old_docs
            && self.doc_changes == other.doc_changes
    }
}
