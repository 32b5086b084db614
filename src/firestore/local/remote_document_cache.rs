use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::persistence::{PersistenceTransaction, RemoteDocumentEntry};
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, SnapshotVersion};

/// The last known server state of every cached document, shared by all users.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteDocumentCache {
    index_manager: IndexManager,
}

impl RemoteDocumentCache {
    pub fn new(index_manager: IndexManager) -> Self {
        Self { index_manager }
    }

    /// The cached document, or an invalid placeholder when the key was never seen.
    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        txn.tables()
            .remote_documents
            .get(key)
            .map(|entry| entry.document.clone())
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()))
    }

    pub fn get_entries<'k, I>(&self, txn: &PersistenceTransaction<'_>, keys: I) -> MutableDocumentMap
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_entry(txn, key)))
            .collect()
    }

    /// Documents directly under the query's collection that changed after `since_read_time`.
    ///
    /// Keys in `mutated_keys` are always returned so that local overlays can be applied to
    /// them, even when the remote version no longer matches the query.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &DocumentKeySet,
        context: &mut QueryContext,
    ) -> MutableDocumentMap {
        let collection = query.path();
        let mut results = MutableDocumentMap::new();
        let start = DocumentKey::prefix_start(collection);
        for (key, entry) in txn.tables().remote_documents.range(start..) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() > collection.len() + 1 {
                continue;
            }
            context.document_read_count += 1;
            let document = &entry.document;
            if document.read_time() <= since_read_time && !mutated_keys.contains(key) {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(document) {
                continue;
            }
            results.insert(key.clone(), document.clone());
        }
        results
    }

    /// Every cached key, used by garbage collection.
    pub fn get_all_keys(&self, txn: &PersistenceTransaction<'_>) -> Vec<DocumentKey> {
        txn.tables().remote_documents.iter().map(|(key, _)| key.clone()).collect()
    }

    /// Estimated bytes held by the cache.
    pub fn get_size(&self, txn: &PersistenceTransaction<'_>) -> usize {
        *txn.tables().remote_document_size.get()
    }

    pub fn new_change_buffer(&self) -> RemoteDocumentChangeBuffer {
        RemoteDocumentChangeBuffer {
            cache: *self,
            changes: BTreeMap::new(),
        }
    }

    fn add_entry(&self, txn: &mut PersistenceTransaction<'_>, document: MutableDocument) {
        let key = document.key().clone();
        let size = document.estimate_byte_size();
        let previous = txn
            .tables_mut()
            .remote_documents
            .insert(key.clone(), RemoteDocumentEntry { document, size });
        let previous_size = previous.map(|entry| entry.size).unwrap_or(0);
        txn.tables_mut()
            .remote_document_size
            .update(|total| *total = total.saturating_sub(previous_size) + size);
        self.index_manager
            .add_to_collection_parent_index(txn, &key.collection_path());
    }

    pub(crate) fn remove_entry(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        if let Some(previous) = txn.tables_mut().remote_documents.remove(key) {
            txn.tables_mut()
                .remote_document_size
                .update(|total| *total = total.saturating_sub(previous.size));
        }
    }
}

/// Collects document changes so they can be written in one step.
///
/// Reads go through the buffer first, so callers observe their own pending changes.
#[derive(Debug)]
pub struct RemoteDocumentChangeBuffer {
    cache: RemoteDocumentCache,
    changes: BTreeMap<DocumentKey, MutableDocument>,
}

impl RemoteDocumentChangeBuffer {
    /// Buffers `document`; its read time must already be set.
    pub fn add_entry(&mut self, document: MutableDocument) {
        debug_assert!(
            !document.read_time().is_min(),
            "cannot add a document with a min read time"
        );
        self.changes.insert(document.key().clone(), document);
    }

    /// Buffers the removal of `key`.
    pub fn remove_entry(&mut self, key: &DocumentKey, read_time: SnapshotVersion) {
        let mut placeholder = MutableDocument::new_invalid_document(key.clone());
        placeholder.set_read_time(read_time);
        self.changes.insert(key.clone(), placeholder);
    }

    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        match self.changes.get(key) {
            Some(document) => document.clone(),
            None => self.cache.get_entry(txn, key),
        }
    }

    pub fn get_entries<'k, I>(&self, txn: &PersistenceTransaction<'_>, keys: I) -> MutableDocumentMap
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get_entry(txn, key)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Writes every buffered change to the cache.
    pub fn apply(self, txn: &mut PersistenceTransaction<'_>) {
        let mut indexed = MutableDocumentMap::new();
        for (key, document) in self.changes {
            if document.is_valid_document() {
                indexed.insert(key, document.clone());
                self.cache.add_entry(txn, document);
            } else {
                self.cache.remove_entry(txn, &key);
            }
        }
        self.cache.index_manager.update_index_entries(txn, &indexed);
    }
}
