use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::local::document_overlay_cache::{DocumentOverlayCache, OverlayMap};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, IndexOffset,
    MutableDocument, MutableDocumentMap, Mutation, OverlayedDocument, Timestamp,
};

pub type OverlayedDocumentMap = BTreeMap<DocumentKey, OverlayedDocument>;

/// Combines remote documents with the current user's overlays to produce the local view.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_document_cache: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    document_overlay_cache: DocumentOverlayCache,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_document_cache: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        document_overlay_cache: DocumentOverlayCache,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            remote_document_cache,
            mutation_queue,
            document_overlay_cache,
            index_manager,
        }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn document_overlay_cache(&self) -> &DocumentOverlayCache {
        &self.document_overlay_cache
    }

    /// The local view of one document; an invalid placeholder if nothing is known.
    pub fn get_document(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> MutableDocument {
        let overlay = self.document_overlay_cache.get_overlay(txn, key);
        let mut document = match &overlay {
            Some(overlay) if !overlay.mutation.is_patch() => MutableDocument::new_invalid_document(key.clone()),
            _ => self.remote_document_cache.get_entry(txn, key),
        };
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::default()), Timestamp::now());
        }
        document
    }

    pub fn get_documents(&self, txn: &mut PersistenceTransaction<'_>, keys: &DocumentKeySet) -> DocumentMap {
        let documents = self.remote_document_cache.get_entries(txn, keys);
        self.get_local_view_of_documents(txn, documents, &DocumentKeySet::new())
    }

    /// Applies overlays to `documents`.
    ///
    /// Keys in `existence_state_changed` had their remote existence flip, so their overlays are
    /// recomputed from the mutation queue instead of reused.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: MutableDocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> DocumentMap {
        let overlays = self.document_overlay_cache.get_overlays(txn, documents.keys());
        self.compute_views(txn, documents, &overlays, existence_state_changed)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.overlayed_document))
            .collect()
    }

    /// Like [`Self::get_local_view_of_documents`] but also reports the fields each overlay wrote.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: MutableDocumentMap,
    ) -> OverlayedDocumentMap {
        let overlays = self.document_overlay_cache.get_overlays(txn, documents.keys());
        self.compute_views(txn, documents, &overlays, &DocumentKeySet::new())
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        mut documents: MutableDocumentMap,
        overlays: &OverlayMap,
        existence_state_changed: &DocumentKeySet,
    ) -> OverlayedDocumentMap {
        let mut recalculate = MutableDocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();

        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let needs_recalculation = existence_state_changed.contains(key)
                && overlay.map_or(true, |overlay| overlay.mutation.is_patch());
            if needs_recalculation {
                recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask().cloned();
                mutated_fields.insert(key.clone(), mask.clone());
                overlay.mutation.apply_to_local_view(document, mask, Timestamp::now());
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::default()));
            }
        }

        let recalculated_masks = self.recalculate_and_save_overlays(txn, &mut recalculate);
        mutated_fields.extend(recalculated_masks);
        documents.extend(recalculate);

        documents
            .into_iter()
            .map(|(key, document)| {
                let mask = mutated_fields.remove(&key).flatten();
                (
                    key,
                    OverlayedDocument {
                        overlayed_document: document,
                        mutated_fields: mask,
                    },
                )
            })
            .collect()
    }

    /// Replays the mutation queue over `documents` and stores the resulting overlays.
    ///
    /// Each overlay is attributed to the newest batch touching its document. Returns the
    /// mutated field mask per document, `None` when the document was replaced.
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut MutableDocumentMap,
    ) -> BTreeMap<DocumentKey, Option<FieldMask>> {
        let keys: DocumentKeySet = documents.keys().cloned().collect();
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, &keys);

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, DocumentKeySet> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::default()));
                let mask = batch.apply_to_local_view(document, mask);
                masks.insert(key.clone(), mask);
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = DocumentKeySet::new();
        for (batch_id, keys) in keys_by_batch.iter().rev() {
            let mut overlays: BTreeMap<DocumentKey, Mutation> = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let (Some(document), Some(mask)) = (documents.get(key), masks.get(key)) else {
                    continue;
                };
                if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                    overlays.insert(key.clone(), mutation);
                }
            }
            self.document_overlay_cache.save_overlays(txn, *batch_id, &overlays);
        }
        masks
    }

    /// Recomputes overlays for `keys` from their remote documents.
    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &DocumentKeySet,
    ) {
        let mut documents = self.remote_document_cache.get_entries(txn, keys);
        self.recalculate_and_save_overlays(txn, &mut documents);
    }

    /// Every document matching `query` in the local view, past `offset`.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: IndexOffset,
        context: &mut QueryContext,
    ) -> DocumentMap {
        if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query)
        } else if let Some(collection_id) = query.collection_group_id() {
            let collection_id = collection_id.to_string();
            let mut results = DocumentMap::new();
            for parent in self.index_manager.get_collection_parents(txn, &collection_id) {
                let collection_query = query.as_collection_query_at_path(parent.child([collection_id.as_str()]));
                results.extend(self.get_documents_matching_collection_query(txn, &collection_query, offset, context));
            }
            results
        } else {
            self.get_documents_matching_collection_query(txn, query, offset, context)
        }
    }

    fn get_documents_matching_document_query(&self, txn: &PersistenceTransaction<'_>, query: &Query) -> DocumentMap {
        let mut results = DocumentMap::new();
        if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
            let document = self.get_document(txn, &key);
            if document.is_found_document() {
                results.insert(key, document);
            }
        }
        results
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        offset: IndexOffset,
        context: &mut QueryContext,
    ) -> DocumentMap {
        let overlays =
            self.document_overlay_cache
                .get_overlays_for_collection(txn, query.path(), offset.largest_batch_id);
        let mutated_keys: DocumentKeySet = overlays.keys().cloned().collect();
        let mut remote_documents =
            self.remote_document_cache
                .get_documents_matching_query(txn, query, offset.read_time, &mutated_keys, context);

        // Documents may only match because of their overlay.
        for key in overlays.keys() {
            remote_documents
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
        }

        let mut results = DocumentMap::new();
        for (key, mut document) in remote_documents {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::default()), Timestamp::now());
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::User;
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, TransactionMode};
    use crate::firestore::model::{FieldPath, Precondition, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    fn map(entries: &[(&str, i64)]) -> MapValue {
        let mut data = MapValue::empty();
        for (name, value) in entries {
            data.set(&field(name), FirestoreValue::from_integer(*value));
        }
        data
    }

    fn view() -> LocalDocumentsView {
        let index_manager = IndexManager::new();
        let user = User::new("alice");
        LocalDocumentsView::new(
            RemoteDocumentCache::new(index_manager),
            MutationQueue::for_user(&user, index_manager),
            DocumentOverlayCache::for_user(&user),
            index_manager,
        )
    }

    fn write(view: &LocalDocumentsView, txn: &mut PersistenceTransaction<'_>, mutations: Vec<Mutation>) {
        let batch = view
            .mutation_queue()
            .add_mutation_batch(txn, Timestamp::now(), Vec::new(), mutations);
        let keys = batch.keys();
        view.recalculate_and_save_overlays_for_document_keys(txn, &keys);
    }

    #[test]
    fn overlays_equal_replaying_batches_in_order() {
        let persistence = MemoryPersistence::new();
        let view = view();
        let document = run_transaction(&persistence, "write", TransactionMode::ReadWrite, |txn| {
            write(&view, txn, vec![Mutation::set(key("rooms/a"), map(&[("a", 1)]))]);
            write(
                &view,
                txn,
                vec![Mutation::patch(
                    key("rooms/a"),
                    map(&[("b", 2)]),
                    FieldMask::new([field("b")]),
                    Precondition::Exists(true),
                )],
            );
            let overlay = view.document_overlay_cache().get_overlay(txn, &key("rooms/a")).unwrap();
            assert_eq!(overlay.largest_batch_id, 2);
            Ok(view.get_document(txn, &key("rooms/a")))
        })
        .unwrap();
        assert!(document.is_found_document());
        assert!(document.has_local_mutations());
        assert_eq!(document.data(), &map(&[("a", 1), ("b", 2)]));
    }

    #[test]
    fn collection_query_includes_documents_matching_only_through_overlays() {
        let persistence = MemoryPersistence::new();
        let view = view();
        let cache = RemoteDocumentCache::new(IndexManager::new());
        let results = run_transaction(&persistence, "query", TransactionMode::ReadWrite, |txn| {
            let mut remote = MutableDocument::new_found_document(key("rooms/b"), SnapshotVersion::from_micros(1), map(&[("x", 1)]));
            remote.set_read_time(SnapshotVersion::from_micros(1));
            let mut buffer = cache.new_change_buffer();
            buffer.add_entry(remote);
            buffer.apply(txn);

            write(&view, txn, vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]))]);
            write(&view, txn, vec![Mutation::delete(key("rooms/b"))]);
            Ok(view.get_documents_matching_query(txn, &Query::collection("rooms").unwrap(), IndexOffset::none(), &mut QueryContext::default()))
        })
        .unwrap();
        let keys: Vec<&str> = results.keys().map(DocumentKey::id).collect();
        assert_eq!(keys, vec!["a"]);
    }

    #[test]
    fn collection_group_query_spans_parents() {
        let persistence = MemoryPersistence::new();
        let view = view();
        let results = run_transaction(&persistence, "query", TransactionMode::ReadWrite, |txn| {
            write(&view, txn, vec![Mutation::set(key("rooms/a/messages/1"), map(&[("x", 1)]))]);
            write(&view, txn, vec![Mutation::set(key("rooms/b/messages/2"), map(&[("x", 1)]))]);
            write(&view, txn, vec![Mutation::set(key("rooms/c"), map(&[("x", 1)]))]);
            Ok(view.get_documents_matching_query(txn, &Query::collection_group("messages"), IndexOffset::none(), &mut QueryContext::default()))
        })
        .unwrap();
        assert_eq!(results.len(), 2);
    }
}
