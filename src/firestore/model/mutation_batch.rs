use std::collections::BTreeMap;

use bytes::Bytes;

use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, DocumentKeySet, FieldMask, MutableDocument, Mutation,
    MutationResult, SnapshotVersion, Timestamp,
};

pub type BatchId = i32;

/// Marks "no batch"; real batch ids start at 1.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// An ordered group of writes applied atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Writes that capture the state transforms started from; they are never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

/// A document with the latency-compensated view applied, plus the fields the overlay touched.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub overlayed_document: MutableDocument,
    /// `None` when the whole document was replaced.
    pub mutated_fields: Option<FieldMask>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies the acknowledged results to the remote copy of `document`.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationBatchResult) {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if mutation.key() != document.key() {
                continue;
            }
            if let Some(mutation_result) = result.mutation_results.get(index) {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    /// Replays base mutations and then the user mutations touching `document`.
    pub fn apply_to_local_view(&self, document: &mut MutableDocument, mutated_fields: Option<FieldMask>) -> Option<FieldMask> {
        let mut mutated_fields = mutated_fields;
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == document.key() {
                mutated_fields = mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies this batch to every overlayed document and computes the resulting overlays.
    ///
    /// Keys in `documents_without_remote_version` only exist locally, so their overlay is a
    /// full set or delete instead of a patch.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(entry) = documents.get_mut(&key) else {
                continue;
            };
            let mutated_fields =
                self.apply_to_local_view(&mut entry.overlayed_document, entry.mutated_fields.take());
            entry.mutated_fields = if documents_without_remote_version.contains(&key) {
                None
            } else {
                mutated_fields
            };
            if let Some(overlay) =
                calculate_overlay_mutation(&entry.overlayed_document, entry.mutated_fields.as_ref())
            {
                overlays.insert(key.clone(), overlay);
            }
            if !entry.overlayed_document.is_valid_document() {
                entry.overlayed_document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations.iter().map(|mutation| mutation.key().clone()).collect()
    }
}

/// The server's acknowledgement of a whole batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Bytes,
    /// Version each written document was committed at.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Bytes,
    ) -> Self {
        assert_eq!(
            batch.mutations.len(),
            mutation_results.len(),
            "mutations sent {} must equal results received {}",
            batch.mutations.len(),
            mutation_results.len()
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(value));
        map
    }

    #[test]
    fn local_view_ignores_other_documents() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![Mutation::set(key("rooms/a"), data("x", 1))],
        );
        let mut other = MutableDocument::new_invalid_document(key("rooms/b"));
        let mask = batch.apply_to_local_view(&mut other, Some(FieldMask::default()));
        assert_eq!(mask, Some(FieldMask::default()));
        assert!(!other.is_valid_document());
    }

    #[test]
    fn new_documents_produce_set_overlays() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![Mutation::patch(
                key("rooms/a"),
                data("x", 1),
                FieldMask::new(vec![FieldPath::from_dot_separated("x").unwrap()]),
                crate::firestore::model::Precondition::None,
            )],
        );
        let mut documents = BTreeMap::new();
        documents.insert(
            key("rooms/a"),
            OverlayedDocument {
                overlayed_document: MutableDocument::new_invalid_document(key("rooms/a")),
                mutated_fields: Some(FieldMask::default()),
            },
        );
        let without_remote: DocumentKeySet = [key("rooms/a")].into_iter().collect();
        let overlays = batch.apply_to_local_document_set(&mut documents, &without_remote);
        assert!(matches!(overlays.get(&key("rooms/a")), Some(Mutation::Set { .. })));
    }

    #[test]
    #[should_panic(expected = "must equal results received")]
    fn result_count_must_match() {
        let batch = MutationBatch::new(1, Timestamp::new(1, 0), Vec::new(), vec![Mutation::delete(key("rooms/a"))]);
        MutationBatchResult::from(batch, SnapshotVersion::min(), Vec::new(), Bytes::new());
    }
}
