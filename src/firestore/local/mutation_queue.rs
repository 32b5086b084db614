use std::collections::BTreeSet;

use bytes::Bytes;

use crate::firestore::core::{Query, User};
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::persistence::{MutationQueueMetadata, PersistenceTransaction};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};

/// The queue of a user's locally written batches that the backend has not acknowledged.
///
/// Batch ids increase monotonically per user and are never reused, even after the
/// queue drains.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_id: String,
    index_manager: IndexManager,
}

impl MutationQueue {
    pub fn for_user(user: &User, index_manager: IndexManager) -> Self {
        Self {
            user_id: user.to_key(),
            index_manager,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn metadata(&self, txn: &PersistenceTransaction<'_>) -> MutationQueueMetadata {
        txn.tables()
            .mutation_queues
            .get(&self.user_id)
            .cloned()
            .unwrap_or_else(|| MutationQueueMetadata {
                next_batch_id: 1,
                last_stream_token: Bytes::new(),
            })
    }

    pub fn is_empty(&self, txn: &PersistenceTransaction<'_>) -> bool {
        self.batches(txn).next().is_none()
    }

    /// Appends a new batch. Never fails for local reasons.
    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        debug_assert!(!mutations.is_empty(), "mutation batches should not be empty");
        let mut metadata = self.metadata(txn);
        let batch_id = metadata.next_batch_id;
        metadata.next_batch_id += 1;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        let tables = txn.tables_mut();
        tables.mutation_queues.insert(self.user_id.clone(), metadata);
        tables
            .mutation_batches
            .insert((self.user_id.clone(), batch_id), batch.clone());
        for mutation in &batch.mutations {
            tables
                .document_mutations
                .insert((self.user_id.clone(), mutation.key().clone(), batch_id), ());
        }
        for mutation in &batch.mutations {
            self.index_manager
                .add_to_collection_parent_index(txn, &mutation.key().collection_path());
        }
        batch
    }

    pub fn lookup_mutation_batch(&self, txn: &PersistenceTransaction<'_>, batch_id: BatchId) -> Option<MutationBatch> {
        txn.tables()
            .mutation_batches
            .get(&(self.user_id.clone(), batch_id))
            .cloned()
    }

    /// The first batch with an id greater than `batch_id`; pass [`BATCH_ID_UNKNOWN`] for the head.
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> Option<MutationBatch> {
        self.batches(txn)
            .find(|batch| batch.batch_id > batch_id)
            .cloned()
    }

    pub fn get_highest_unacknowledged_batch_id(&self, txn: &PersistenceTransaction<'_>) -> BatchId {
        self.batches(txn)
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn get_all_mutation_batches(&self, txn: &PersistenceTransaction<'_>) -> Vec<MutationBatch> {
        self.batches(txn).cloned().collect()
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> Vec<MutationBatch> {
        let mut keys = DocumentKeySet::new();
        keys.insert(key.clone());
        self.get_all_mutation_batches_affecting_document_keys(txn, &keys)
    }

    /// Batches touching any of `keys`, in ascending batch id order.
    pub fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: &DocumentKeySet,
    ) -> Vec<MutationBatch> {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            batch_ids.extend(self.batch_ids_for_key(txn, key));
        }
        self.resolve_batches(txn, batch_ids)
    }

    /// Batches touching documents a collection or document query could match.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> Vec<MutationBatch> {
        debug_assert!(
            !query.is_collection_group_query(),
            "collection group queries are resolved per collection"
        );
        let path = query.path();
        if DocumentKey::is_document_key(path) {
            return match DocumentKey::from_path(path.clone()) {
                Ok(key) => self.get_all_mutation_batches_affecting_document_key(txn, &key),
                Err(_) => Vec::new(),
            };
        }

        let start = (self.user_id.clone(), DocumentKey::prefix_start(path), BATCH_ID_UNKNOWN);
        let batch_ids: BTreeSet<BatchId> = txn
            .tables()
            .document_mutations
            .range(start..)
            .take_while(|((user_id, key, _), _)| *user_id == self.user_id && path.is_prefix_of(key.path()))
            .filter(|((_, key, _), _)| path.is_immediate_parent_of(key.path()))
            .map(|((_, _, batch_id), _)| *batch_id)
            .collect();
        self.resolve_batches(txn, batch_ids)
    }

    /// Removes an acknowledged or rejected batch. The batch must be the head of the queue.
    pub fn remove_mutation_batch(&self, txn: &mut PersistenceTransaction<'_>, batch: &MutationBatch) {
        let head = self.batches(txn).next().map(|head| head.batch_id);
        assert_eq!(
            head,
            Some(batch.batch_id),
            "can only remove the first entry of the mutation queue"
        );
        let tables = txn.tables_mut();
        tables
            .mutation_batches
            .remove(&(self.user_id.clone(), batch.batch_id));
        for mutation in &batch.mutations {
            tables
                .document_mutations
                .remove(&(self.user_id.clone(), mutation.key().clone(), batch.batch_id));
        }
    }

    /// Whether any user's queue still references `key`.
    pub fn any_queue_contains_key(txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
        txn.tables()
            .mutation_queues
            .iter()
            .any(|(user_id, _)| {
                let start = (user_id.clone(), key.clone(), BATCH_ID_UNKNOWN);
                txn.tables()
                    .document_mutations
                    .range(start..)
                    .next()
                    .map(|((owner, candidate, _), _)| owner == user_id && candidate == key)
                    .unwrap_or(false)
            })
    }

    pub fn last_stream_token(&self, txn: &PersistenceTransaction<'_>) -> Bytes {
        self.metadata(txn).last_stream_token
    }

    pub fn set_last_stream_token(&self, txn: &mut PersistenceTransaction<'_>, token: Bytes) {
        let mut metadata = self.metadata(txn);
        metadata.last_stream_token = token;
        txn.tables_mut().mutation_queues.insert(self.user_id.clone(), metadata);
    }

    /// Verifies the key index is empty whenever the queue is.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction<'_>) {
        if !self.is_empty(txn) {
            return;
        }
        let start = (self.user_id.clone(), DocumentKey::empty(), BATCH_ID_UNKNOWN);
        let dangling = txn
            .tables()
            .document_mutations
            .range(start..)
            .take_while(|((user_id, _, _), _)| *user_id == self.user_id)
            .count();
        assert_eq!(dangling, 0, "document leak: mutation index references removed batches");
    }

    fn batches<'t>(&'t self, txn: &'t PersistenceTransaction<'_>) -> impl Iterator<Item = &'t MutationBatch> + 't {
        let start = (self.user_id.clone(), BATCH_ID_UNKNOWN);
        txn.tables()
            .mutation_batches
            .range(start..)
            .take_while(move |((user_id, _), _)| *user_id == self.user_id)
            .map(|(_, batch)| batch)
    }

    fn batch_ids_for_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> Vec<BatchId> {
        let start = (self.user_id.clone(), key.clone(), BATCH_ID_UNKNOWN);
        txn.tables()
            .document_mutations
            .range(start..)
            .take_while(|((user_id, candidate, _), _)| *user_id == self.user_id && candidate == key)
            .map(|((_, _, batch_id), _)| *batch_id)
            .collect()
    }

    fn resolve_batches(&self, txn: &PersistenceTransaction<'_>, batch_ids: BTreeSet<BatchId>) -> Vec<MutationBatch> {
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.lookup_mutation_batch(txn, batch_id))
            .collect()
    }
}
