use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bytes::Bytes;

use crate::firestore::core::{DocumentChangeType, Query, Target, TargetId, User, ViewSnapshot};
use crate::firestore::error::{internal_error, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruDelegate, LruGarbageCollector, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{run_transaction, Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::query_engine::{QueryEngine, QueryEngineSettings};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::{RemoteDocumentCache, RemoteDocumentChangeBuffer};
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldIndex, FieldMask, MutableDocument, MutableDocumentMap,
    Mutation, MutationBatch, MutationBatchResult, Precondition, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};

/// A resume token older than this is persisted even if nothing else about the target changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug, PartialEq)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported as matching the query's target.
    pub remote_keys: DocumentKeySet,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Keys that entered or left a view, reported back so cached documents stay referenced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = DocumentKeySet::new();
        let mut removed_keys = DocumentKeySet::new();
        for change in &snapshot.doc_changes {
            match change.change_type {
                DocumentChangeType::Added => {
                    added_keys.insert(change.document.key().clone());
                }
                DocumentChangeType::Removed => {
                    removed_keys.insert(change.document.key().clone());
                }
                DocumentChangeType::Modified | DocumentChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}

/// The local half of the client: owns the caches, turns writes into batches and overlays,
/// applies watch events and answers queries from cache.
///
/// Every public operation runs in a single persistence transaction.
pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    index_manager: IndexManager,
    remote_document_cache: RemoteDocumentCache,
    target_cache: TargetCache,
    query_engine: QueryEngine,
    lru_delegate: LruDelegate,
    mutation_queue: MutationQueue,
    document_overlay_cache: DocumentOverlayCache,
    local_documents_view: LocalDocumentsView,
    /// Documents in active views; pins them against garbage collection.
    local_view_references: ReferenceSet,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: BTreeMap<String, TargetId>,
}

impl LocalStore {
    pub fn new(persistence: Arc<dyn Persistence>, query_engine_settings: QueryEngineSettings, user: &User) -> Self {
        let index_manager = IndexManager::new();
        let remote_document_cache = RemoteDocumentCache::new(index_manager);
        let target_cache = TargetCache::new();
        let mutation_queue = MutationQueue::for_user(user, index_manager);
        let document_overlay_cache = DocumentOverlayCache::for_user(user);
        let local_documents_view = LocalDocumentsView::new(
            remote_document_cache,
            mutation_queue.clone(),
            document_overlay_cache.clone(),
            index_manager,
        );
        Self {
            persistence,
            index_manager,
            remote_document_cache,
            target_cache,
            query_engine: QueryEngine::new(query_engine_settings, index_manager),
            lru_delegate: LruDelegate::new(target_cache, remote_document_cache),
            mutation_queue,
            document_overlay_cache,
            local_documents_view,
            local_view_references: ReferenceSet::new(),
            target_data_by_target: BTreeMap::new(),
            target_id_by_canonical_id: BTreeMap::new(),
        }
    }

    pub fn lru_delegate(&self) -> LruDelegate {
        self.lru_delegate
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    fn run<T, F>(&self, label: &str, mode: TransactionMode, body: F) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        run_transaction(self.persistence.as_ref(), label, mode, body)
    }

    /// Switches the mutation queue and overlays to `user`.
    ///
    /// Returns the documents whose local view may differ between the two users.
    pub fn handle_user_change(&mut self, user: &User) -> FirestoreResult<UserChangeResult> {
        let old_batches = self.run("Load old user's batches", TransactionMode::ReadOnly, |txn| {
            Ok(self.mutation_queue.get_all_mutation_batches(txn))
        })?;

        self.mutation_queue = MutationQueue::for_user(user, self.index_manager);
        self.document_overlay_cache = DocumentOverlayCache::for_user(user);
        self.local_documents_view = LocalDocumentsView::new(
            self.remote_document_cache,
            self.mutation_queue.clone(),
            self.document_overlay_cache.clone(),
            self.index_manager,
        );

        self.run("Handle user change", TransactionMode::ReadWrite, |txn| {
            let new_batches = self.mutation_queue.get_all_mutation_batches(txn);
            let mut changed_keys = DocumentKeySet::new();
            for batch in old_batches.iter().chain(new_batches.iter()) {
                changed_keys.extend(batch.keys());
            }
            let affected_documents = self.local_documents_view.get_documents(txn, &changed_keys);
            Ok(UserChangeResult {
                affected_documents,
                removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
            })
        })
    }

    /// Queues `mutations` as one batch and returns the new local view of the documents.
    pub fn local_write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations.iter().map(|mutation| mutation.key().clone()).collect();

        self.run("Locally write mutations", TransactionMode::ReadWrite, |txn| {
            let remote_documents = self.remote_document_cache.get_entries(txn, &keys);
            let documents_without_remote_version: DocumentKeySet = remote_documents
                .iter()
                .filter(|(_, document)| !document.is_valid_document())
                .map(|(key, _)| key.clone())
                .collect();
            let mut overlayed_documents = self
                .local_documents_view
                .get_overlayed_documents(txn, remote_documents);

            // Transforms like increments need the value they started from so that replaying
            // the batch after a remote update stays consistent.
            let mut base_mutations = Vec::new();
            for mutation in &mutations {
                let Some(overlayed) = overlayed_documents.get(mutation.key()) else {
                    continue;
                };
                if let Some(base_value) = mutation.extract_transform_base_value(&overlayed.overlayed_document) {
                    let mask = FieldMask::new(base_value.field_mask());
                    base_mutations.push(Mutation::patch(
                        mutation.key().clone(),
                        base_value,
                        mask,
                        Precondition::Exists(true),
                    ));
                }
            }

            let batch = self
                .mutation_queue
                .add_mutation_batch(txn, local_write_time, base_mutations, mutations.clone());
            let overlays = batch.apply_to_local_document_set(&mut overlayed_documents, &documents_without_remote_version);
            self.document_overlay_cache
                .save_overlays(txn, batch.batch_id, &overlays);

            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes: overlayed_documents
                    .into_iter()
                    .map(|(key, overlayed)| (key, overlayed.overlayed_document))
                    .collect(),
            })
        })
    }

    /// Applies the server's acknowledgement of a batch and removes it from the queue.
    pub fn acknowledge_batch(&mut self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        self.run("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
            let affected = batch_result.batch.keys();
            let mut buffer = self.remote_document_cache.new_change_buffer();
            self.apply_write_to_remote_documents(txn, batch_result, &mut buffer)?;
            buffer.apply(txn);
            self.mutation_queue.perform_consistency_check(txn);
            self.document_overlay_cache
                .remove_overlays_for_batch_id(txn, &affected, batch_result.batch.batch_id);
            self.local_documents_view
                .recalculate_and_save_overlays_for_document_keys(txn, &keys_with_transform_results(batch_result));
            Ok(self.local_documents_view.get_documents(txn, &affected))
        })
    }

    fn apply_write_to_remote_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_result: &MutationBatchResult,
        buffer: &mut RemoteDocumentChangeBuffer,
    ) -> FirestoreResult<()> {
        let batch = &batch_result.batch;
        for key in batch.keys() {
            let mut document = buffer.get_entry(txn, &key);
            let ack_version = batch_result
                .doc_versions
                .get(&key)
                .copied()
                .ok_or_else(|| internal_error(format!("acknowledged batch {} has no version for {key}", batch.batch_id)))?;
            // A newer remote version already reflects this write.
            if document.version() < ack_version {
                batch.apply_to_remote_document(&mut document, batch_result);
                if document.is_valid_document() {
                    document.set_read_time(batch_result.commit_version);
                    buffer.add_entry(document);
                }
            }
        }
        self.mutation_queue.remove_mutation_batch(txn, batch);
        self.mutation_queue
            .set_last_stream_token(txn, batch_result.stream_token.clone());
        for key in batch.keys() {
            self.lru_delegate.remove_mutation_reference(txn, &key);
        }
        Ok(())
    }

    /// Drops a batch the backend refused and restores the affected documents' local view.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        self.run("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
            let batch = self
                .mutation_queue
                .lookup_mutation_batch(txn, batch_id)
                .ok_or_else(|| internal_error(format!("attempt to reject nonexistent batch {batch_id}")))?;
            let affected = batch.keys();
            self.mutation_queue.remove_mutation_batch(txn, &batch);
            for key in &affected {
                self.lru_delegate.remove_mutation_reference(txn, key);
            }
            self.mutation_queue.perform_consistency_check(txn);
            self.document_overlay_cache
                .remove_overlays_for_batch_id(txn, &affected, batch_id);
            self.local_documents_view
                .recalculate_and_save_overlays_for_document_keys(txn, &affected);
            Ok(self.local_documents_view.get_documents(txn, &affected))
        })
    }

    /// The largest batch id still awaiting acknowledgement, or [`BATCH_ID_UNKNOWN`].
    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        self.run("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
            Ok(self.mutation_queue.get_highest_unacknowledged_batch_id(txn))
        })
    }

    /// The first queued batch after `after_batch_id`, for the write pipeline.
    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.run("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
            Ok(self.mutation_queue.get_next_mutation_batch_after_batch_id(txn, after))
        })
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Bytes> {
        self.run("Get last stream token", TransactionMode::ReadOnly, |txn| {
            Ok(self.mutation_queue.last_stream_token(txn))
        })
    }

    pub fn set_last_stream_token(&mut self, token: Bytes) -> FirestoreResult<()> {
        self.run("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
            self.mutation_queue.set_last_stream_token(txn, token.clone());
            Ok(())
        })
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.run("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
            Ok(self.target_cache.get_last_remote_snapshot_version(txn))
        })
    }

    /// Applies a watch event and returns the new local view of every changed document.
    ///
    /// Remote versions never regress: an update only replaces a cached entry when it is
    /// newer, or equally new while the cached entry still carries pending writes.
    pub fn apply_remote_event(&mut self, remote_event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let remote_version = remote_event.snapshot_version;

        let (documents, updated_targets) = self.run("Apply remote event", TransactionMode::ReadWritePrimary, |txn| {
            let mut updated_targets = BTreeMap::new();
            for (target_id, change) in &remote_event.target_changes {
                let Some(old_target_data) = self.target_data_by_target.get(target_id) else {
                    continue;
                };

                self.target_cache
                    .remove_matching_keys(txn, &change.removed_documents, *target_id);
                for key in &change.removed_documents {
                    self.lru_delegate.remove_reference(txn, key);
                }
                self.target_cache
                    .add_matching_keys(txn, &change.added_documents, *target_id);
                for key in &change.added_documents {
                    self.lru_delegate.add_reference(txn, key);
                }

                let mut new_target_data = old_target_data.with_sequence_number(txn.current_sequence_number());
                if remote_event.target_mismatches.contains_key(target_id) {
                    new_target_data = new_target_data
                        .with_resume_token(Bytes::new(), SnapshotVersion::min())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                } else if !change.resume_token.is_empty() {
                    new_target_data = new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
                }

                if should_persist_target_data(old_target_data, &new_target_data, change) {
                    self.target_cache.update_target_data(txn, &new_target_data);
                }
                updated_targets.insert(*target_id, new_target_data);
            }

            for key in remote_event.document_updates.keys() {
                if remote_event.resolved_limbo_documents.contains(key) {
                    self.lru_delegate.update_limbo_document(txn, key);
                }
            }

            let mut buffer = self.remote_document_cache.new_change_buffer();
            let (changed_documents, existence_changed) =
                populate_document_change_buffer(txn, &mut buffer, &remote_event.document_updates);

            if !remote_version.is_min() {
                let last_remote_version = self.target_cache.get_last_remote_snapshot_version(txn);
                assert!(
                    remote_version >= last_remote_version,
                    "watch stream reverted to previous snapshot ({remote_version} < {last_remote_version})"
                );
                self.target_cache
                    .set_last_remote_snapshot_version(txn, remote_version);
            }

            buffer.apply(txn);
            let documents = self
                .local_documents_view
                .get_local_view_of_documents(txn, changed_documents, &existence_changed);
            Ok((documents, updated_targets))
        })?;

        self.target_data_by_target.extend(updated_targets);
        Ok(documents)
    }

    /// Returns the cached target data for `target`, allocating a new target id if needed.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let target_data = self.run("Allocate target", TransactionMode::ReadWrite, |txn| {
            if let Some(cached) = self.target_cache.get_target_data(txn, &target) {
                return Ok(cached);
            }
            let target_id = self.target_cache.allocate_target_id(txn);
            let target_data = TargetData::new(
                target.clone(),
                target_id,
                TargetPurpose::Listen,
                txn.current_sequence_number(),
            );
            self.target_cache.add_target_data(txn, &target_data);
            Ok(target_data)
        })?;

        let target_id = target_data.target_id;
        let is_newer = self
            .target_data_by_target
            .get(&target_id)
            .map_or(true, |existing| target_data.snapshot_version > existing.snapshot_version);
        if is_newer {
            self.target_id_by_canonical_id
                .insert(target.canonical_id(), target_id);
            self.target_data_by_target.insert(target_id, target_data.clone());
        }
        log::debug!("allocated target {target_id} for {}", target.canonical_id());
        Ok(target_data)
    }

    /// Stops tracking an active target. Unless `keep_persisted_target_data` is set, the
    /// target's sequence number is bumped so the garbage collector ages it from now.
    ///
    /// Fails with `Internal` if `target_id` is not active.
    pub fn release_target(&mut self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let target_data = self
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .ok_or_else(|| internal_error(format!("tried to release nonexistent target: {target_id}")))?;

        let removed_references = self.local_view_references.remove_references_for_id(target_id);
        if !keep_persisted_target_data {
            let outcome = self.run("Release target", TransactionMode::ReadWritePrimary, |txn| {
                for key in &removed_references {
                    self.lru_delegate.remove_reference(txn, key);
                }
                self.lru_delegate.remove_target(txn, &target_data);
                Ok(())
            });
            match outcome {
                Ok(()) => {}
                Err(err) if err.code == FirestoreErrorCode::FailedPrecondition => {
                    log::warn!("failed to update sequence numbers for target {target_id}: {err}");
                }
                Err(err) => return Err(err),
            }
        }

        self.target_data_by_target.remove(&target_id);
        let canonical_id = target_data.target.canonical_id();
        if self.target_id_by_canonical_id.get(&canonical_id) == Some(&target_id) {
            self.target_id_by_canonical_id.remove(&canonical_id);
        }
        log::debug!("released target {target_id}");
        Ok(())
    }

    /// Runs `query` against the local cache.
    ///
    /// With `use_previous_results` the query engine may start from the documents that matched
    /// at the target's last limbo-free snapshot.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        self.run("Execute query", TransactionMode::ReadWrite, |txn| {
            let target_data = self.get_target_data_in_txn(txn, &query.to_target());
            let (last_limbo_free_snapshot_version, remote_keys) = match &target_data {
                Some(target_data) => (
                    target_data.last_limbo_free_snapshot_version,
                    self.target_cache
                        .get_matching_keys_for_target_id(txn, target_data.target_id),
                ),
                None => (SnapshotVersion::min(), DocumentKeySet::new()),
            };

            let (since, previous_keys) = if use_previous_results {
                (last_limbo_free_snapshot_version, remote_keys.clone())
            } else {
                (SnapshotVersion::min(), DocumentKeySet::new())
            };
            let documents = self.query_engine.get_documents_matching_query(
                txn,
                &self.local_documents_view,
                query,
                since,
                &previous_keys,
            );
            Ok(QueryResult { documents, remote_keys })
        })
    }

    /// Records which documents entered and left each view, pinning them in the cache and
    /// advancing the last limbo-free snapshot of views that are in sync with the server.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let outcome = self.run("Notify local view changes", TransactionMode::ReadWrite, |txn| {
            for change in view_changes {
                for key in &change.added_keys {
                    self.lru_delegate.add_reference(txn, key);
                }
                for key in &change.removed_keys {
                    self.lru_delegate.remove_reference(txn, key);
                }
            }
            Ok(())
        });
        match outcome {
            Ok(()) => {}
            Err(err) if err.code == FirestoreErrorCode::FailedPrecondition => {
                log::warn!("failed to update sequence numbers: {err}");
            }
            Err(err) => return Err(err),
        }

        for change in view_changes {
            self.local_view_references
                .add_references(&change.added_keys, change.target_id);
            self.local_view_references
                .remove_references(&change.removed_keys, change.target_id);

            if !change.from_cache {
                if let Some(target_data) = self.target_data_by_target.get(&change.target_id) {
                    let updated = target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                    self.target_data_by_target.insert(change.target_id, updated);
                }
            }
        }
        Ok(())
    }

    /// The local view of one document; an invalid placeholder if nothing is known about it.
    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.run("Read document", TransactionMode::ReadOnly, |txn| {
            Ok(self.local_documents_view.get_document(txn, key))
        })
    }

    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        self.run("Get target data", TransactionMode::ReadOnly, |txn| {
            Ok(self.get_target_data_in_txn(txn, target))
        })
    }

    fn get_target_data_in_txn(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> Option<TargetData> {
        self.target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
            .cloned()
            .or_else(|| self.target_cache.get_target_data(txn, target))
    }

    pub fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        self.run("Get remote document keys", TransactionMode::ReadOnly, |txn| {
            Ok(self.target_cache.get_matching_keys_for_target_id(txn, target_id))
        })
    }

    /// Replaces the configured field indexes with `indexes`.
    pub fn configure_field_indexes(&mut self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.run("Configure field indexes", TransactionMode::ReadWrite, |txn| {
            let existing = self.index_manager.get_field_indexes(txn, None);
            for index in &existing {
                if !indexes.iter().any(|candidate| candidate.same_definition(index)) {
                    self.index_manager.delete_field_index(txn, index.index_id);
                }
            }
            for index in &indexes {
                if !existing.iter().any(|current| current.same_definition(index)) {
                    self.index_manager.add_field_index(txn, index.clone());
                }
            }
            Ok(())
        })
    }

    pub fn collect_garbage(&mut self, garbage_collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let active_target_ids: BTreeSet<TargetId> = self.target_data_by_target.keys().copied().collect();
        self.run("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
            Ok(garbage_collector.collect(txn, &active_target_ids, &self.local_view_references))
        })
    }
}

fn keys_with_transform_results(batch_result: &MutationBatchResult) -> DocumentKeySet {
    batch_result
        .batch
        .mutations
        .iter()
        .zip(batch_result.mutation_results.iter())
        .filter(|(_, result)| !result.transform_results.is_empty())
        .map(|(mutation, _)| mutation.key().clone())
        .collect()
}

/// Whether updated target data should be written through instead of kept in memory only.
fn should_persist_target_data(old_target_data: &TargetData, new_target_data: &TargetData, change: &TargetChange) -> bool {
    if old_target_data.resume_token.is_empty() {
        return true;
    }
    let time_delta = new_target_data.snapshot_version.to_micros() - old_target_data.snapshot_version.to_micros();
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.document_change_count() > 0
}

/// Adds the newer of each update to `buffer`.
///
/// Returns the accepted documents and the keys whose existence flipped.
fn populate_document_change_buffer(
    txn: &PersistenceTransaction<'_>,
    buffer: &mut RemoteDocumentChangeBuffer,
    documents: &MutableDocumentMap,
) -> (MutableDocumentMap, DocumentKeySet) {
    let existing_documents = buffer.get_entries(txn, documents.keys());
    let mut changed = MutableDocumentMap::new();
    let mut existence_changed = DocumentKeySet::new();

    for (key, document) in documents {
        let existing = existing_documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()));

        if document.is_found_document() != existing.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // Deleted without a known version, e.g. after a limbo resolution found nothing.
            buffer.remove_entry(key, document.read_time());
            changed.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            debug_assert!(
                !document.read_time().is_min(),
                "cannot add a document when the remote version is zero"
            );
            buffer.add_entry(document.clone());
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "ignoring outdated watch update for {key}; current version {} >= {}",
                existing.version(),
                document.version()
            );
        }
    }
    (changed, existence_changed)
}
