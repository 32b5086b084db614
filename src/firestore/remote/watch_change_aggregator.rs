use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::firestore::core::TargetId;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, DocumentKeySet, MutableDocument, MutableDocumentMap, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local cache currently associates with `target_id`.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// The target data for an active target, `None` once it has been unlistened.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Per-target bookkeeping between two snapshots.
#[derive(Debug)]
struct TargetState {
    /// Listen and unlisten requests the server has not answered yet. Changes for a target
    /// with outstanding requests are dropped.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Bytes,
    current: bool,
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Bytes::new(),
            current: false,
            // A fresh target always produces a change so that `current` propagates.
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &Bytes) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        assert!(
            self.pending_responses >= 0,
            "received more target responses than requests were sent"
        );
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes until the server marks a consistent snapshot, then emits
/// them as one [`RemoteEvent`].
#[derive(Debug)]
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: MutableDocumentMap,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: MutableDocumentMap::new(),
            pending_document_updates_by_target: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange, metadata: &dyn TargetMetadataProvider) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone(), metadata);
                }
                other => {
                    self.remove_document_from_target(*target_id, &change.key, other.clone(), metadata);
                }
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.new_doc.clone(), metadata);
        }
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange, metadata: &dyn TargetMetadataProvider) {
        for target_id in self.affected_targets(change, metadata) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A re-added target starts over from the server's view.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    debug_assert!(change.cause.is_none(), "rejected targets are handled before aggregation");
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(&self, change: &WatchTargetChange, metadata: &dyn TargetMetadataProvider) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, metadata))
            .collect()
    }

    /// Compares the server's count with the local one and schedules a requery when they
    /// disagree and the bloom filter cannot account for the difference.
    pub fn handle_existence_filter(&mut self, change: &ExistenceFilterChange, metadata: &dyn TargetMetadataProvider) {
        let target_id = change.target_id;
        let expected_count = change.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        let target = &target_data.target;
        if target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted while the client was not listening.
                if let Ok(key) = DocumentKey::from_path(target.path.clone()) {
                    let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
                }
            } else {
                assert_eq!(expected_count, 1, "single document existence filter with count {expected_count}");
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id, metadata);
        if current_count == expected_count as i64 {
            return;
        }

        let application = match self.parse_bloom_filter(change) {
            Some(bloom_filter) => self.apply_bloom_filter(&bloom_filter, change, current_count, metadata),
            None => BloomFilterApplication::Skipped,
        };
        if application != BloomFilterApplication::Success {
            self.reset_target(target_id, metadata);
            let purpose = if application == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            log::debug!(
                "existence filter mismatch for target {target_id}: expected {expected_count}, have {current_count}; \
                 resetting with {purpose:?}"
            );
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn parse_bloom_filter(&self, change: &ExistenceFilterChange) -> Option<BloomFilter> {
        let params = change.unchanged_names.as_ref()?;
        match BloomFilter::from_params(params) {
            Ok(filter) if filter.bit_count() > 0 => Some(filter),
            Ok(_) => None,
            Err(err) => {
                log::warn!("ignoring unusable bloom filter for target {}: {err}", change.target_id);
                None
            }
        }
    }

    fn apply_bloom_filter(
        &mut self,
        bloom_filter: &BloomFilter,
        change: &ExistenceFilterChange,
        current_count: i64,
        metadata: &dyn TargetMetadataProvider,
    ) -> BloomFilterApplication {
        let removed = self.filter_removed_documents(bloom_filter, change.target_id, metadata);
        if change.count as i64 == current_count - removed as i64 {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes cached keys the bloom filter proves the server no longer holds.
    fn filter_removed_documents(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let mut removed = 0;
        for key in metadata.get_remote_keys_for_target(target_id) {
            let name = self.database_id.document_name(&key);
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, &key, None, metadata);
                removed += 1;
            }
        }
        removed
    }

    /// Flushes every accumulated change as one event consistent at `snapshot_version`.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion, metadata: &dyn TargetMetadataProvider) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map_or(false, |state| state.current);
            if current && target_data.target.is_document_target() {
                // A current document target that never received its document means the
                // document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    let updated_here = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .map_or(false, |targets| targets.contains(&target_id));
                    if !updated_here && !self.target_contains_document(target_id, &key, metadata) {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted), metadata);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, metadata)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(&mut self, target_id: TargetId, document: MutableDocument, metadata: &dyn TargetMetadataProvider) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The document entered and left the target within one snapshot.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Counts one outstanding listen or unlisten request for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> i64 {
        let change = self.ensure_target_state(target_id).to_target_change();
        metadata.get_remote_keys_for_target(target_id).len() as i64 + change.added_documents.len() as i64
            - change.removed_documents.len() as i64
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, metadata).is_some()
    }

    fn target_data_for_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }

    /// Drops all changes for `target_id` and removes every document the cache associates
    /// with it, so the next snapshot rebuilds the target from scratch.
    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        assert!(
            !self.target_states.get(&target_id).map_or(false, TargetState::is_pending),
            "should only reset active targets"
        );
        self.target_states.insert(target_id, TargetState::default());
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey, metadata: &dyn TargetMetadataProvider) -> bool {
        metadata.get_remote_keys_for_target(target_id).contains(key)
    }
}
