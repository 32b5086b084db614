use std::collections::BTreeMap;

use bytes::Bytes;

use crate::firestore::core::TargetId;
use crate::firestore::local::target_data::TargetPurpose;
use crate::firestore::model::{DocumentKeySet, MutableDocumentMap, SnapshotVersion};

/// One atomic batch of server changes, built by the watch change aggregator.
#[derive(Debug, Clone, Default)]
pub struct RemoteEvent {
    /// Version every document and target in the event is consistent with.
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter disagreed; they are re-listened with this purpose.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: MutableDocumentMap,
    /// Documents only referenced by limbo resolution targets.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    /// An event that only flips the `current` state of one target, used when a view has to
    /// be brought up to date without a server round trip.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Bytes,
    ) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current, resume_token),
        );
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_mismatches.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// What changed for one target since the previous event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server sent no new token.
    pub resume_token: Bytes,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn synthesized_for_current_change(current: bool, resume_token: Bytes) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn document_change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
