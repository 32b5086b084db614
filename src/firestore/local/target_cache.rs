use std::collections::BTreeSet;

use crate::firestore::core::{Target, TargetId, TargetIdGenerator};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::target_data::{ListenSequenceNumber, TargetData};
use crate::firestore::model::{DocumentKey, DocumentKeySet, SnapshotVersion};

/// Shared metadata about every target the client has listened to, plus the keys that
/// matched each target at its last snapshot.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn new() -> Self {
        Self
    }

    pub fn get_last_remote_snapshot_version(&self, txn: &PersistenceTransaction<'_>) -> SnapshotVersion {
        txn.tables().target_globals.get().last_remote_snapshot_version
    }

    pub fn set_last_remote_snapshot_version(&self, txn: &mut PersistenceTransaction<'_>, version: SnapshotVersion) {
        txn.tables_mut()
            .target_globals
            .update(|globals| globals.last_remote_snapshot_version = version);
    }

    pub fn get_highest_sequence_number(&self, txn: &PersistenceTransaction<'_>) -> ListenSequenceNumber {
        txn.tables().target_globals.get().highest_listen_sequence_number
    }

    /// Next even target id; ids are never reused.
    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction<'_>) -> TargetId {
        let mut target_id = 0;
        txn.tables_mut().target_globals.update(|globals| {
            target_id = TargetIdGenerator::for_target_cache(globals.highest_target_id).next_id();
            globals.highest_target_id = target_id;
        });
        target_id
    }

    pub fn get_target_count(&self, txn: &PersistenceTransaction<'_>) -> usize {
        txn.tables().targets.len()
    }

    /// The cached data for a target with the same canonical id, if any.
    pub fn get_target_data(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> Option<TargetData> {
        let tables = txn.tables();
        let target_id = tables.targets_by_canonical_id.get(&target.canonical_id())?;
        tables
            .targets
            .get(target_id)
            .filter(|data| data.target == *target)
            .cloned()
    }

    pub fn get_target_data_for_id(&self, txn: &PersistenceTransaction<'_>, target_id: TargetId) -> Option<TargetData> {
        txn.tables().targets.get(&target_id).cloned()
    }

    pub fn add_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) {
        debug_assert!(
            !txn.tables().targets.contains(&target_data.target_id),
            "target {} is already cached",
            target_data.target_id
        );
        self.save_target_data(txn, target_data);
    }

    pub fn update_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) {
        self.save_target_data(txn, target_data);
    }

    fn save_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) {
        let tables = txn.tables_mut();
        tables
            .targets_by_canonical_id
            .insert(target_data.target.canonical_id(), target_data.target_id);
        tables.targets.insert(target_data.target_id, target_data.clone());
        let target_id = target_data.target_id;
        let sequence_number = target_data.sequence_number;
        tables.target_globals.update(|globals| {
            globals.highest_target_id = globals.highest_target_id.max(target_id);
            globals.highest_listen_sequence_number = globals.highest_listen_sequence_number.max(sequence_number);
        });
    }

    /// Deletes a target and its matching keys.
    pub fn remove_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) {
        let target_id = target_data.target_id;
        self.remove_matching_keys_for_target_id(txn, target_id);
        let tables = txn.tables_mut();
        tables.targets.remove(&target_id);
        let canonical_id = target_data.target.canonical_id();
        if tables.targets_by_canonical_id.get(&canonical_id) == Some(&target_id) {
            tables.targets_by_canonical_id.remove(&canonical_id);
        }
    }

    /// Removes inactive targets whose sequence number is at or below `upper_bound`.
    ///
    /// Returns the number of targets removed.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        let doomed: Vec<TargetData> = txn
            .tables()
            .targets
            .iter()
            .map(|(_, data)| data)
            .filter(|data| data.sequence_number <= upper_bound && !active_target_ids.contains(&data.target_id))
            .cloned()
            .collect();
        for target_data in &doomed {
            self.remove_target_data(txn, target_data);
        }
        doomed.len()
    }

    /// Every cached target; used by the garbage collector to walk sequence numbers.
    pub fn for_each_target(&self, txn: &PersistenceTransaction<'_>, mut visit: impl FnMut(&TargetData)) {
        for (_, target_data) in txn.tables().targets.iter() {
            visit(target_data);
        }
    }

    pub fn add_matching_keys<'k, I>(&self, txn: &mut PersistenceTransaction<'_>, keys: I, target_id: TargetId)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let tables = txn.tables_mut();
        for key in keys {
            tables.target_documents.insert((target_id, key.clone()), ());
            tables.document_targets.insert((key.clone(), target_id), ());
        }
    }

    pub fn remove_matching_keys<'k, I>(&self, txn: &mut PersistenceTransaction<'_>, keys: I, target_id: TargetId)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let tables = txn.tables_mut();
        for key in keys {
            tables.target_documents.remove(&(target_id, key.clone()));
            tables.document_targets.remove(&(key.clone(), target_id));
        }
    }

    pub fn remove_matching_keys_for_target_id(&self, txn: &mut PersistenceTransaction<'_>, target_id: TargetId) {
        let keys = self.get_matching_keys_for_target_id(txn, target_id);
        self.remove_matching_keys(txn, &keys, target_id);
    }

    pub fn get_matching_keys_for_target_id(&self, txn: &PersistenceTransaction<'_>, target_id: TargetId) -> DocumentKeySet {
        txn.tables()
            .target_documents
            .range((target_id, DocumentKey::empty())..)
            .take_while(|((id, _), _)| *id == target_id)
            .map(|((_, key), _)| key.clone())
            .collect()
    }

    /// Whether any target still references `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> bool {
        txn.tables()
            .document_targets
            .range((key.clone(), TargetId::MIN)..)
            .next()
            .map(|((candidate, _), _)| candidate == key)
            .unwrap_or(false)
    }
}
