use std::collections::BTreeMap;

use crate::firestore::core::User;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath, BATCH_ID_UNKNOWN};

pub type OverlayMap = BTreeMap<DocumentKey, Overlay>;

/// Per-user store of the net local mutation on each document.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_id: String,
}

impl DocumentOverlayCache {
    pub fn for_user(user: &User) -> Self {
        Self { user_id: user.to_key() }
    }

    pub fn get_overlay(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> Option<Overlay> {
        txn.tables()
            .overlays
            .get(&(self.user_id.clone(), key.clone()))
            .cloned()
    }

    pub fn get_overlays<'k, I>(&self, txn: &PersistenceTransaction<'_>, keys: I) -> OverlayMap
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        keys.into_iter()
            .filter_map(|key| self.get_overlay(txn, key).map(|overlay| (key.clone(), overlay)))
            .collect()
    }

    /// Stores one overlay per key, all attributed to `largest_batch_id`.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Mutation>,
    ) {
        for (key, mutation) in overlays {
            self.save_overlay(txn, largest_batch_id, key, mutation.clone());
        }
    }

    fn save_overlay(&self, txn: &mut PersistenceTransaction<'_>, largest_batch_id: BatchId, key: &DocumentKey, mutation: Mutation) {
        let tables = txn.tables_mut();
        let row = (self.user_id.clone(), key.clone());
        if let Some(existing) = tables.overlays.get(&row) {
            let stale = (self.user_id.clone(), existing.largest_batch_id, key.clone());
            tables.overlays_by_batch.remove(&stale);
        }
        tables.overlays.insert(row, Overlay::new(largest_batch_id, mutation));
        tables
            .overlays_by_batch
            .insert((self.user_id.clone(), largest_batch_id, key.clone()), ());
    }

    /// Drops the overlays attributed to `batch_id`.
    ///
    /// Callers recalculate overlays for `document_keys` afterwards, since earlier batches may
    /// still touch them.
    pub fn remove_overlays_for_batch_id<'k, I>(&self, txn: &mut PersistenceTransaction<'_>, document_keys: I, batch_id: BatchId)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let tables = txn.tables_mut();
        for key in document_keys {
            let row = (self.user_id.clone(), key.clone());
            let attributed = tables
                .overlays
                .get(&row)
                .map(|overlay| overlay.largest_batch_id == batch_id)
                .unwrap_or(false);
            if attributed {
                tables.overlays.remove(&row);
                tables
                    .overlays_by_batch
                    .remove(&(self.user_id.clone(), batch_id, key.clone()));
            }
        }
    }

    /// Overlays for documents directly under `collection` modified after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> OverlayMap {
        let start = (self.user_id.clone(), DocumentKey::prefix_start(collection));
        txn.tables()
            .overlays
            .range(start..)
            .take_while(|((user_id, key), _)| *user_id == self.user_id && collection.is_prefix_of(key.path()))
            .filter(|((_, key), overlay)| {
                collection.is_immediate_parent_of(key.path()) && overlay.largest_batch_id > since_batch_id
            })
            .map(|((_, key), overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    /// Overlays in `collection_group` modified after `since_batch_id`, oldest batch first.
    ///
    /// Whole batches are returned, so the result may hold more than `count` entries.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> OverlayMap {
        let start = (self.user_id.clone(), since_batch_id.max(BATCH_ID_UNKNOWN) + 1, DocumentKey::empty());
        let mut by_batch: BTreeMap<BatchId, OverlayMap> = BTreeMap::new();
        for ((user_id, batch_id, key), _) in txn.tables().overlays_by_batch.range(start..) {
            if *user_id != self.user_id {
                break;
            }
            if !key.has_collection_id(collection_group) {
                continue;
            }
            if let Some(overlay) = self.get_overlay(txn, key) {
                by_batch.entry(*batch_id).or_default().insert(key.clone(), overlay);
            }
        }

        let mut result = OverlayMap::new();
        for overlays in by_batch.into_values() {
            result.extend(overlays);
            if result.len() >= count {
                break;
            }
        }
        result
    }
}
