use std::collections::BTreeSet;

use crate::firestore::model::{DocumentKey, DocumentKeySet};

/// Pairs of (document key, id) with lookups in both directions.
///
/// Ids are target ids for local view references and batch ids for pending writes.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references<'k, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_id.remove(&(id, key.clone()));
        self.by_key.remove(&(key.clone(), id));
    }

    pub fn remove_references<'k, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Clears every reference for `id` and returns the keys that were referenced.
    pub fn remove_references_for_id(&mut self, id: i32) -> DocumentKeySet {
        let keys = self.references_for_id(id);
        self.remove_references(&keys, id);
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        self.by_id
            .range((id, DocumentKey::empty())..)
            .take_while(|(candidate, _)| *candidate == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((key.clone(), i32::MIN)..)
            .next()
            .map(|(candidate, _)| candidate == key)
            .unwrap_or(false)
    }
}
