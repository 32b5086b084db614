use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use crate::firestore::model::{DocumentKey, MutableDocument};

pub type DocumentComparator = Arc<dyn Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync>;

/// Documents kept sorted by a query comparator, with lookups by key.
///
/// The comparator must be total (ties broken by key) so that a document's
/// position can be found by binary search.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    documents: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<DocumentKey>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            documents: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn key_ordered() -> Self {
        Self::new(Arc::new(|left: &MutableDocument, right: &MutableDocument| left.key().cmp(right.key())))
    }

    /// An empty set sharing this set's ordering.
    pub fn empty_like(&self) -> Self {
        Self::new(Arc::clone(&self.comparator))
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.documents.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first().and_then(|key| self.documents.get(key))
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last().and_then(|key| self.documents.get(key))
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.documents.get(key)?;
        self.position_of(document).ok()
    }

    /// Documents in comparator order.
    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> + '_ {
        self.sorted.iter().filter_map(move |key| self.documents.get(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> + '_ {
        self.sorted.iter()
    }

    /// Inserts the document, replacing any existing entry with the same key.
    pub fn add(&mut self, document: MutableDocument) {
        self.delete(document.key());
        let index = match self.position_of(&document) {
            Ok(index) | Err(index) => index,
        };
        self.sorted.insert(index, document.key().clone());
        self.documents.insert(document.key().clone(), document);
    }

    pub fn delete(&mut self, key: &DocumentKey) {
        let Some(existing) = self.documents.get(key) else {
            return;
        };
        if let Ok(index) = self.position_of(existing) {
            self.sorted.remove(index);
        } else if let Some(index) = self.sorted.iter().position(|candidate| candidate == key) {
            self.sorted.remove(index);
        }
        self.documents.remove(key);
    }

    fn position_of(&self, document: &MutableDocument) -> Result<usize, usize> {
        self.sorted.binary_search_by(|candidate| match self.documents.get(candidate) {
            Some(existing) => (self.comparator)(existing, document),
            None => candidate.cmp(document.key()),
        })
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(l, r)| l == r)
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, SnapshotVersion};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn doc(path: &str, sort: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("sort").unwrap(), FirestoreValue::from_integer(sort));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn by_sort_field() -> DocumentComparator {
        let field = FieldPath::from_dot_separated("sort").unwrap();
        Arc::new(move |left: &MutableDocument, right: &MutableDocument| {
            left.field(&field)
                .cmp(&right.field(&field))
                .then_with(|| left.key().cmp(right.key()))
        })
    }

    #[test]
    fn keeps_documents_in_comparator_order() {
        let mut set = DocumentSet::new(by_sort_field());
        set.add(doc("c/a", 3));
        set.add(doc("c/b", 1));
        set.add(doc("c/c", 2));
        let keys: Vec<&str> = set.iter().map(|doc| doc.key().id()).collect();
        assert_eq!(keys, vec!["b", "c", "a"]);
        assert_eq!(set.index_of(&DocumentKey::from_string("c/a").unwrap()), Some(2));
    }

    #[test]
    fn add_replaces_and_repositions() {
        let mut set = DocumentSet::new(by_sort_field());
        set.add(doc("c/a", 1));
        set.add(doc("c/b", 2));
        set.add(doc("c/a", 3));
        assert_eq!(set.len(), 2);
        assert_eq!(set.last().unwrap().key().id(), "a");
        set.delete(&DocumentKey::from_string("c/a").unwrap());
        assert_eq!(set.len(), 1);
        assert_eq!(set.first().unwrap().key().id(), "b");
    }
}
