use std::collections::BTreeSet;

use crate::firestore::core::{CompositeOperator, Direction, Filter, FilterOperator, Target};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    DocumentKey, FieldIndex, FieldPath, IndexKind, IndexSegment, MutableDocument, MutableDocumentMap, ResourcePath,
};

/// How much of a target an index can serve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    /// No usable index; the target needs a collection scan.
    None,
    /// An index narrows the candidates but results must be post-filtered.
    Partial,
    /// An index serves the target's filters, ordering and limit.
    Full,
}

/// Collection-parent bookkeeping plus client-side field indexes.
///
/// Only single-field ascending indexes are supported. A target can use one when all of its
/// field filters and non-key orderings are on the same field, the filters are equality,
/// `in` or range comparisons combined with AND, and it has no cursors. Every other target
/// reports [`IndexType::None`] and is served by a full scan.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexManager;

impl IndexManager {
    pub fn new() -> Self {
        Self
    }

    /// Records `collection_path`'s parent so collection group queries can find it.
    pub fn add_to_collection_parent_index(&self, txn: &mut PersistenceTransaction<'_>, collection_path: &ResourcePath) {
        debug_assert!(collection_path.len() % 2 == 1, "expected a collection path");
        let Some(collection_id) = collection_path.last_segment() else {
            return;
        };
        let row = (collection_id.to_string(), collection_path.without_last());
        if !txn.tables().collection_parents.contains(&row) {
            txn.tables_mut().collection_parents.insert(row, ());
        }
    }

    /// Parent paths of every collection named `collection_id`, in path order.
    pub fn get_collection_parents(&self, txn: &PersistenceTransaction<'_>, collection_id: &str) -> Vec<ResourcePath> {
        let start = (collection_id.to_string(), ResourcePath::root());
        txn.tables()
            .collection_parents
            .range(start..)
            .take_while(|((id, _), _)| id == collection_id)
            .map(|((_, parent), _)| parent.clone())
            .collect()
    }

    /// Stores `index`, assigns it an id and indexes the documents already cached.
    pub fn add_field_index(&self, txn: &mut PersistenceTransaction<'_>, index: FieldIndex) -> FieldIndex {
        let mut index_id = 0;
        txn.tables_mut().target_globals.update(|globals| {
            globals.next_index_id += 1;
            index_id = globals.next_index_id;
        });
        let index = FieldIndex { index_id, ..index };
        txn.tables_mut().field_indexes.insert(index_id, index.clone());

        let existing: Vec<MutableDocument> = txn
            .tables()
            .remote_documents
            .iter()
            .filter(|(key, _)| key.collection_group() == index.collection_group)
            .map(|(_, entry)| entry.document.clone())
            .collect();
        for document in &existing {
            self.write_entries(txn, &index, document);
        }
        log::debug!(
            "created field index {index_id} on '{}' ({} documents)",
            index.collection_group,
            existing.len()
        );
        index
    }

    pub fn delete_field_index(&self, txn: &mut PersistenceTransaction<'_>, index_id: i32) {
        if txn.tables_mut().field_indexes.remove(&index_id).is_none() {
            return;
        }
        let rows: Vec<(DocumentKey, i32)> = txn
            .tables()
            .index_entries_by_document
            .iter()
            .filter(|((_, id), _)| *id == index_id)
            .map(|(row, _)| row.clone())
            .collect();
        for row in rows {
            self.clear_entries(txn, index_id, &row.0);
        }
    }

    /// All indexes, or only those on `collection_group`.
    pub fn get_field_indexes(&self, txn: &PersistenceTransaction<'_>, collection_group: Option<&str>) -> Vec<FieldIndex> {
        txn.tables()
            .field_indexes
            .iter()
            .map(|(_, index)| index)
            .filter(|index| collection_group.map_or(true, |group| index.collection_group == group))
            .cloned()
            .collect()
    }

    pub fn get_index_type(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> IndexType {
        match self.index_for_target(txn, target) {
            Some(_) => IndexType::Full,
            None => IndexType::None,
        }
    }

    /// Keys matching `target` in target order, or `None` when no index serves it.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> Option<Vec<DocumentKey>> {
        let index = self.index_for_target(txn, target)?;
        let filters = target.field_filters();
        let start = (index.index_id, Vec::new(), DocumentKey::empty());
        let candidates = txn
            .tables()
            .index_entries
            .range(start..)
            .take_while(|((id, _, _), _)| *id == index.index_id)
            .filter(|((_, values, _), _)| {
                let value = values.first();
                filters.iter().all(|filter| filter.matches_value(value))
            })
            .map(|((_, _, key), _)| key)
            .filter(|key| target.collection_group.is_some() || target.path.is_immediate_parent_of(key.path()));

        let descending = target
            .order_by
            .first()
            .map(|order| order.direction() == Direction::Descending)
            .unwrap_or(false);
        let mut keys: Vec<DocumentKey> = candidates.cloned().collect();
        if descending {
            keys.reverse();
        }
        if let Some(limit) = target.limit {
            keys.truncate(limit as usize);
        }
        Some(keys)
    }

    /// Brings index entries up to date with the given remote documents.
    pub fn update_index_entries(&self, txn: &mut PersistenceTransaction<'_>, documents: &MutableDocumentMap) {
        for document in documents.values() {
            let indexes = self.get_field_indexes(txn, Some(document.key().collection_group()));
            for index in &indexes {
                self.clear_entries(txn, index.index_id, document.key());
                self.write_entries(txn, index, document);
            }
        }
    }

    /// Creates an index for `target` when it has a supported shape and none exists yet.
    pub fn create_target_indexes(&self, txn: &mut PersistenceTransaction<'_>, target: &Target) {
        if self.get_index_type(txn, target) != IndexType::None {
            return;
        }
        let (Some(group), Some(field)) = (target_collection_group(target), index_subject(target)) else {
            return;
        };
        let index = FieldIndex::new(group, vec![IndexSegment::new(field, IndexKind::Ascending)]);
        self.add_field_index(txn, index);
    }

    fn index_for_target(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> Option<FieldIndex> {
        let group = target_collection_group(target)?;
        let field = index_subject(target)?;
        self.get_field_indexes(txn, Some(&group))
            .into_iter()
            .find(|index| {
                index.segments.len() == 1
                    && index.segments[0].field_path == field
                    && index.segments[0].kind == IndexKind::Ascending
            })
    }

    fn write_entries(&self, txn: &mut PersistenceTransaction<'_>, index: &FieldIndex, document: &MutableDocument) {
        if !document.is_found_document() {
            return;
        }
        let Some(segment) = index.segments.first() else {
            return;
        };
        let Some(value) = document.field(&segment.field_path) else {
            return;
        };
        let values = vec![value.clone()];
        let tables = txn.tables_mut();
        tables
            .index_entries
            .insert((index.index_id, values.clone(), document.key().clone()), ());
        tables
            .index_entries_by_document
            .insert((document.key().clone(), index.index_id), vec![values]);
    }

    fn clear_entries(&self, txn: &mut PersistenceTransaction<'_>, index_id: i32, key: &DocumentKey) {
        let tables = txn.tables_mut();
        let Some(previous) = tables.index_entries_by_document.remove(&(key.clone(), index_id)) else {
            return;
        };
        for values in previous {
            tables.index_entries.remove(&(index_id, values, key.clone()));
        }
    }
}

fn target_collection_group(target: &Target) -> Option<String> {
    if let Some(group) = &target.collection_group {
        return Some(group.clone());
    }
    if target.path.len() % 2 == 1 {
        target.path.last_segment().map(str::to_string)
    } else {
        None
    }
}

/// The single field an ascending index would need to serve `target`.
fn index_subject(target: &Target) -> Option<FieldPath> {
    if target.is_document_target() || target.start_at.is_some() || target.end_at.is_some() {
        return None;
    }
    if target
        .filters
        .iter()
        .any(|filter| matches!(filter, Filter::Composite(composite) if composite.op() != CompositeOperator::And))
    {
        return None;
    }

    let mut fields = BTreeSet::new();
    for filter in target.field_filters() {
        if !matches!(
            filter.op(),
            FilterOperator::Equal
                | FilterOperator::In
                | FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
        ) {
            return None;
        }
        fields.insert(filter.field().clone());
    }
    for order in &target.order_by {
        if !order.field().is_key_field() {
            fields.insert(order.field().clone());
        }
    }
    if fields.len() != 1 {
        return None;
    }
    let field = fields.into_iter().next()?;
    if field.is_key_field() {
        return None;
    }
    // Key ordering must follow the field ordering for index order to match target order.
    if target
        .order_by
        .windows(2)
        .any(|pair| pair[0].direction() != pair[1].direction())
    {
        return None;
    }
    Some(field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Direction, OrderBy, Query};
    use crate::firestore::local::persistence::{run_transaction, MemoryPersistence, TransactionMode};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn rank() -> FieldPath {
        FieldPath::from_dot_separated("rank").unwrap()
    }

    fn doc(path: &str, rank_value: i64) -> MutableDocument {
        let mut data = MapValue::empty();
        data.set(&rank(), FirestoreValue::from_integer(rank_value));
        let mut document = MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        );
        document.set_read_time(SnapshotVersion::from_micros(1));
        document
    }

    #[test]
    fn collection_parents_are_recorded_once() {
        let persistence = MemoryPersistence::new();
        let manager = IndexManager::new();
        let parents = run_transaction(&persistence, "parents", TransactionMode::ReadWrite, |txn| {
            let path = ResourcePath::from_string("rooms/a/messages").unwrap();
            manager.add_to_collection_parent_index(txn, &path);
            manager.add_to_collection_parent_index(txn, &path);
            manager.add_to_collection_parent_index(txn, &ResourcePath::from_string("rooms/b/messages").unwrap());
            manager.add_to_collection_parent_index(txn, &ResourcePath::from_string("messages").unwrap());
            Ok(manager.get_collection_parents(txn, "messages"))
        })
        .unwrap();
        let parents: Vec<String> = parents.iter().map(ResourcePath::canonical_string).collect();
        assert_eq!(parents, vec!["", "rooms/a", "rooms/b"]);
    }

    #[test]
    fn unsupported_targets_require_full_scan() {
        let persistence = MemoryPersistence::new();
        let manager = IndexManager::new();
        run_transaction(&persistence, "index", TransactionMode::ReadWrite, |txn| {
            manager.add_field_index(
                txn,
                FieldIndex::new("rooms", vec![IndexSegment::new(rank(), IndexKind::Ascending)]),
            );
            let array_query = Query::collection("rooms").unwrap().with_filter(Filter::field(
                rank(),
                FilterOperator::ArrayContains,
                FirestoreValue::from_integer(1),
            ));
            assert_eq!(manager.get_index_type(txn, &array_query.to_target()), IndexType::None);
            let two_fields = Query::collection("rooms")
                .unwrap()
                .with_filter(Filter::field(rank(), FilterOperator::Equal, FirestoreValue::from_integer(1)))
                .with_order_by(OrderBy::new(FieldPath::from_dot_separated("name").unwrap(), Direction::Ascending));
            assert_eq!(manager.get_index_type(txn, &two_fields.to_target()), IndexType::None);
            assert!(manager.get_documents_matching_target(txn, &two_fields.to_target()).is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn range_query_served_from_index_in_order() {
        let persistence = MemoryPersistence::new();
        let manager = IndexManager::new();
        let cache = RemoteDocumentCache::new(manager);
        let keys = run_transaction(&persistence, "index", TransactionMode::ReadWrite, |txn| {
            let mut buffer = cache.new_change_buffer();
            for (path, value) in [("rooms/a", 5), ("rooms/b", 1), ("rooms/c", 3), ("other/d", 4)] {
                buffer.add_entry(doc(path, value));
            }
            buffer.apply(txn);
            manager.add_field_index(
                txn,
                FieldIndex::new("rooms", vec![IndexSegment::new(rank(), IndexKind::Ascending)]),
            );
            let query = Query::collection("rooms")
                .unwrap()
                .with_filter(Filter::field(rank(), FilterOperator::GreaterThan, FirestoreValue::from_integer(1)))
                .with_order_by(OrderBy::new(rank(), Direction::Descending))
                .with_limit_to_first(1);
            assert_eq!(manager.get_index_type(txn, &query.to_target()), IndexType::Full);
            Ok(manager.get_documents_matching_target(txn, &query.to_target()))
        })
        .unwrap()
        .unwrap();
        assert_eq!(keys, vec![DocumentKey::from_string("rooms/a").unwrap()]);
    }

    #[test]
    fn index_entries_follow_document_updates() {
        let persistence = MemoryPersistence::new();
        let manager = IndexManager::new();
        let query = Query::collection("rooms")
            .unwrap()
            .with_filter(Filter::field(rank(), FilterOperator::Equal, FirestoreValue::from_integer(2)));
        let keys = run_transaction(&persistence, "index", TransactionMode::ReadWrite, |txn| {
            manager.create_target_indexes(txn, &query.to_target());
            assert_eq!(manager.get_field_indexes(txn, Some("rooms")).len(), 1);
            let mut documents = MutableDocumentMap::new();
            documents.insert(DocumentKey::from_string("rooms/a").unwrap(), doc("rooms/a", 2));
            manager.update_index_entries(txn, &documents);
            documents.insert(DocumentKey::from_string("rooms/a").unwrap(), doc("rooms/a", 7));
            manager.update_index_entries(txn, &documents);
            Ok(manager.get_documents_matching_target(txn, &query.to_target()))
        })
        .unwrap()
        .unwrap();
        assert!(keys.is_empty());
    }
}
