use crate::firestore::core::filter::{FieldFilter, Filter};
use crate::firestore::core::order_by::{Bound, OrderBy};
use crate::firestore::model::{DocumentKey, ResourcePath};

pub type TargetId = i32;

/// The backend-facing form of a query: normalized ordering and no limit type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub filters: Vec<Filter>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// A target that watches a single document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self {
            path: key.path().clone(),
            collection_group: None,
            order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            start_at: None,
            end_at: None,
        }
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn field_filters(&self) -> Vec<&FieldFilter> {
        self.filters.iter().flat_map(Filter::flattened_filters).collect()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        for filter in &self.filters {
            id.push_str(&filter.canonical_id());
        }
        id.push_str("|ob:");
        for order in &self.order_by {
            id.push_str(&order.canonical_id());
        }
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(start_at) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(&start_at.canonical_id());
        }
        if let Some(end_at) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(&end_at.canonical_id());
        }
        id
    }
}

/// Hands out target ids from one of two disjoint sequences.
///
/// Targets allocated by the local cache use even ids; limbo resolution targets created by
/// the sync engine use odd ids, so the two never collide.
#[derive(Clone, Copy, Debug)]
pub struct TargetIdGenerator {
    last_id: TargetId,
}

impl TargetIdGenerator {
    /// Continues the even sequence after `highest_target_id`.
    pub fn for_target_cache(highest_target_id: TargetId) -> Self {
        Self {
            last_id: highest_target_id.max(0) & !1,
        }
    }

    pub fn for_sync_engine() -> Self {
        Self { last_id: -1 }
    }

    pub fn next_id(&mut self) -> TargetId {
        self.last_id += 2;
        self.last_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generators_produce_disjoint_sequences() {
        let mut cache = TargetIdGenerator::for_target_cache(0);
        let mut sync = TargetIdGenerator::for_sync_engine();
        assert_eq!([cache.next_id(), cache.next_id()], [2, 4]);
        assert_eq!([sync.next_id(), sync.next_id()], [1, 3]);
        assert_eq!(TargetIdGenerator::for_target_cache(6).next_id(), 8);
    }

    #[test]
    fn canonical_ids_match_for_equal_targets() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        assert_eq!(
            Target::for_document(&key).canonical_id(),
            Target::for_document(&key).canonical_id()
        );
        assert!(Target::for_document(&key).is_document_target());
    }
}
