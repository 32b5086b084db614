use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::firestore::core::filter::Filter;
use crate::firestore::core::order_by::{Bound, Direction, OrderBy};
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentComparator, DocumentKey, FieldPath, MutableDocument, ResourcePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A query against the local cache and the watch stream.
///
/// Queries are immutable; the `with_*` builders return modified copies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    explicit_order_by: Vec<OrderBy>,
    filters: Vec<Filter>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// A query over the documents of a collection, or over a single document.
    pub fn at_path(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if DocumentKey::is_document_key(&path) {
            return Err(invalid_argument(
                "Collection queries must reference a collection (odd number of path segments)",
            ));
        }
        Ok(Self::at_path(path))
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::at_path(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn with_filter(&self, filter: Filter) -> Self {
        let mut query = self.clone();
        query.filters.push(filter);
        query
    }

    pub fn with_order_by(&self, order_by: OrderBy) -> Self {
        let mut query = self.clone();
        query.explicit_order_by.push(order_by);
        query
    }

    pub fn with_limit_to_first(&self, limit: u32) -> Self {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::First;
        query
    }

    pub fn with_limit_to_last(&self, limit: u32) -> Self {
        let mut query = self.clone();
        query.limit = Some(limit);
        query.limit_type = LimitType::Last;
        query
    }

    pub fn with_start_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.start_at = Some(bound);
        query
    }

    pub fn with_end_at(&self, bound: Bound) -> Self {
        let mut query = self.clone();
        query.end_at = Some(bound);
        query
    }

    /// Rewrites a collection group query as a query over one concrete collection.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path) && self.collection_group.is_none() && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True if the query has no filters, ordering, limit or cursors.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1 && self.explicit_order_by[0].field().is_key_field()))
    }

    fn inequality_fields(&self) -> BTreeSet<FieldPath> {
        self.filters
            .iter()
            .flat_map(Filter::flattened_filters)
            .filter(|filter| filter.op().is_inequality())
            .map(|filter| filter.field().clone())
            .collect()
    }

    /// Explicit order-bys, then inequality fields, then the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let mut seen: BTreeSet<FieldPath> = result.iter().map(|order| order.field().clone()).collect();
        let last_direction = result
            .last()
            .map(OrderBy::direction)
            .unwrap_or(Direction::Ascending);

        for field in self.inequality_fields() {
            if !seen.contains(&field) && !field.is_key_field() {
                seen.insert(field.clone());
                result.push(OrderBy::new(field, last_direction));
            }
        }

        if !seen.contains(&FieldPath::document_id()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by,
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            },
            // Limit-to-last is served by flipping the order and swapping the cursors.
            LimitType::Last => Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by: order_by.iter().map(OrderBy::flipped).collect(),
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.end_at.clone(),
                end_at: self.start_at.clone(),
            },
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path_and_collection_group(document)
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path_and_collection_group(&self, document: &MutableDocument) -> bool {
        let document_path = document.key().path();
        if let Some(group) = &self.collection_group {
            document.key().has_collection_id(group) && self.path.is_prefix_of(document_path)
        } else if DocumentKey::is_document_key(&self.path) {
            self.path == *document_path
        } else {
            self.path.is_immediate_parent_of(document_path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field().is_key_field() || document.field(order.field()).is_some())
    }

    fn matches_bounds(&self, document: &MutableDocument) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start_at) = &self.start_at {
            if !start_at.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end_at) = &self.end_at {
            if !end_at.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Orders documents the way query results are presented.
    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.comparator()(left, right)
    }

    /// The comparator in the shared form used by document sets.
    pub fn document_comparator(&self) -> DocumentComparator {
        Arc::new(self.comparator())
    }

    pub fn comparator(&self) -> impl Fn(&MutableDocument, &MutableDocument) -> Ordering + Send + Sync + 'static {
        let order_by = self.normalized_order_by();
        move |left, right| {
            let mut saw_key = false;
            for order in &order_by {
                saw_key |= order.field().is_key_field();
                match order.compare(left, right) {
                    Ordering::Equal => continue,
                    ordering => return ordering,
                }
            }
            if saw_key {
                Ordering::Equal
            } else {
                left.key().cmp(right.key())
            }
        }
    }
}
