use std::cmp::Ordering;

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument};
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::NotEqual => ordering != Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompositeOperator {
    And,
    Or,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldFilter {
    field: FieldPath,
    op: FilterOperator,
    value: FirestoreValue,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompositeFilter {
    filters: Vec<Filter>,
    op: CompositeOperator,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    Field(FieldFilter),
    Composite(CompositeFilter),
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> FilterOperator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }
        self.matches_value(document.field(&self.field))
    }

    /// Evaluates the filter against a field value (`None` when the field is absent).
    pub(crate) fn matches_value(&self, other: Option<&FirestoreValue>) -> bool {
        match self.op {
            FilterOperator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            FilterOperator::ArrayContainsAny => match (other.and_then(FirestoreValue::as_array), self.value.as_array()) {
                (Some(array), Some(needles)) => needles.values().iter().any(|needle| array.contains(needle)),
                _ => false,
            },
            FilterOperator::In => match (other, self.value.as_array()) {
                (Some(other), Some(candidates)) => candidates.contains(other),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                matches!(other, Some(other) if !other.is_null() && !candidates.contains(other))
            }
            FilterOperator::NotEqual => {
                matches!(other, Some(other) if !other.is_null() && self.op.matches_comparison(other.cmp(&self.value)))
            }
            _ => matches!(
                other,
                Some(other) if other.type_order() == self.value.type_order()
                    && self.op.matches_comparison(other.cmp(&self.value))
            ),
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            FilterOperator::In | FilterOperator::NotIn => {
                let contained = self
                    .value
                    .as_array()
                    .map(|array| array.values().iter().any(|value| reference_key(value).as_ref() == Some(key)))
                    .unwrap_or(false);
                if self.op == FilterOperator::In {
                    contained
                } else {
                    !contained
                }
            }
            _ => match reference_key(&self.value) {
                Some(reference) => self.op.matches_comparison(key.cmp(&reference)),
                None => false,
            },
        }
    }

    fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value.canonical_string()
        )
    }
}

pub(crate) fn reference_key(value: &FirestoreValue) -> Option<DocumentKey> {
    match value.kind() {
        ValueKind::Reference(path) => DocumentKey::from_string(path).ok(),
        _ => None,
    }
}

impl CompositeFilter {
    pub fn new(filters: Vec<Filter>, op: CompositeOperator) -> Self {
        Self { filters, op }
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn op(&self) -> CompositeOperator {
        self.op
    }

    fn is_flat_conjunction(&self) -> bool {
        self.op == CompositeOperator::And && self.filters.iter().all(|filter| matches!(filter, Filter::Field(_)))
    }
}

impl Filter {
    pub fn field(field: FieldPath, op: FilterOperator, value: FirestoreValue) -> Self {
        Filter::Field(FieldFilter::new(field, op, value))
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(filters, CompositeOperator::And))
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Composite(CompositeFilter::new(filters, CompositeOperator::Or))
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        match self {
            Filter::Field(filter) => filter.matches(document),
            Filter::Composite(composite) => match composite.op {
                CompositeOperator::And => composite.filters.iter().all(|filter| filter.matches(document)),
                CompositeOperator::Or => composite.filters.iter().any(|filter| filter.matches(document)),
            },
        }
    }

    /// Every field filter nested anywhere in this filter.
    pub fn flattened_filters(&self) -> Vec<&FieldFilter> {
        match self {
            Filter::Field(filter) => vec![filter],
            Filter::Composite(composite) => composite
                .filters
                .iter()
                .flat_map(Filter::flattened_filters)
                .collect(),
        }
    }

    pub fn canonical_id(&self) -> String {
        match self {
            Filter::Field(filter) => filter.canonical_id(),
            Filter::Composite(composite) if composite.is_flat_conjunction() => composite
                .filters
                .iter()
                .map(Filter::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
            Filter::Composite(composite) => {
                let inner: Vec<String> = composite.filters.iter().map(Filter::canonical_id).collect();
                let op = match composite.op {
                    CompositeOperator::And => "and",
                    CompositeOperator::Or => "or",
                };
                format!("{op}({})", inner.join(","))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;

    fn doc(fields: &[(&str, FirestoreValue)]) -> MutableDocument {
        let mut data = MapValue::empty();
        for (field, value) in fields {
            data.set(&FieldPath::from_dot_separated(field).unwrap(), value.clone());
        }
        MutableDocument::new_found_document(
            DocumentKey::from_string("rooms/eros").unwrap(),
            SnapshotVersion::from_micros(1),
            data,
        )
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn range_filters_require_matching_type() {
        let document = doc(&[("rank", FirestoreValue::from_string("10"))]);
        let filter = Filter::field(field("rank"), FilterOperator::GreaterThan, FirestoreValue::from_integer(1));
        assert!(!filter.matches(&document));
        let numeric = doc(&[("rank", FirestoreValue::from_double(2.5))]);
        assert!(filter.matches(&numeric));
    }

    #[test]
    fn not_equal_skips_missing_and_null_fields() {
        let filter = Filter::field(field("a"), FilterOperator::NotEqual, FirestoreValue::from_integer(1));
        assert!(!filter.matches(&doc(&[])));
        assert!(!filter.matches(&doc(&[("a", FirestoreValue::null())])));
        assert!(filter.matches(&doc(&[("a", FirestoreValue::from_integer(2))])));
    }

    #[test]
    fn array_filters() {
        let document = doc(&[(
            "tags",
            FirestoreValue::from_array(vec![FirestoreValue::from_string("a"), FirestoreValue::from_string("b")]),
        )]);
        let contains = Filter::field(field("tags"), FilterOperator::ArrayContains, FirestoreValue::from_string("b"));
        let any = Filter::field(
            field("tags"),
            FilterOperator::ArrayContainsAny,
            FirestoreValue::from_array(vec![FirestoreValue::from_string("z"), FirestoreValue::from_string("a")]),
        );
        assert!(contains.matches(&document));
        assert!(any.matches(&document));
    }

    #[test]
    fn composite_or_matches_any_branch() {
        let document = doc(&[("a", FirestoreValue::from_integer(1))]);
        let filter = Filter::or(vec![
            Filter::field(field("a"), FilterOperator::Equal, FirestoreValue::from_integer(2)),
            Filter::field(field("a"), FilterOperator::Equal, FirestoreValue::from_integer(1)),
        ]);
        assert!(filter.matches(&document));
        assert_eq!(filter.canonical_id(), "or(a==2,a==1)");
    }

    #[test]
    fn key_filters_compare_references() {
        let document = doc(&[]);
        let filter = Filter::field(
            FieldPath::document_id(),
            FilterOperator::GreaterThanOrEqual,
            FirestoreValue::from_reference("rooms/a"),
        );
        assert!(filter.matches(&document));
    }
}
