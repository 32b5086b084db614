use std::cmp::Ordering;

use crate::firestore::core::filter::reference_key;
use crate::firestore::model::{FieldPath, MutableDocument};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }

    pub fn flipped(&self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }

    fn apply(&self, ordering: Ordering) -> Ordering {
        match self {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    field: FieldPath,
    direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flipped())
    }

    /// Orders two documents by this field; both must contain it unless it is the key.
    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => l.cmp(r),
                (l, r) => l.is_some().cmp(&r.is_some()),
            }
        };
        self.direction.apply(ordering)
    }

    pub(crate) fn canonical_id(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.direction.as_str())
    }
}

/// A cursor position over the query's order-by fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bound {
    position: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { position, inclusive }
    }

    pub fn position(&self) -> &[FirestoreValue] {
        &self.position
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by.iter()) {
            let ordering = if order.field().is_key_field() {
                match reference_key(component) {
                    Some(key) => key.cmp(document.key()),
                    None => Ordering::Equal,
                }
            } else {
                match document.field(order.field()) {
                    Some(value) => component.cmp(value),
                    None => Ordering::Greater,
                }
            };
            let ordering = order.direction.apply(ordering);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// True if the document is at or after this start cursor.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    /// True if the document is at or before this end cursor.
    pub fn sorts_after_document(&self, order_by: &[OrderBy], document: &MutableDocument) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let values: Vec<String> = self.position.iter().map(FirestoreValue::canonical_string).collect();
        format!("{}{}", if self.inclusive { "b:" } else { "a:" }, values.join(","))
    }
}
