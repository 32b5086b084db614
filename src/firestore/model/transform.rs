use crate::firestore::model::{FieldPath, Timestamp};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Describes a single field transform applied during a write.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Write-time sentinel operations supported by Firestore.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

impl TransformOperation {
    /// Computes the optimistic value of the field while the write is pending.
    pub fn apply_to_local_view(&self, previous: Option<&FirestoreValue>, local_write_time: Timestamp) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous.cloned())
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                numeric_increment(&base, operand)
            }
        }
    }

    /// Computes the committed value given the server's transform result.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<&FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            _ => transform_result.cloned().unwrap_or_else(FirestoreValue::null),
        }
    }

    /// The value this transform starts from, for transforms that depend on the prior value.
    ///
    /// Only increments have one: a numeric previous value is kept, anything else coerces to 0.
    pub fn base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }
}

fn coerced_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn array_union(previous: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerced_array(previous);
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = coerced_array(previous)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();
    FirestoreValue::from_array(values)
}

fn numeric_increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        _ => {
            let sum = base.as_f64().unwrap_or_default() + operand.as_f64().unwrap_or_default();
            FirestoreValue::from_double(sum)
        }
    }
}
