use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, ResourcePath, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    /// A server timestamp that has been applied locally but not yet resolved by the backend.
    ServerTimestamp {
        local_write_time: Timestamp,
        previous_value: Option<Box<FirestoreValue>>,
    },
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    /// Placeholder stored in the local view until the server resolves the timestamp.
    pub fn server_timestamp(local_write_time: Timestamp, previous_value: Option<FirestoreValue>) -> Self {
        // Nested placeholders keep only the first value written before the pending timestamps.
        let previous_value = match previous_value {
            Some(FirestoreValue {
                kind: ValueKind::ServerTimestamp { previous_value, .. },
            }) => previous_value,
            Some(other) => Some(Box::new(other)),
            None => None,
        };
        Self {
            kind: ValueKind::ServerTimestamp {
                local_write_time,
                previous_value,
            },
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.kind {
            ValueKind::Integer(value) => Some(value as f64),
            ValueKind::Double(value) => Some(value),
            _ => None,
        }
    }

    pub(crate) fn type_order(&self) -> u8 {
        match self.kind {
            ValueKind::Null => 0,
            ValueKind::Boolean(_) => 1,
            ValueKind::Integer(_) | ValueKind::Double(_) => 2,
            ValueKind::Timestamp(_) => 3,
            ValueKind::ServerTimestamp { .. } => 4,
            ValueKind::String(_) => 5,
            ValueKind::Bytes(_) => 6,
            ValueKind::Reference(_) => 7,
            ValueKind::GeoPoint(_) => 8,
            ValueKind::Array(_) => 9,
            ValueKind::Map(_) => 10,
        }
    }

    /// Stable textual form used to build canonical query and target ids.
    pub fn canonical_string(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::ServerTimestamp { local_write_time, .. } => {
                format!("server_time({},{})", local_write_time.seconds, local_write_time.nanos)
            }
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => value.to_base64(),
            ValueKind::Reference(value) => value.clone(),
            ValueKind::GeoPoint(value) => format!("geo({},{})", value.latitude(), value.longitude()),
            ValueKind::Array(array) => {
                let items: Vec<String> = array.values().iter().map(FirestoreValue::canonical_string).collect();
                format!("[{}]", items.join(","))
            }
            ValueKind::Map(map) => {
                let items: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_string()))
                    .collect();
                format!("{{{}}}", items.join(","))
            }
        }
    }

    /// Approximate in-memory footprint used for cache size accounting.
    pub fn estimate_byte_size(&self) -> usize {
        match &self.kind {
            ValueKind::Null | ValueKind::Boolean(_) => 4,
            ValueKind::Integer(_) | ValueKind::Double(_) => 8,
            ValueKind::Timestamp(_) | ValueKind::GeoPoint(_) => 16,
            ValueKind::ServerTimestamp { previous_value, .. } => {
                16 + previous_value
                    .as_ref()
                    .map(|value| value.estimate_byte_size())
                    .unwrap_or_default()
            }
            ValueKind::String(value) => value.len() * 2,
            ValueKind::Bytes(value) => value.as_slice().len(),
            ValueKind::Reference(value) => value.len(),
            ValueKind::Array(array) => array.values().iter().map(FirestoreValue::estimate_byte_size).sum(),
            ValueKind::Map(map) => map.estimate_byte_size(),
        }
    }
}

impl From<MapValue> for FirestoreValue {
    fn from(value: MapValue) -> Self {
        Self::from_map_value(value)
    }
}

impl PartialEq for FirestoreValue {
    fn eq(&self, other: &Self) -> bool {
        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => true,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
            (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
            (ValueKind::Double(l), ValueKind::Double(r)) => {
                (l.is_nan() && r.is_nan()) || l.to_bits() == r.to_bits()
            }
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
            (
                ValueKind::ServerTimestamp {
                    local_write_time: l, ..
                },
                ValueKind::ServerTimestamp {
                    local_write_time: r, ..
                },
            ) => l == r,
            (ValueKind::String(l), ValueKind::String(r)) => l == r,
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
            (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
            (ValueKind::Array(l), ValueKind::Array(r)) => l == r,
            (ValueKind::Map(l), ValueKind::Map(r)) => l == r,
            _ => false,
        }
    }
}

impl Eq for FirestoreValue {}

impl PartialOrd for FirestoreValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FirestoreValue {
    fn cmp(&self, other: &Self) -> Ordering {
        let left_order = self.type_order();
        let right_order = other.type_order();
        if left_order != right_order {
            return left_order.cmp(&right_order);
        }

        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
            (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
            (ValueKind::Integer(l), ValueKind::Double(r)) => compare_mixed(*l, *r),
            (ValueKind::Double(l), ValueKind::Integer(r)) => compare_mixed(*r, *l).reverse(),
            (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
            (
                ValueKind::ServerTimestamp {
                    local_write_time: l, ..
                },
                ValueKind::ServerTimestamp {
                    local_write_time: r, ..
                },
            ) => l.cmp(r),
            (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
            (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => compare_doubles(l.latitude(), r.latitude())
                .then_with(|| compare_doubles(l.longitude(), r.longitude())),
            (ValueKind::Array(l), ValueKind::Array(r)) => l.values().cmp(r.values()),
            (ValueKind::Map(l), ValueKind::Map(r)) => l.fields().iter().cmp(r.fields().iter()),
            _ => Ordering::Equal,
        }
    }
}

/// NaN sorts before every other number.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    match (integer as f64).partial_cmp(&double).unwrap_or(Ordering::Equal) {
        // Large integers lose precision as doubles; fall back to the truncated value.
        Ordering::Equal if double.fract() == 0.0 && double.abs() < 9.2e18 => integer.cmp(&(double as i64)),
        ordering => ordering,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    match (ResourcePath::from_string(left), ResourcePath::from_string(right)) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.cmp(right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_basic_values() {
        let v = FirestoreValue::from_string("hello");
        match v.kind() {
            ValueKind::String(value) => assert_eq!(value, "hello"),
            _ => panic!("unexpected kind"),
        }
    }

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("b"),
            FirestoreValue::from_bytes(BytesValue::new(vec![0])),
            FirestoreValue::from_reference("rooms/a"),
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(window[0].cmp(&window[1]), Ordering::Less, "{:?} < {:?}", window[0], window[1]);
        }
    }

    #[test]
    fn equality_is_type_strict_and_nan_reflexive() {
        assert_ne!(FirestoreValue::from_integer(1), FirestoreValue::from_double(1.0));
        assert_eq!(FirestoreValue::from_double(f64::NAN), FirestoreValue::from_double(f64::NAN));
        assert_eq!(
            FirestoreValue::from_integer(1).cmp(&FirestoreValue::from_double(1.0)),
            Ordering::Equal
        );
    }

    #[test]
    fn canonical_strings_are_stable() {
        let mut fields = BTreeMap::new();
        fields.insert("b".to_string(), FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]));
        fields.insert("a".to_string(), FirestoreValue::from_bool(true));
        assert_eq!(FirestoreValue::from_map(fields).canonical_string(), "{a:true,b:[1]}");
        assert_eq!(FirestoreValue::from_double(1.0).canonical_string(), "1.0");
    }

    #[test]
    fn size_estimate_grows_with_content() {
        let small = FirestoreValue::from_string("a");
        let large = FirestoreValue::from_array(vec![small.clone(), FirestoreValue::from_string("bbbb")]);
        assert!(large.estimate_byte_size() > small.estimate_byte_size());
    }

    #[test]
    fn nested_server_timestamps_keep_original_previous_value() {
        let original = FirestoreValue::from_integer(7);
        let first = FirestoreValue::server_timestamp(Timestamp::new(1, 0), Some(original.clone()));
        let second = FirestoreValue::server_timestamp(Timestamp::new(2, 0), Some(first));
        match second.kind() {
            ValueKind::ServerTimestamp { previous_value, .. } => {
                assert_eq!(previous_value.as_deref(), Some(&original));
            }
            _ => panic!("expected server timestamp"),
        }
    }
}
