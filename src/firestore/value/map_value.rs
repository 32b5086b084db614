use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::FirestoreValue;

/// A document body: nested fields addressable by [`FieldPath`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_map()?.fields.get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing non-map intermediates with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut fields = &mut self.fields;
        for segment in parents {
            let entry = fields
                .entry(segment.clone())
                .or_insert_with(|| FirestoreValue::from_map(BTreeMap::new()));
            if entry.as_map().is_none() {
                *entry = FirestoreValue::from_map(BTreeMap::new());
            }
            match entry.as_map_mut() {
                Some(map) => fields = &mut map.fields,
                None => return,
            }
        }
        fields.insert(last.clone(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        let Some((last, parents)) = path.segments().split_last() else {
            return;
        };
        let mut fields = &mut self.fields;
        for segment in parents {
            match fields.get_mut(segment).and_then(FirestoreValue::as_map_mut) {
                Some(map) => fields = &mut map.fields,
                None => return,
            }
        }
        fields.remove(last);
    }

    /// Applies a batch of writes, `None` deletes the field.
    pub fn set_all(&mut self, data: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in data {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf paths of this map; empty nested maps count as leaves.
    pub fn field_mask(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &[], &mut paths);
        paths
    }

    pub fn estimate_byte_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(key, value)| key.len() * 2 + value.estimate_byte_size())
            .sum()
    }
}

fn collect_leaf_paths(fields: &BTreeMap<String, FirestoreValue>, prefix: &[String], out: &mut Vec<FieldPath>) {
    for (key, value) in fields {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.as_map() {
            Some(child) if !child.is_empty() => collect_leaf_paths(&child.fields, &segments, out),
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.push(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut map = MapValue::empty();
        map.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        assert_eq!(map.get(&path("a.b.c")), Some(&FirestoreValue::from_integer(1)));
        assert!(map.get(&path("a.b")).and_then(FirestoreValue::as_map).is_some());
    }

    #[test]
    fn set_overwrites_scalar_parent() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from_string("x"));
        map.set(&path("a.b"), FirestoreValue::from_bool(true));
        assert_eq!(map.get(&path("a.b")), Some(&FirestoreValue::from_bool(true)));
    }

    #[test]
    fn delete_removes_nested_field() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from_integer(1));
        map.set(&path("a.c"), FirestoreValue::from_integer(2));
        map.delete(&path("a.b"));
        map.delete(&path("missing.field"));
        assert!(map.get(&path("a.b")).is_none());
        assert_eq!(map.field_mask(), vec![path("a.c")]);
    }
}
