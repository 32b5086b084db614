use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{
    DocumentKey, FieldPath, FieldTransform, MutableDocument, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{FirestoreValue, MapValue};

/// Set of field paths touched by a write.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True if `path` is one of the fields or nested below one of them.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<'a, I: IntoIterator<Item = &'a FieldPath>>(mut self, extra: I) -> Self {
        self.fields.extend(extra.into_iter().cloned());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for_document(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// The server's answer for one mutation of a committed batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }
}

/// A single write against one document.
#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    /// Replaces the whole document.
    Set {
        key: DocumentKey,
        value: MapValue,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    /// Writes only the fields named in `field_mask`; masked fields absent from `data` are deleted.
    Patch {
        key: DocumentKey,
        data: MapValue,
        field_mask: FieldMask,
        precondition: Precondition,
        field_transforms: Vec<FieldTransform>,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Asserts a precondition without changing the document.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// A patch of every leaf in `data`, failing if the document does not exist.
    pub fn update(key: DocumentKey, data: MapValue) -> Self {
        let field_mask = FieldMask::new(data.field_mask());
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, data: MapValue, field_mask: FieldMask, precondition: Precondition) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    /// Attaches transforms to a set or patch; other kinds are returned unchanged.
    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        match &mut self {
            Mutation::Set { field_transforms, .. } | Mutation::Patch { field_transforms, .. } => {
                *field_transforms = transforms;
            }
            Mutation::Delete { .. } | Mutation::Verify { .. } => {}
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> &Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => precondition,
        }
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        match self {
            Mutation::Set { field_transforms, .. } | Mutation::Patch { field_transforms, .. } => field_transforms,
            Mutation::Delete { .. } | Mutation::Verify { .. } => &[],
        }
    }

    /// The fields a patch writes; `None` for mutations that replace the whole document.
    pub fn field_mask(&self) -> Option<&FieldMask> {
        match self {
            Mutation::Patch { field_mask, .. } => Some(field_mask),
            _ => None,
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self, Mutation::Patch { .. })
    }

    /// Applies the server-acknowledged mutation to the cached remote document.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationResult) {
        debug_assert_eq!(self.key(), document.key(), "mutation applied to a different document");
        match self {
            Mutation::Set { value, .. } => {
                let mut data = value.clone();
                data.set_all(self.server_transform_results(document, &result.transform_results));
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Patch { precondition, .. } => {
                if !precondition.is_valid_for_document(document) {
                    // The server rejected nothing but we cannot know the final contents.
                    document.convert_to_unknown_document(result.version);
                    return;
                }
                let transform_results = self.server_transform_results(document, &result.transform_results);
                let mut data = document.data().clone();
                data.set_all(self.patch_values());
                data.set_all(transform_results);
                document
                    .convert_to_found_document(result.version, data)
                    .set_has_committed_mutations();
            }
            Mutation::Delete { .. } => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            Mutation::Verify { .. } => {}
        }
    }

    /// Applies the pending mutation to the local view of `document`.
    ///
    /// Returns the accumulated set of fields written so far, `None` meaning the whole
    /// document was replaced or deleted.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition().is_valid_for_document(document) {
            return previous_mask;
        }
        match self {
            Mutation::Set { value, .. } => {
                let mut data = value.clone();
                data.set_all(self.local_transform_results(document, local_write_time));
                let version = document.version();
                document.convert_to_found_document(version, data).set_has_local_mutations();
                None
            }
            Mutation::Patch {
                field_mask,
                field_transforms,
                ..
            } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut data = document.data().clone();
                data.set_all(self.patch_values());
                data.set_all(transform_results);
                let version = document.version();
                document.convert_to_found_document(version, data).set_has_local_mutations();
                previous_mask.map(|mask| {
                    mask.union_with(field_mask.fields())
                        .union_with(field_transforms.iter().map(FieldTransform::field_path))
                })
            }
            Mutation::Delete { .. } => {
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
                None
            }
            Mutation::Verify { .. } => previous_mask,
        }
    }

    /// Captures the pre-transform values a later replay needs (increment bases).
    pub fn extract_transform_base_value(&self, document: &MutableDocument) -> Option<MapValue> {
        let mut base: Option<MapValue> = None;
        for transform in self.field_transforms() {
            let existing = document.field(transform.field_path());
            if let Some(value) = transform.operation().base_value(existing) {
                base.get_or_insert_with(MapValue::empty)
                    .set(transform.field_path(), value);
            }
        }
        base
    }

    fn patch_values(&self) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        let mut values = BTreeMap::new();
        if let Mutation::Patch { data, field_mask, .. } = self {
            for path in field_mask.fields() {
                values.insert(path.clone(), data.get(path).cloned());
            }
        }
        values
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms()
            .iter()
            .map(|transform| {
                let previous = document.field(transform.field_path());
                let value = transform.operation().apply_to_local_view(previous, local_write_time);
                (transform.field_path().clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &MutableDocument,
        results: &[FirestoreValue],
    ) -> BTreeMap<FieldPath, Option<FirestoreValue>> {
        self.field_transforms()
            .iter()
            .enumerate()
            .map(|(index, transform)| {
                let previous = document.field(transform.field_path());
                let value = transform
                    .operation()
                    .apply_to_remote_document(previous, results.get(index));
                (transform.field_path().clone(), Some(value))
            })
            .collect()
    }
}

/// Builds the single mutation equivalent to the local changes on `document`.
///
/// `mask` is the set of fields written by pending batches, `None` when the document
/// was replaced wholesale. Returns `None` when the document carries no local changes.
pub fn calculate_overlay_mutation(document: &MutableDocument, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() || mask.map(FieldMask::is_empty).unwrap_or(false) {
        return None;
    }

    let Some(mask) = mask else {
        if document.is_no_document() {
            return Some(Mutation::delete(document.key().clone()));
        }
        return Some(Mutation::set(document.key().clone(), document.data().clone()));
    };

    let mut patch = MapValue::empty();
    let mut written = BTreeSet::new();
    for field in mask.fields() {
        if written.contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = document.field(&path);
        // Deleting a nested field patches its parent instead.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                path = parent;
                value = document.field(&path);
            }
        }
        match value {
            Some(value) => patch.set(&path, value.clone()),
            None => patch.delete(&path),
        }
        written.insert(path);
    }

    Some(Mutation::patch(
        document.key().clone(),
        patch,
        FieldMask::new(written),
        Precondition::None,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::TransformOperation;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn map(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut value = MapValue::empty();
        for (field, entry) in entries {
            value.set(&path(field), entry.clone());
        }
        value
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    #[test]
    fn set_replaces_document_locally() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(10),
            map(&[("old", FirestoreValue::from_bool(true))]),
        );
        let set = Mutation::set(key(), map(&[("name", FirestoreValue::from_string("a"))]));
        let mask = set.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(1, 0));
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert!(doc.field(&path("old")).is_none());
        assert_eq!(doc.field(&path("name")), Some(&FirestoreValue::from_string("a")));
    }

    #[test]
    fn patch_respects_exists_precondition() {
        let mut missing = MutableDocument::new_no_document(key(), version(3));
        let update = Mutation::update(key(), map(&[("a", FirestoreValue::from_integer(1))]));
        let mask = update.apply_to_local_view(&mut missing, Some(FieldMask::default()), Timestamp::new(1, 0));
        assert_eq!(mask, Some(FieldMask::default()));
        assert!(missing.is_no_document());
        assert!(!missing.has_local_mutations());
    }

    #[test]
    fn patch_deletes_masked_fields_missing_from_data() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("a", FirestoreValue::from_integer(1)), ("b", FirestoreValue::from_integer(2))]),
        );
        let patch = Mutation::patch(
            key(),
            MapValue::empty(),
            FieldMask::new(vec![path("b")]),
            Precondition::None,
        );
        let mask = patch.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(1, 0));
        assert!(doc.field(&path("b")).is_none());
        assert_eq!(mask, Some(FieldMask::new(vec![path("b")])));
    }

    #[test]
    fn remote_patch_with_failed_precondition_becomes_unknown() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let update = Mutation::update(key(), map(&[("a", FirestoreValue::from_integer(1))]));
        update.apply_to_remote_document(&mut doc, &MutationResult::new(version(7)));
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), version(7));
    }

    #[test]
    fn remote_set_uses_server_transform_results() {
        let mut doc = MutableDocument::new_invalid_document(key());
        let set = Mutation::set(key(), MapValue::empty()).with_transforms(vec![FieldTransform::new(
            path("at"),
            TransformOperation::ServerTimestamp,
        )]);
        let resolved = FirestoreValue::from_timestamp(Timestamp::new(42, 0));
        let result = MutationResult {
            version: version(9),
            transform_results: vec![resolved.clone()],
        };
        set.apply_to_remote_document(&mut doc, &result);
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.field(&path("at")), Some(&resolved));
    }

    #[test]
    fn extracts_increment_base_values() {
        let doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("count", FirestoreValue::from_string("NaN-ish"))]),
        );
        let patch = Mutation::patch(key(), MapValue::empty(), FieldMask::default(), Precondition::None)
            .with_transforms(vec![
                FieldTransform::new(path("count"), TransformOperation::NumericIncrement(FirestoreValue::from_integer(1))),
                FieldTransform::new(path("at"), TransformOperation::ServerTimestamp),
            ]);
        let base = patch.extract_transform_base_value(&doc).unwrap();
        assert_eq!(base.field_mask(), vec![path("count")]);
        assert_eq!(base.get(&path("count")), Some(&FirestoreValue::from_integer(0)));
    }

    #[test]
    fn overlay_for_deleted_nested_field_patches_parent() {
        let mut doc = MutableDocument::new_found_document(
            key(),
            version(1),
            map(&[("a.b", FirestoreValue::from_integer(1)), ("a.c", FirestoreValue::from_integer(2))]),
        );
        let patch = Mutation::patch(
            key(),
            MapValue::empty(),
            FieldMask::new(vec![path("a.b")]),
            Precondition::None,
        );
        let mask = patch.apply_to_local_view(&mut doc, Some(FieldMask::default()), Timestamp::new(1, 0));
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        match overlay {
            Mutation::Patch { field_mask, data, .. } => {
                assert_eq!(field_mask, FieldMask::new(vec![path("a")]));
                assert_eq!(data.get(&path("a.c")), Some(&FirestoreValue::from_integer(2)));
            }
            other => panic!("unexpected overlay {other:?}"),
        }
    }

    #[test]
    fn no_overlay_without_local_mutations() {
        let doc = MutableDocument::new_found_document(key(), version(1), MapValue::empty());
        assert!(calculate_overlay_mutation(&doc, None).is_none());
    }
}
