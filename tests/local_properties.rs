#![cfg(not(target_arch = "wasm32"))]

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use firestore_sync::firestore::core::{DocumentChangeType, Query, User, View, ViewSnapshot};
use firestore_sync::firestore::local::{LocalStore, MemoryPersistence, QueryEngineSettings};
use firestore_sync::firestore::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, FieldPath, Mutation, MutableDocument,
    MutationBatchResult, MutationResult, Precondition, SnapshotVersion, Timestamp,
};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};
use proptest::prelude::*;

fn store() -> LocalStore {
    LocalStore::new(
        Arc::new(MemoryPersistence::new()),
        QueryEngineSettings::default(),
        &User::new("alice"),
    )
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn field(name: &str) -> FieldPath {
    FieldPath::from_dot_separated(name).unwrap()
}

fn map(entries: &[(&str, i64)]) -> MapValue {
    let mut data = MapValue::empty();
    for (name, value) in entries {
        data.set(&field(name), FirestoreValue::from_integer(*value));
    }
    data
}

fn acknowledge(store: &mut LocalStore, batch_id: BatchId, at: i64) -> DocumentMap {
    let batch = store.next_mutation_batch(Some(batch_id - 1)).unwrap().unwrap();
    assert_eq!(batch.batch_id, batch_id);
    let results = batch
        .mutations
        .iter()
        .map(|_| MutationResult::new(SnapshotVersion::from_micros(at)))
        .collect();
    let result = MutationBatchResult::from(batch, SnapshotVersion::from_micros(at), results, Bytes::new());
    store.acknowledge_batch(&result).unwrap()
}

#[derive(Clone, Debug)]
enum Write {
    Set(Vec<(String, i64)>),
    Patch(String, i64),
    Update(String, i64),
    Delete,
}

fn write_strategy() -> impl Strategy<Value = Write> {
    let entries = prop::collection::vec(("[a-c]", 0i64..10), 0..3);
    prop_oneof![
        entries.prop_map(Write::Set),
        ("[a-c]", 0i64..10).prop_map(|(name, value)| Write::Patch(name, value)),
        ("[a-c]", 0i64..10).prop_map(|(name, value)| Write::Update(name, value)),
        Just(Write::Delete),
    ]
}

fn to_mutation(document: &DocumentKey, write: &Write) -> Mutation {
    match write {
        Write::Set(entries) => {
            let entries: Vec<(&str, i64)> = entries.iter().map(|(name, value)| (name.as_str(), *value)).collect();
            Mutation::set(document.clone(), map(&entries))
        }
        Write::Patch(name, value) => Mutation::patch(
            document.clone(),
            map(&[(name.as_str(), *value)]),
            FieldMask::new([field(name)]),
            Precondition::None,
        ),
        Write::Update(name, value) => Mutation::patch(
            document.clone(),
            map(&[(name.as_str(), *value)]),
            FieldMask::new([field(name)]),
            Precondition::Exists(true),
        ),
        Write::Delete => Mutation::delete(document.clone()),
    }
}

proptest! {
    #[test]
    fn overlay_matches_replaying_batches_in_order(writes in prop::collection::vec(write_strategy(), 1..8)) {
        let mut store = store();
        let document = key("rooms/d");
        let mutations: Vec<Mutation> = writes.iter().map(|write| to_mutation(&document, write)).collect();

        let mut replayed = MutableDocument::new_invalid_document(document.clone());
        let mut mask = Some(FieldMask::new([]));
        for mutation in &mutations {
            store.local_write(vec![mutation.clone()]).unwrap();
            mask = mutation.apply_to_local_view(&mut replayed, mask, Timestamp::now());
        }

        let cached = store.read_document(&document).unwrap();
        prop_assert_eq!(cached.is_found_document(), replayed.is_found_document());
        if replayed.is_found_document() {
            prop_assert_eq!(cached.data(), replayed.data());
        }
    }

    #[test]
    fn emitted_changes_rebuild_the_next_view(steps in prop::collection::vec(
        prop::collection::btree_map(0usize..5, prop::option::of(0i64..3), 1..4),
        1..8,
    )) {
        let query = Query::collection("rooms").unwrap();
        let mut view = View::new(query, DocumentKeySet::new());
        let mut previous = contents(&view.compute_initial_snapshot());

        for (step, changes) in steps.iter().enumerate() {
            let version = SnapshotVersion::from_micros(step as i64 + 1);
            let updates: DocumentMap = changes
                .iter()
                .map(|(index, value)| {
                    let document = key(&format!("rooms/{index}"));
                    let entry = match value {
                        Some(value) => MutableDocument::new_found_document(document.clone(), version, map(&[("v", *value)])),
                        None => MutableDocument::new_no_document(document.clone(), version),
                    };
                    (document, entry)
                })
                .collect();

            let doc_changes = view.compute_doc_changes(&updates, None);
            let view_change = view.apply_changes(doc_changes, false, None, false);
            let current = contents(&view.compute_initial_snapshot());

            let mut rebuilt = previous.clone();
            if let Some(snapshot) = &view_change.snapshot {
                prop_assert_eq!(&contents_of_old(snapshot), &previous);
                for change in &snapshot.doc_changes {
                    let document = change.document.key().clone();
                    match change.change_type {
                        DocumentChangeType::Removed => {
                            prop_assert!(rebuilt.remove(&document).is_some());
                        }
                        DocumentChangeType::Added => {
                            prop_assert!(rebuilt.insert(document, change.document.data().clone()).is_none());
                        }
                        DocumentChangeType::Modified | DocumentChangeType::Metadata => {
                            prop_assert!(rebuilt.insert(document, change.document.data().clone()).is_some());
                        }
                    }
                }
            }
            prop_assert_eq!(&rebuilt, &current);
            previous = current;
        }
    }
}

fn contents(snapshot: &ViewSnapshot) -> BTreeMap<DocumentKey, MapValue> {
    snapshot
        .docs
        .iter()
        .map(|document| (document.key().clone(), document.data().clone()))
        .collect()
}

fn contents_of_old(snapshot: &ViewSnapshot) -> BTreeMap<DocumentKey, MapValue> {
    snapshot
        .old_docs
        .iter()
        .map(|document| (document.key().clone(), document.data().clone()))
        .collect()
}

#[test]
fn removing_a_batch_recomputes_the_overlay_from_later_batches() {
    let mut store = store();
    let document = key("rooms/d");
    let first = store
        .local_write(vec![Mutation::set(document.clone(), map(&[("a", 1)]))])
        .unwrap()
        .batch_id;
    for index in 0..4 {
        store
            .local_write(vec![Mutation::set(key(&format!("rooms/other-{index}")), map(&[("x", index)]))])
            .unwrap();
    }
    let later = store
        .local_write(vec![Mutation::patch(
            document.clone(),
            map(&[("b", 2)]),
            FieldMask::new([field("b")]),
            Precondition::None,
        )])
        .unwrap()
        .batch_id;
    assert_eq!(later, first + 5);

    let changed = store.reject_batch(first).unwrap();

    let local = &changed[&document];
    assert!(local.is_found_document());
    assert!(local.has_local_mutations());
    assert_eq!(local.data(), &map(&[("b", 2)]));
    assert_eq!(store.read_document(&document).unwrap().data(), &map(&[("b", 2)]));
}

#[test]
fn acknowledging_the_first_of_two_field_writes_keeps_the_second_pending() {
    let mut store = store();
    let document = key("rooms/d");
    let first = store
        .local_write(vec![Mutation::set(document.clone(), map(&[("a", 1)]))])
        .unwrap()
        .batch_id;
    let written = store
        .local_write(vec![Mutation::patch(
            document.clone(),
            map(&[("b", 2)]),
            FieldMask::new([field("b")]),
            Precondition::Exists(true),
        )])
        .unwrap();
    assert_eq!(written.changes[&document].data(), &map(&[("a", 1), ("b", 2)]));

    let changed = acknowledge(&mut store, first, 10);

    let local = &changed[&document];
    assert_eq!(local.data(), &map(&[("a", 1), ("b", 2)]));
    assert!(local.has_local_mutations());
    assert_eq!(local.version(), SnapshotVersion::from_micros(10));
    assert_eq!(store.get_highest_unacknowledged_batch_id().unwrap(), written.batch_id);
}
