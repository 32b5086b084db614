#![cfg(not(target_arch = "wasm32"))]

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use firestore_sync::firestore::core::{FirestoreClient, FirestoreSettings, ListenOptions, ListenerRegistration, Query, TargetId, ViewSnapshot};
use firestore_sync::firestore::model::{DocumentKey, FieldPath, Mutation, MutableDocument, MutationResult, SnapshotVersion};
use firestore_sync::firestore::remote::{
    DocumentWatchChange, EmptyCredentialsProvider, InMemoryConnection, WatchChange, WatchTargetChange,
    WatchTargetChangeState, WriteResponse,
};
use firestore_sync::firestore::value::{FirestoreValue, MapValue};

#[derive(Clone, Debug, PartialEq)]
struct Seen {
    keys: Vec<String>,
    from_cache: bool,
    has_pending_writes: bool,
}

struct Harness {
    connection: InMemoryConnection,
    client: FirestoreClient,
}

impl Harness {
    async fn new() -> Self {
        let connection = InMemoryConnection::new();
        let client = FirestoreClient::new(
            FirestoreSettings::default(),
            Arc::new(connection.clone()),
            Arc::new(EmptyCredentialsProvider),
        )
        .await
        .expect("start client");
        Self { connection, client }
    }

    async fn settle(&self) {
        self.client.async_queue().drain().await.unwrap();
    }

    async fn listen(&self, query: &Query) -> (ListenerRegistration, Arc<Mutex<Vec<Seen>>>) {
        let seen: Arc<Mutex<Vec<Seen>>> = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let registration = self
            .client
            .listen(
                query.clone(),
                ListenOptions::default(),
                Arc::new(move |snapshot: &ViewSnapshot| {
                    recorder.lock().unwrap().push(Seen {
                        keys: snapshot.docs.keys().map(|key| key.to_string()).collect(),
                        from_cache: snapshot.from_cache,
                        has_pending_writes: snapshot.has_pending_writes(),
                    })
                }),
            )
            .await
            .expect("listen");
        self.settle().await;
        (registration, seen)
    }

    fn target_id_for(&self, query: &Query) -> TargetId {
        let target = query.to_target();
        self.connection
            .watched_targets()
            .into_iter()
            .find(|(_, target_data)| target_data.target == target)
            .map(|(target_id, _)| target_id)
            .expect("query is watched")
    }

    fn push(&self, change: WatchChange) {
        self.connection.push_watch_change(change).unwrap();
    }

    async fn deliver(&self, target_id: TargetId, documents: Vec<MutableDocument>, at: i64) {
        self.push(WatchChange::TargetChange(WatchTargetChange::new(
            WatchTargetChangeState::Added,
            vec![target_id],
        )));
        for document in documents {
            self.push(WatchChange::DocumentChange(DocumentWatchChange::update(document, vec![target_id])));
        }
        self.push(WatchChange::TargetChange(
            WatchTargetChange::new(WatchTargetChangeState::Current, vec![target_id])
                .with_resume_token(Bytes::from(format!("resume-{at}"))),
        ));
        self.snapshot_at(at).await;
    }

    async fn snapshot_at(&self, at: i64) {
        self.push(WatchChange::TargetChange(WatchTargetChange::global_snapshot(
            Bytes::new(),
            SnapshotVersion::from_micros(at),
        )));
        self.settle().await;
    }

    async fn acknowledge_write(&self, at: i64) {
        self.settle().await;
        self.connection
            .push_write_response(WriteResponse::handshake(Bytes::from_static(b"write-stream")))
            .unwrap();
        self.settle().await;
        self.connection
            .push_write_response(WriteResponse {
                stream_token: Bytes::from(format!("write-{at}")),
                commit_version: SnapshotVersion::from_micros(at),
                mutation_results: vec![MutationResult::new(SnapshotVersion::from_micros(at))],
            })
            .unwrap();
        self.settle().await;
    }
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn named(name: &str) -> MapValue {
    let mut data = MapValue::empty();
    data.set(&FieldPath::from_dot_separated("name").unwrap(), FirestoreValue::from_string(name));
    data
}

fn remote_doc(path: &str, at: i64, name: &str) -> MutableDocument {
    MutableDocument::new_found_document(key(path), SnapshotVersion::from_micros(at), named(name))
}

fn rooms() -> Query {
    Query::collection("rooms").unwrap()
}

#[tokio::test]
async fn offline_write_settles_in_exactly_one_emission() {
    let harness = Harness::new().await;
    harness.client.disable_network().await.unwrap();
    let (_registration, seen) = harness.listen(&rooms()).await;

    let (written, ()) = tokio::join!(
        harness
            .client
            .write(vec![Mutation::set(key("rooms/d"), named("a"))]),
        async {
            harness.settle().await;
            assert_eq!(
                seen.lock().unwrap().last(),
                Some(&Seen {
                    keys: vec!["rooms/d".to_string()],
                    from_cache: true,
                    has_pending_writes: true,
                })
            );
            let emitted_while_offline = seen.lock().unwrap().len();

            harness.client.enable_network().await.unwrap();
            harness.acknowledge_write(50).await;
            let target_id = harness.target_id_for(&rooms());
            harness.deliver(target_id, vec![remote_doc("rooms/d", 50, "a")], 60).await;

            let seen = seen.lock().unwrap();
            assert_eq!(
                seen[emitted_while_offline..],
                [Seen {
                    keys: vec!["rooms/d".to_string()],
                    from_cache: false,
                    has_pending_writes: false,
                }]
            );
        },
    );
    written.unwrap();
}

#[tokio::test]
async fn deleting_the_only_result_of_a_limited_query_requeries_the_cache() {
    let harness = Harness::new().await;
    let (_all_registration, _) = harness.listen(&rooms()).await;
    let all_target = harness.target_id_for(&rooms());
    harness
        .deliver(all_target, vec![remote_doc("rooms/a", 10, "a"), remote_doc("rooms/b", 10, "b")], 10)
        .await;

    let first = rooms().with_limit_to_first(1);
    let (_registration, seen) = harness.listen(&first).await;
    let first_target = harness.target_id_for(&first);
    harness.deliver(first_target, vec![remote_doc("rooms/a", 10, "a")], 20).await;
    assert_eq!(seen.lock().unwrap().last().unwrap().keys, vec!["rooms/a".to_string()]);

    harness.push(WatchChange::DocumentChange(DocumentWatchChange::delete(
        key("rooms/a"),
        SnapshotVersion::from_micros(30),
        vec![first_target, all_target],
    )));
    harness.snapshot_at(30).await;

    assert_eq!(seen.lock().unwrap().last().unwrap().keys, vec!["rooms/b".to_string()]);
    let cached = harness.client.get_documents_from_local_cache(first).await.unwrap();
    assert_eq!(cached.docs.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
}

#[tokio::test]
async fn acknowledged_write_is_kept_until_the_watch_catches_up() {
    let harness = Harness::new().await;
    let (_registration, seen) = harness.listen(&rooms()).await;
    let target_id = harness.target_id_for(&rooms());
    harness.deliver(target_id, vec![], 10).await;

    let (written, ()) = tokio::join!(
        harness
            .client
            .write(vec![Mutation::set(key("rooms/d"), named("a"))]),
        async {
            harness.acknowledge_write(20).await;
        },
    );
    written.unwrap();
    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert!(last.has_pending_writes);

    harness.push(WatchChange::DocumentChange(DocumentWatchChange::update(
        remote_doc("rooms/d", 20, "a"),
        vec![target_id],
    )));
    harness.snapshot_at(20).await;

    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert!(!last.has_pending_writes);
    assert!(!last.from_cache);
}
