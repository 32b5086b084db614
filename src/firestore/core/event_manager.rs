use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::firestore::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::firestore::core::view_snapshot::DocumentChangeType;
use crate::firestore::core::{OnlineState, Query, ViewSnapshot};
use crate::firestore::error::{cancelled, FirestoreError, FirestoreResult};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (pending writes, `from_cache`).
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot until the backend confirms it, unless offline.
    pub wait_for_sync_when_online: bool,
}

/// Receives the snapshots of one query listener.
pub trait ViewSnapshotObserver: Send + Sync {
    fn on_next(&self, snapshot: &ViewSnapshot);

    /// The listen failed; no further snapshots follow.
    fn on_error(&self, error: &FirestoreError) {
        log::warn!("query listener failed: {error}");
    }
}

impl<F> ViewSnapshotObserver for F
where
    F: Fn(&ViewSnapshot) + Send + Sync,
{
    fn on_next(&self, snapshot: &ViewSnapshot) {
        self(snapshot)
    }
}

struct QueryListenerState {
    raised_initial_event: bool,
    /// Whether the last snapshot handed to the observer was settled.
    raised_settled: bool,
    snap: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// Decides which view snapshots of a query reach one observer.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: Arc<dyn ViewSnapshotObserver>,
    muted: AtomicBool,
    state: StdMutex<QueryListenerState>,
}

impl Debug for QueryListener {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryListener")
            .field("query", &self.query.canonical_id())
            .field("options", &self.options)
            .field("muted", &self.is_muted())
            .finish()
    }
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: Arc<dyn ViewSnapshotObserver>) -> Self {
        Self {
            query,
            options,
            observer,
            muted: AtomicBool::new(false),
            state: StdMutex::new(QueryListenerState {
                raised_initial_event: false,
                raised_settled: false,
                snap: None,
                online_state: OnlineState::Unknown,
            }),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Stops delivering to the observer. Used once the registration is removed.
    pub fn mute(&self) {
        self.muted.store(true, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, QueryListenerState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Returns whether a snapshot was raised to the observer.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            let doc_changes = snapshot
                .doc_changes
                .into_iter()
                .filter(|change| change.change_type != DocumentChangeType::Metadata)
                .collect();
            ViewSnapshot {
                doc_changes,
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        let raised = {
            let mut state = self.lock_state();
            let raised = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, state.online_state) {
                    Some(initial_event(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(&state, &snapshot) {
                Some(snapshot.clone())
            } else {
                None
            };
            if let Some(raised) = &raised {
                state.raised_initial_event = true;
                state.raised_settled = raised.is_settled();
            }
            state.snap = Some(snapshot);
            raised
        };

        match raised {
            Some(snapshot) => {
                self.deliver(&snapshot);
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        if !self.is_muted() {
            self.observer.on_error(&error);
        }
    }

    /// Returns whether the change released a held back first snapshot.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let raised = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            match &state.snap {
                Some(snap) if !state.raised_initial_event && self.should_raise_initial_event(snap, online_state) => {
                    let raised = initial_event(snap);
                    state.raised_initial_event = true;
                    state.raised_settled = raised.is_settled();
                    Some(raised)
                }
                _ => None,
            }
        };
        match raised {
            Some(snapshot) => {
                self.deliver(&snapshot);
                true
            }
            None => false,
        }
    }

    fn deliver(&self, snapshot: &ViewSnapshot) {
        if !self.is_muted() {
            self.observer.on_next(snapshot);
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cache result is only worth showing when there is nothing better coming.
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, state: &QueryListenerState, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = state
            .snap
            .as_ref()
            .map_or(false, |previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if !snapshot.sync_state_changed && !pending_writes_changed {
            return false;
        }
        if self.options.include_metadata_changes {
            return true;
        }
        snapshot.is_settled() && !state.raised_settled
    }
}

fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
    let mut initial = ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.docs.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
        snapshot.has_cached_results,
    );
    initial.excludes_metadata_changes = snapshot.excludes_metadata_changes;
    initial
}

struct QueryListenersInfo {
    view_snap: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

/// Fans view snapshots out to every listener of a query and listens to each query in the
/// sync engine only once.
pub struct EventManager {
    sync_engine: SyncEngine,
    state: StdMutex<EventManagerState>,
}

impl EventManager {
    /// Creates the manager and registers it with `sync_engine`.
    pub fn new(sync_engine: SyncEngine) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine,
            state: StdMutex::new(EventManagerState {
                queries: BTreeMap::new(),
                online_state: OnlineState::Unknown,
            }),
        });
        let listener: Arc<dyn SyncEngineListener> = manager.clone();
        manager.sync_engine.set_listener(Arc::downgrade(&listener));
        manager
    }

    fn lock_state(&self) -> MutexGuard<'_, EventManagerState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub async fn listen(&self, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let first_listen = !self.lock_state().queries.contains_key(&canonical_id);
        let view_snap = if first_listen {
            Some(self.sync_engine.listen(listener.query().clone()).await?)
        } else {
            None
        };

        let (snapshot, online_state) = {
            let mut state = self.lock_state();
            let online_state = state.online_state;
            let info = state
                .queries
                .entry(canonical_id)
                .or_insert_with(|| QueryListenersInfo {
                    view_snap: None,
                    listeners: Vec::new(),
                });
            if view_snap.is_some() {
                info.view_snap = view_snap;
            }
            info.listeners.push(Arc::clone(&listener));
            (info.view_snap.clone(), online_state)
        };

        listener.apply_online_state_change(online_state);
        if let Some(snapshot) = snapshot {
            listener.on_view_snapshot(snapshot);
        }
        Ok(())
    }

    /// Detaches `listener`; the last listener of a query stops it in the sync engine.
    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query().canonical_id();
        let last_listen = {
            let mut state = self.lock_state();
            match state.queries.get_mut(&canonical_id) {
                Some(info) => {
                    info.listeners.retain(|candidate| !Arc::ptr_eq(candidate, listener));
                    if info.listeners.is_empty() {
                        state.queries.remove(&canonical_id);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if last_listen {
            self.sync_engine.unlisten(listener.query()).await
        } else {
            Ok(())
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock_state()
            .queries
            .values()
            .map(|info| info.listeners.len())
            .sum()
    }

    /// Fails every listener with `Cancelled`.
    pub fn terminate(&self) {
        let queries = std::mem::take(&mut self.lock_state().queries);
        for listener in queries.into_values().flat_map(|info| info.listeners) {
            listener.on_error(cancelled("the client has been terminated"));
        }
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let deliveries: Vec<(Vec<Arc<QueryListener>>, ViewSnapshot)> = {
            let mut state = self.lock_state();
            snapshots
                .into_iter()
                .filter_map(|snapshot| {
                    let info = state.queries.get_mut(&snapshot.query.canonical_id())?;
                    info.view_snap = Some(snapshot.clone());
                    Some((info.listeners.clone(), snapshot))
                })
                .collect()
        };
        for (listeners, snapshot) in deliveries {
            for listener in listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let listeners = self
            .lock_state()
            .queries
            .remove(&query.canonical_id())
            .map(|info| info.listeners)
            .unwrap_or_default();
        for listener in listeners {
            listener.on_error(error.clone());
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        for listener in listeners {
            listener.apply_online_state_change(online_state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::view_snapshot::DocumentViewChange;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::model::{DocumentKey, DocumentKeySet, DocumentSet, MutableDocument, SnapshotVersion};
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct Recorder {
        snapshots: StdMutex<Vec<ViewSnapshot>>,
        errors: StdMutex<Vec<FirestoreErrorCode>>,
    }

    impl ViewSnapshotObserver for Recorder {
        fn on_next(&self, snapshot: &ViewSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot.clone());
        }

        fn on_error(&self, error: &FirestoreError) {
            self.errors.lock().unwrap().push(error.code);
        }
    }

    fn rooms() -> Query {
        Query::collection("rooms").unwrap()
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(1),
            MapValue::empty(),
        )
    }

    struct SnapshotBuilder {
        docs: Vec<MutableDocument>,
        changes: Vec<DocumentViewChange>,
        pending: bool,
        from_cache: bool,
        sync_state_changed: bool,
    }

    impl SnapshotBuilder {
        fn new(paths: &[&str]) -> Self {
            Self {
                docs: paths.iter().map(|path| doc(path)).collect(),
                changes: Vec::new(),
                pending: false,
                from_cache: true,
                sync_state_changed: false,
            }
        }

        fn change(mut self, change_type: DocumentChangeType, path: &str) -> Self {
            self.changes.push(DocumentViewChange {
                change_type,
                document: doc(path),
            });
            self
        }

        fn pending(mut self) -> Self {
            self.pending = true;
            self
        }

        fn synced(mut self) -> Self {
            self.from_cache = false;
            self.sync_state_changed = true;
            self
        }

        fn build(self) -> ViewSnapshot {
            let query = rooms();
            let mut docs = DocumentSet::new(query.document_comparator());
            for document in &self.docs {
                docs.add(document.clone());
            }
            let mutated_keys: DocumentKeySet = if self.pending {
                self.docs.iter().map(|document| document.key().clone()).collect()
            } else {
                DocumentKeySet::new()
            };
            ViewSnapshot {
                old_docs: docs.empty_like(),
                query,
                docs,
                doc_changes: self.changes,
                mutated_keys,
                from_cache: self.from_cache,
                sync_state_changed: self.sync_state_changed,
                excludes_metadata_changes: false,
                has_cached_results: false,
            }
        }
    }

    fn listener(options: ListenOptions) -> (QueryListener, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (QueryListener::new(rooms(), options, recorder.clone()), recorder)
    }

    #[test]
    fn empty_cached_result_waits_until_offline() {
        let (listener, recorder) = listener(ListenOptions::default());
        let empty = SnapshotBuilder::new(&[]).build();
        assert!(!listener.on_view_snapshot(empty));
        assert!(recorder.snapshots.lock().unwrap().is_empty());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let snapshots = recorder.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots[0].from_cache);
    }

    #[test]
    fn cached_documents_are_raised_at_once() {
        let (listener, recorder) = listener(ListenOptions::default());
        let cached = SnapshotBuilder::new(&["rooms/a"])
            .change(DocumentChangeType::Added, "rooms/a")
            .build();
        assert!(listener.on_view_snapshot(cached));
        assert_eq!(recorder.snapshots.lock().unwrap()[0].doc_changes.len(), 1);
    }

    #[test]
    fn waiting_for_sync_holds_back_cached_results_while_online() {
        let (listener, recorder) = listener(ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        });
        listener.apply_online_state_change(OnlineState::Online);
        let cached = SnapshotBuilder::new(&["rooms/a"])
            .change(DocumentChangeType::Added, "rooms/a")
            .build();
        assert!(!listener.on_view_snapshot(cached));

        let synced = SnapshotBuilder::new(&["rooms/a"]).synced().build();
        assert!(listener.on_view_snapshot(synced));
        let snapshots = recorder.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].from_cache);
        // The first event always lists every document as added.
        assert_eq!(snapshots[0].doc_changes.len(), 1);
    }

    #[test]
    fn metadata_changes_are_filtered_unless_requested() {
        let (quiet, quiet_recorder) = listener(ListenOptions::default());
        let (chatty, chatty_recorder) = listener(ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        });
        let first = SnapshotBuilder::new(&["rooms/a"])
            .change(DocumentChangeType::Added, "rooms/a")
            .pending()
            .build();
        let acknowledged = SnapshotBuilder::new(&["rooms/a"])
            .change(DocumentChangeType::Metadata, "rooms/a")
            .build();
        for listener in [&quiet, &chatty] {
            listener.on_view_snapshot(first.clone());
            listener.on_view_snapshot(acknowledged.clone());
        }

        assert_eq!(quiet_recorder.snapshots.lock().unwrap().len(), 1);
        let chatty_snapshots = chatty_recorder.snapshots.lock().unwrap();
        assert_eq!(chatty_snapshots.len(), 2);
        assert_eq!(chatty_snapshots[1].doc_changes[0].change_type, DocumentChangeType::Metadata);
        assert!(!chatty_snapshots[1].excludes_metadata_changes);
    }

    #[test]
    fn settling_is_raised_exactly_once() {
        let (listener, recorder) = listener(ListenOptions::default());
        listener.on_view_snapshot(
            SnapshotBuilder::new(&["rooms/a"])
                .change(DocumentChangeType::Added, "rooms/a")
                .pending()
                .build(),
        );
        // Acknowledged but still from cache: not settled yet.
        assert!(!listener.on_view_snapshot(
            SnapshotBuilder::new(&["rooms/a"])
                .change(DocumentChangeType::Metadata, "rooms/a")
                .build()
        ));
        assert!(listener.on_view_snapshot(SnapshotBuilder::new(&["rooms/a"]).synced().build()));
        assert!(!listener.on_view_snapshot(SnapshotBuilder::new(&["rooms/a"]).synced().build()));

        let snapshots = recorder.snapshots.lock().unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[1].is_settled());
        assert!(snapshots[1].excludes_metadata_changes);
    }

    #[test]
    fn muted_listener_stays_silent() {
        let (listener, recorder) = listener(ListenOptions::default());
        listener.mute();
        listener.on_view_snapshot(
            SnapshotBuilder::new(&["rooms/a"])
                .change(DocumentChangeType::Added, "rooms/a")
                .build(),
        );
        listener.on_error(permission_denied("no"));
        assert!(recorder.snapshots.lock().unwrap().is_empty());
        assert!(recorder.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn closures_observe_snapshots() {
        let seen = Arc::new(StdMutex::new(0usize));
        let counter = Arc::clone(&seen);
        let listener = QueryListener::new(
            rooms(),
            ListenOptions::default(),
            Arc::new(move |snapshot: &ViewSnapshot| *counter.lock().unwrap() += snapshot.docs.len()),
        );
        listener.on_view_snapshot(
            SnapshotBuilder::new(&["rooms/a", "rooms/b"])
                .change(DocumentChangeType::Added, "rooms/a")
                .change(DocumentChangeType::Added, "rooms/b")
                .build(),
        );
        assert_eq!(*seen.lock().unwrap(), 2);
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod engine_tests {
    use super::*;
    use crate::firestore::core::settings::SyncEngineSettings;
    use crate::firestore::core::{AsyncQueue, User};
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::{LocalStore, MemoryPersistence, QueryEngineSettings};
    use crate::firestore::model::DatabaseId;
    use crate::firestore::remote::{
        EmptyCredentialsProvider, InMemoryConnection, WatchChange, WatchTargetChange, WatchTargetChangeState,
    };
    use crate::util::backoff::BackoffConfig;

    #[derive(Default)]
    struct Recorder {
        snapshots: StdMutex<Vec<ViewSnapshot>>,
        errors: StdMutex<Vec<FirestoreErrorCode>>,
    }

    impl ViewSnapshotObserver for Recorder {
        fn on_next(&self, snapshot: &ViewSnapshot) {
            self.snapshots.lock().unwrap().push(snapshot.clone());
        }

        fn on_error(&self, error: &FirestoreError) {
            self.errors.lock().unwrap().push(error.code);
        }
    }

    async fn manager() -> (Arc<EventManager>, InMemoryConnection, AsyncQueue) {
        let queue = AsyncQueue::new();
        let connection = InMemoryConnection::new();
        let local_store = Arc::new(async_lock::Mutex::new(LocalStore::new(
            Arc::new(MemoryPersistence::new()),
            QueryEngineSettings::default(),
            &User::unauthenticated(),
        )));
        let sync_engine = SyncEngine::new(
            local_store,
            Arc::new(connection.clone()),
            Arc::new(EmptyCredentialsProvider),
            queue.clone(),
            DatabaseId::for_project("test-project"),
            BackoffConfig::default(),
            SyncEngineSettings::default(),
            User::unauthenticated(),
        );
        sync_engine.remote_store().start().await.unwrap();
        (EventManager::new(sync_engine), connection, queue)
    }

    fn rooms() -> Query {
        Query::collection("rooms").unwrap()
    }

    #[tokio::test]
    async fn listeners_of_one_query_share_a_target() {
        let (manager, connection, queue) = manager().await;
        let first = Arc::new(QueryListener::new(rooms(), ListenOptions::default(), Arc::new(Recorder::default())));
        let second = Arc::new(QueryListener::new(rooms(), ListenOptions::default(), Arc::new(Recorder::default())));
        manager.listen(Arc::clone(&first)).await.unwrap();
        manager.listen(Arc::clone(&second)).await.unwrap();
        queue.drain().await.unwrap();
        assert_eq!(connection.watched_targets().len(), 1);
        assert_eq!(manager.listener_count(), 2);

        manager.unlisten(&first).await.unwrap();
        queue.drain().await.unwrap();
        assert_eq!(connection.watched_targets().len(), 1);

        manager.unlisten(&second).await.unwrap();
        queue.drain().await.unwrap();
        assert!(connection.watched_targets().is_empty());
    }

    #[tokio::test]
    async fn rejected_target_fails_every_listener_once() {
        let (manager, connection, queue) = manager().await;
        let recorders = [Arc::new(Recorder::default()), Arc::new(Recorder::default())];
        for recorder in &recorders {
            let listener = QueryListener::new(rooms(), ListenOptions::default(), recorder.clone());
            manager.listen(Arc::new(listener)).await.unwrap();
        }
        queue.drain().await.unwrap();
        let target_id = *connection.watched_targets().keys().next().unwrap();

        connection
            .push_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(WatchTargetChangeState::Removed, vec![target_id])
                    .with_cause(permission_denied("no access")),
            ))
            .unwrap();
        queue.drain().await.unwrap();

        for recorder in &recorders {
            assert_eq!(*recorder.errors.lock().unwrap(), vec![FirestoreErrorCode::PermissionDenied]);
        }
        assert_eq!(manager.listener_count(), 0);
    }

    #[tokio::test]
    async fn terminate_cancels_every_listener() {
        let (manager, _connection, _queue) = manager().await;
        let recorder = Arc::new(Recorder::default());
        manager
            .listen(Arc::new(QueryListener::new(rooms(), ListenOptions::default(), recorder.clone())))
            .await
            .unwrap();
        manager.terminate();
        assert_eq!(*recorder.errors.lock().unwrap(), vec![FirestoreErrorCode::Cancelled]);
    }
}
