use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::oneshot;

use crate::firestore::core::settings::SyncEngineSettings;
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::{
    AsyncQueue, DelayedOperation, OnlineState, Query, Target, TargetId, TargetIdGenerator, TimerId, User, ViewSnapshot,
};
use crate::firestore::error::{cancelled, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::INVALID_SEQUENCE_NUMBER;
use crate::firestore::local::{LocalStore, LocalViewChanges, TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, DatabaseId, DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, MutableDocumentMap, Mutation,
    MutationBatchResult, SnapshotVersion,
};
use crate::firestore::remote::{
    Connection, CredentialsProvider, RemoteEvent, RemoteStore, RemoteSyncer, TargetChange,
};
use crate::util::backoff::BackoffConfig;

/// Receives what the sync engine produces for query listeners.
///
/// Called on the async queue with no sync engine lock held.
pub trait SyncEngineListener: Send + Sync {
    /// New snapshots, one per view that changed, in the order the views were updated.
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The backend rejected `query`; its view is gone and no further snapshots follow.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Resolves when the backend acknowledges or rejects a write.
pub type WriteAcknowledgement = oneshot::Receiver<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A document the client is asking the backend about directly.
struct LimboResolution {
    key: DocumentKey,
    /// Whether the limbo target has reported the document as existing.
    received_document: bool,
}

enum RemoteAction {
    Listen(TargetData),
    Unlisten(TargetId),
}

/// Side effects collected under the state lock and carried out once it is released.
#[derive(Default)]
struct Effects {
    remote: Vec<RemoteAction>,
    snapshots: Vec<ViewSnapshot>,
    errors: Vec<(Query, FirestoreError)>,
}

struct SyncEngineState {
    query_views_by_query: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets hold each document in limbo.
    limbo_document_refs: ReferenceSet,
    mutation_user_callbacks: BTreeMap<String, BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>>,
    pending_unlistens: BTreeMap<String, DelayedOperation>,
    limbo_target_id_generator: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    online_state: OnlineState,
    current_user: User,
}

impl SyncEngineState {
    /// Feeds changed documents through every view, tracks limbo changes and records the
    /// resulting snapshots.
    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        local_store: &mut LocalStore,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
        effects: &mut Effects,
    ) -> FirestoreResult<()> {
        let mut local_view_changes = Vec::new();
        let canonical_ids: Vec<String> = self.query_views_by_query.keys().cloned().collect();

        for canonical_id in canonical_ids {
            let Some(query_view) = self.query_views_by_query.get_mut(&canonical_id) else {
                continue;
            };
            let target_id = query_view.target_id;

            let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
            if doc_changes.needs_refill {
                let query_result = local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_doc_changes(&query_result.documents, Some(doc_changes));
            }

            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let target_is_pending_reset =
                remote_event.map_or(false, |event| event.target_mismatches.contains_key(&target_id));
            let view_change = query_view
                .view
                .apply_changes(doc_changes, true, target_change, target_is_pending_reset);

            self.update_tracked_limbos(target_id, &view_change.limbo_changes, effects);
            if let Some(snapshot) = view_change.snapshot {
                local_view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                effects.snapshots.push(snapshot);
            }
        }

        local_store.notify_local_view_changes(&local_view_changes)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        local_store: &LocalStore,
        query: Query,
        target_id: TargetId,
        resume_token: Bytes,
        effects: &mut Effects,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        // A fresh view is never current until the backend says so.
        let synthesized = TargetChange::synthesized_for_current_change(false, resume_token);
        let view_change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(target_id, &view_change.limbo_changes, effects);

        let snapshot = match view_change.snapshot {
            Some(snapshot) => snapshot,
            None => view.compute_initial_snapshot(),
        };
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        self.query_views_by_query.insert(
            query.canonical_id(),
            QueryView {
                query,
                target_id,
                view,
            },
        );
        Ok(snapshot)
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, limbo_changes: &[LimboDocumentChange], effects: &mut Effects) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key, effects);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document {key} left limbo");
                    self.limbo_document_refs.remove_reference(key, target_id);
                    if !self.limbo_document_refs.contains_key(key) {
                        self.remove_limbo_target(key, effects);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: &DocumentKey, effects: &mut Effects) {
        if !self.active_limbo_targets_by_key.contains_key(key) && !self.enqueued_limbo_resolutions.contains(key) {
            log::debug!("new document in limbo: {key}");
            self.enqueued_limbo_resolutions.push_back(key.clone());
            self.pump_enqueued_limbo_resolutions(effects);
        }
    }

    /// Starts listens for enqueued limbo documents while there is room.
    fn pump_enqueued_limbo_resolutions(&mut self, effects: &mut Effects) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next_id();
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), limbo_target_id);
            effects.remote.push(RemoteAction::Listen(TargetData::new(
                Target::for_document(&key),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, effects: &mut Effects) {
        self.enqueued_limbo_resolutions.retain(|enqueued| enqueued != key);
        let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        effects.remote.push(RemoteAction::Unlisten(limbo_target_id));
        self.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions(effects);
    }

    /// Drops every view of `target_id`, reporting `error` to their listeners if given.
    fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<FirestoreError>, effects: &mut Effects) {
        if let Some(queries) = self.queries_by_target.remove(&target_id) {
            for query in queries {
                self.query_views_by_query.remove(&query.canonical_id());
                if let Some(error) = &error {
                    effects.errors.push((query, error.clone()));
                }
            }
        }

        let limbo_keys = self.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key, effects);
            }
        }
    }

    fn process_user_callback(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        let user_key = self.current_user.to_key();
        let callback = self
            .mutation_user_callbacks
            .get_mut(&user_key)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            // The caller may have stopped waiting.
            let _ = callback.send(result);
        }
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(limbo) = self.active_limbo_resolutions_by_target.get(&target_id) {
            if limbo.received_document {
                return DocumentKeySet::from([limbo.key.clone()]);
            }
            return DocumentKeySet::new();
        }

        let mut keys = DocumentKeySet::new();
        let Some(queries) = self.queries_by_target.get(&target_id) else {
            return keys;
        };
        for query in queries {
            if let Some(query_view) = self.query_views_by_query.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }
}

/// Treats `FailedPrecondition` from the persistence layer as a no-op.
fn ignore_failed_precondition<T>(result: FirestoreResult<T>) -> FirestoreResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.code == FirestoreErrorCode::FailedPrecondition => {
            log::warn!("ignoring persistence failure: {err}");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

struct SyncEngineInner {
    local_store: Arc<Mutex<LocalStore>>,
    remote_store: RemoteStore,
    queue: AsyncQueue,
    settings: SyncEngineSettings,
    state: StdMutex<SyncEngineState>,
    listener: StdMutex<Option<Weak<dyn SyncEngineListener>>>,
}

impl SyncEngineInner {
    fn lock_state(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    async fn flush(&self, effects: Effects) -> FirestoreResult<()> {
        for action in effects.remote {
            match action {
                RemoteAction::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteAction::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        let Some(listener) = self.listener() else {
            return Ok(());
        };
        for (query, error) in effects.errors {
            log::warn!("listen to {} failed: {error}", query.canonical_id());
            listener.on_watch_error(&query, error);
        }
        if !effects.snapshots.is_empty() {
            listener.on_watch_change(effects.snapshots);
        }
        Ok(())
    }
}

/// Coordinates views, limbo resolution and pending writes between the local store and
/// the remote store.
///
/// Every operation is expected to run on the client's async queue.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_store: Arc<Mutex<LocalStore>>,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        queue: AsyncQueue,
        database_id: DatabaseId,
        backoff: BackoffConfig,
        settings: SyncEngineSettings,
        current_user: User,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<SyncEngineInner>| SyncEngineInner {
            remote_store: RemoteStore::new(
                Arc::clone(&local_store),
                connection,
                credentials,
                queue.clone(),
                database_id,
                backoff,
                Arc::new(SyncEngineRemoteSyncer { engine: weak.clone() }),
            ),
            local_store,
            queue,
            state: StdMutex::new(SyncEngineState {
                query_views_by_query: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                mutation_user_callbacks: BTreeMap::new(),
                pending_unlistens: BTreeMap::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions,
                online_state: OnlineState::Unknown,
                current_user,
            }),
            settings,
            listener: StdMutex::new(None),
        });
        Self { inner }
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *self
            .inner
            .listener
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(listener);
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.inner.remote_store
    }

    pub fn local_store(&self) -> &Arc<Mutex<LocalStore>> {
        &self.inner.local_store
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.lock_state().online_state
    }

    pub fn current_user(&self) -> User {
        self.inner.lock_state().current_user.clone()
    }

    /// Starts watching `query` and returns its first snapshot, computed from the cache.
    ///
    /// Listening again while a delayed unlisten is pending keeps the existing target.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        let mut effects = Effects::default();
        let snapshot = {
            let mut local_store = self.inner.local_store.lock().await;
            let mut state = self.inner.lock_state();
            if let Some(pending) = state.pending_unlistens.remove(&canonical_id) {
                log::debug!("listen to {canonical_id} cancelled a pending unlisten");
                pending.cancel();
            }

            let existing = state
                .query_views_by_query
                .get(&canonical_id)
                .map(|query_view| query_view.view.compute_initial_snapshot());
            match existing {
                Some(snapshot) => snapshot,
                None => {
                    let target_data = local_store.allocate_target(query.to_target())?;
                    log::debug!("listening to {canonical_id} as target {}", target_data.target_id);
                    let snapshot = state.initialize_view_and_compute_snapshot(
                        &local_store,
                        query,
                        target_data.target_id,
                        target_data.resume_token.clone(),
                        &mut effects,
                    )?;
                    effects.remote.push(RemoteAction::Listen(target_data));
                    snapshot
                }
            }
        };
        self.inner.flush(effects).await?;
        Ok(snapshot)
    }

    /// Stops watching `query`, after the configured grace period if there is one.
    pub async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let grace_period_ms = self.inner.settings.unlisten_grace_period_ms;
        if grace_period_ms == 0 {
            return self.unlisten_now(query).await;
        }

        let engine = Arc::downgrade(&self.inner);
        let delayed_query = query.clone();
        let operation = self.inner.queue.enqueue_after_delay(
            TimerId::UnlistenGracePeriod,
            Duration::from_millis(grace_period_ms),
            async move {
                match engine.upgrade() {
                    Some(inner) => SyncEngine { inner }.unlisten_now(&delayed_query).await,
                    None => Ok(()),
                }
            },
        );
        let previous = self
            .inner
            .lock_state()
            .pending_unlistens
            .insert(query.canonical_id(), operation);
        if let Some(previous) = previous {
            previous.cancel();
        }
        Ok(())
    }

    async fn unlisten_now(&self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let mut effects = Effects::default();
        {
            let mut local_store = self.inner.local_store.lock().await;
            let mut state = self.inner.lock_state();
            state.pending_unlistens.remove(&canonical_id);

            let Some(target_id) = state
                .query_views_by_query
                .get(&canonical_id)
                .map(|query_view| query_view.target_id)
            else {
                log::debug!("unlisten from {canonical_id} ignored: no view");
                return Ok(());
            };

            let shared = state
                .queries_by_target
                .get(&target_id)
                .map_or(false, |queries| queries.len() > 1);
            if shared {
                if let Some(queries) = state.queries_by_target.get_mut(&target_id) {
                    queries.retain(|candidate| candidate.canonical_id() != canonical_id);
                }
                state.query_views_by_query.remove(&canonical_id);
                return Ok(());
            }

            log::debug!("unlistening from {canonical_id} (target {target_id})");
            ignore_failed_precondition(local_store.release_target(target_id, false))?;
            effects.remote.push(RemoteAction::Unlisten(target_id));
            state.remove_and_cleanup_target(target_id, None, &mut effects);
        }
        self.inner.flush(effects).await
    }

    /// Applies `mutations` locally and queues them for the backend.
    ///
    /// The returned receiver resolves once the backend accepts or rejects the batch. It
    /// must not be awaited on the async queue.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteAcknowledgement> {
        let (sender, receiver) = oneshot::channel();
        let mut effects = Effects::default();
        {
            let mut local_store = self.inner.local_store.lock().await;
            let result = local_store.local_write(mutations)?;
            log::debug!("queued write batch {}", result.batch_id);

            let mut state = self.inner.lock_state();
            let user_key = state.current_user.to_key();
            state
                .mutation_user_callbacks
                .entry(user_key)
                .or_default()
                .insert(result.batch_id, sender);
            state.emit_new_snaps_and_notify_local_store(&mut local_store, &result.changes, None, &mut effects)?;
        }
        self.inner.flush(effects).await?;
        self.inner.remote_store.fill_write_pipeline().await?;
        Ok(receiver)
    }

    pub async fn apply_remote_event(&self, remote_event: RemoteEvent) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut local_store = self.inner.local_store.lock().await;
            let mut state = self.inner.lock_state();

            for (target_id, change) in &remote_event.target_changes {
                let Some(limbo) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                assert!(
                    change.document_change_count() <= 1,
                    "limbo resolution for a single document contains multiple changes"
                );
                if !change.added_documents.is_empty() {
                    limbo.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    assert!(limbo.received_document, "modified limbo document {} was never added", limbo.key);
                } else if !change.removed_documents.is_empty() {
                    assert!(limbo.received_document, "removed limbo document {} was never added", limbo.key);
                    limbo.received_document = false;
                }
            }

            let Some(changes) = ignore_failed_precondition(local_store.apply_remote_event(&remote_event))? else {
                return Ok(());
            };
            state.emit_new_snaps_and_notify_local_store(&mut local_store, &changes, Some(&remote_event), &mut effects)?;
        }
        self.inner.flush(effects).await
    }

    /// The backend refused a target. Query listeners get the error; a refused limbo
    /// target counts as proof the document is gone.
    pub async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        let limbo_event = {
            let mut local_store = self.inner.local_store.lock().await;
            let mut state = self.inner.lock_state();

            match state.active_limbo_resolutions_by_target.remove(&target_id) {
                Some(limbo) => {
                    log::debug!("limbo resolution for {} rejected: {error}", limbo.key);
                    state.active_limbo_targets_by_key.remove(&limbo.key);
                    state.pump_enqueued_limbo_resolutions(&mut effects);

                    let mut document_updates = MutableDocumentMap::new();
                    document_updates.insert(
                        limbo.key.clone(),
                        MutableDocument::new_no_document(limbo.key.clone(), SnapshotVersion::min()),
                    );
                    Some(RemoteEvent {
                        snapshot_version: SnapshotVersion::min(),
                        document_updates,
                        resolved_limbo_documents: DocumentKeySet::from([limbo.key]),
                        ..RemoteEvent::default()
                    })
                }
                None => {
                    ignore_failed_precondition(local_store.release_target(target_id, false))?;
                    state.remove_and_cleanup_target(target_id, Some(error), &mut effects);
                    None
                }
            }
        };
        self.inner.flush(effects).await?;
        match limbo_event {
            Some(event) => self.apply_remote_event(event).await,
            None => Ok(()),
        }
    }

    pub async fn apply_successful_write(&self, batch_result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = batch_result.batch.batch_id;
        let mut effects = Effects::default();
        {
            let mut local_store = self.inner.local_store.lock().await;
            let Some(changes) = ignore_failed_precondition(local_store.acknowledge_batch(&batch_result))? else {
                return Ok(());
            };
            let mut state = self.inner.lock_state();
            state.process_user_callback(batch_id, Ok(()));
            state.emit_new_snaps_and_notify_local_store(&mut local_store, &changes, None, &mut effects)?;
        }
        self.inner.flush(effects).await
    }

    pub async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        log::error!("write batch {batch_id} rejected: {error}");
        let mut effects = Effects::default();
        {
            let mut local_store = self.inner.local_store.lock().await;
            let Some(changes) = ignore_failed_precondition(local_store.reject_batch(batch_id))? else {
                return Ok(());
            };
            let mut state = self.inner.lock_state();
            state.process_user_callback(batch_id, Err(error));
            state.emit_new_snaps_and_notify_local_store(&mut local_store, &changes, None, &mut effects)?;
        }
        self.inner.flush(effects).await
    }

    pub fn apply_online_state_change(&self, online_state: OnlineState) {
        let snapshots: Vec<ViewSnapshot> = {
            let mut state = self.inner.lock_state();
            state.online_state = online_state;
            state
                .query_views_by_query
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect()
        };
        let Some(listener) = self.inner.listener() else {
            return;
        };
        listener.on_online_state_change(online_state);
        if !snapshots.is_empty() {
            listener.on_watch_change(snapshots);
        }
    }

    /// Switches pending writes and overlays to `user` and recomputes every view.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        let mut effects = Effects::default();
        {
            let mut local_store = self.inner.local_store.lock().await;
            let mut state = self.inner.lock_state();
            if state.current_user == user {
                return Ok(());
            }
            log::debug!("user changed to {}", user.to_key());
            let result = local_store.handle_user_change(&user)?;
            state.current_user = user;
            state.emit_new_snaps_and_notify_local_store(
                &mut local_store,
                &result.affected_documents,
                None,
                &mut effects,
            )?;
        }
        self.inner.flush(effects).await
    }

    pub fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.inner.lock_state().remote_keys_for_target(target_id)
    }

    /// Limbo documents with an active listen, by key.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.inner.lock_state().active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a free resolution slot, oldest first.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.inner
            .lock_state()
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    /// Stops the remote store and fails every write still waiting for the backend.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        self.inner.remote_store.shutdown().await?;
        let (callbacks, pending_unlistens) = {
            let mut state = self.inner.lock_state();
            (
                std::mem::take(&mut state.mutation_user_callbacks),
                std::mem::take(&mut state.pending_unlistens),
            )
        };
        for operation in pending_unlistens.into_values() {
            operation.cancel();
        }
        for callback in callbacks.into_values().flat_map(BTreeMap::into_values) {
            let _ = callback.send(Err(cancelled("the client has been terminated")));
        }
        Ok(())
    }
}

/// Routes remote store callbacks to the sync engine without keeping it alive.
struct SyncEngineRemoteSyncer {
    engine: Weak<SyncEngineInner>,
}

impl SyncEngineRemoteSyncer {
    fn engine(&self) -> FirestoreResult<SyncEngine> {
        self.engine
            .upgrade()
            .map(|inner| SyncEngine { inner })
            .ok_or_else(|| cancelled("the sync engine has been dropped"))
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl RemoteSyncer for SyncEngineRemoteSyncer {
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
        self.engine()?.apply_remote_event(event).await
    }

    async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        self.engine()?.reject_listen(target_id, error).await
    }

    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        self.engine()?.apply_successful_write(result).await
    }

    async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        self.engine()?.reject_failed_write(batch_id, error).await
    }

    async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
        self.engine()?.apply_online_state_change(online_state);
        Ok(())
    }

    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.engine()?.handle_credential_change(user).await
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.engine
            .upgrade()
            .map(|inner| inner.lock_state().remote_keys_for_target(target_id))
            .unwrap_or_default()
    }
}
