use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use async_lock::Mutex;
use async_trait::async_trait;
use bytes::Bytes;

use crate::firestore::core::{AsyncQueue, OnlineState, TargetId, TimerId, User};
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{LocalStore, TargetData};
use crate::firestore::model::{DatabaseId, DocumentKeySet, MutationBatch, MutationBatchResult, SnapshotVersion};
use crate::firestore::remote::connection::{Connection, ListenRequest, WriteRequest, WriteResponse};
use crate::firestore::remote::credentials::CredentialsProvider;
use crate::firestore::remote::online_state_tracker::{OnlineStateTracker, ONLINE_STATE_TIMEOUT};
use crate::firestore::remote::persistent_stream::{PersistentStreamListener, WatchStream, WriteStream};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::util::backoff::BackoffConfig;

/// Maximum number of batches sent to the backend without an acknowledgement.
pub const MAX_PENDING_WRITES: usize = 10;

/// Reasons the network is off. The streams only run while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    Shutdown,
}

struct RemoteStoreState {
    /// Targets the client wants to listen to, whether or not they were sent yet.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the watch stream is started.
    watch_aggregator: Option<WatchChangeAggregator>,
    /// Batches sent (or about to be sent) and not yet acknowledged, oldest first.
    write_pipeline: VecDeque<MutationBatch>,
    write_handshake_complete: bool,
    last_stream_token: Bytes,
    offline_causes: BTreeSet<OfflineCause>,
    online_state_tracker: OnlineStateTracker,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }
}

/// Target metadata as seen by the watch aggregator.
struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the watch and write streams and keeps them in sync with local state.
///
/// Remote events, acknowledgements and online state changes are reported to the
/// [`RemoteSyncer`]. Every method is expected to run on the client's async queue.
#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<Mutex<LocalStore>>,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        queue: AsyncQueue,
        database_id: DatabaseId,
        backoff: BackoffConfig,
        syncer: Arc<dyn RemoteSyncer>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| RemoteStoreInner {
            watch_stream: WatchStream::new(
                queue.clone(),
                Arc::clone(&connection),
                Arc::clone(&credentials),
                backoff,
                Arc::new(WatchStreamListener { store: weak.clone() }),
            ),
            write_stream: WriteStream::new(
                queue.clone(),
                connection,
                credentials,
                backoff,
                Arc::new(WriteStreamListener { store: weak.clone() }),
            ),
            local_store,
            syncer,
            queue,
            database_id,
            state: Mutex::new(RemoteStoreState {
                listen_targets: BTreeMap::new(),
                watch_aggregator: None,
                write_pipeline: VecDeque::new(),
                write_handshake_complete: false,
                last_stream_token: Bytes::new(),
                offline_causes: BTreeSet::new(),
                online_state_tracker: OnlineStateTracker::new(),
            }),
        });
        Self { inner }
    }

    /// Starts the streams the current state needs.
    pub async fn start(&self) -> FirestoreResult<()> {
        self.enable_network().await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await
    }

    /// Stops both streams and reports `Offline` until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await;
        let changed = self
            .inner
            .state
            .lock()
            .await
            .online_state_tracker
            .set(OnlineState::Offline);
        self.inner.broadcast_online_state(changed).await
    }

    pub async fn shutdown(&self) -> FirestoreResult<()> {
        log::debug!("remote store shutting down");
        self.inner
            .state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await;
        let changed = self
            .inner
            .state
            .lock()
            .await
            .online_state_tracker
            .set(OnlineState::Unknown);
        self.inner.broadcast_online_state(changed).await
    }

    /// Starts watching `target_data`. Listening to a target twice is a no-op.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.inner.listen(target_data).await
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.inner.unlisten(target_id).await
    }

    /// Moves pending batches from the mutation queue into the write pipeline.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        self.inner.fill_write_pipeline().await
    }

    /// Restarts the streams for `user` after the syncer switched its local state.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.inner.handle_credential_change(user).await
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.state.lock().await.online_state_tracker.state()
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.can_use_network()
    }

    /// Number of batches sent or queued for sending.
    pub async fn pending_write_count(&self) -> usize {
        self.inner.state.lock().await.write_pipeline.len()
    }
}

struct RemoteStoreInner {
    local_store: Arc<Mutex<LocalStore>>,
    syncer: Arc<dyn RemoteSyncer>,
    queue: AsyncQueue,
    database_id: DatabaseId,
    watch_stream: WatchStream,
    write_stream: WriteStream,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStoreInner {
    async fn broadcast_online_state(&self, changed: Option<OnlineState>) -> FirestoreResult<()> {
        match changed {
            Some(online_state) => self.syncer.apply_online_state_change(online_state).await,
            None => Ok(()),
        }
    }

    async fn enable_network_internal(self: &Arc<Self>) -> FirestoreResult<()> {
        if !self.state.lock().await.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream().await {
            self.start_watch_stream().await?;
        } else {
            let changed = self
                .state
                .lock()
                .await
                .online_state_tracker
                .set(OnlineState::Unknown);
            self.broadcast_online_state(changed).await?;
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop().await;
        self.watch_stream.stop().await;

        let mut state = self.state.lock().await;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.write_handshake_complete = false;
        state.watch_aggregator = None;
    }

    async fn handle_credential_change(self: &Arc<Self>, user: User) -> FirestoreResult<()> {
        log::debug!("remote store restarting streams for new credentials");
        self.state
            .lock()
            .await
            .offline_causes
            .insert(OfflineCause::CredentialChange);
        self.disable_network_internal().await;
        let changed = self
            .state
            .lock()
            .await
            .online_state_tracker
            .set(OnlineState::Unknown);
        self.broadcast_online_state(changed).await?;

        self.syncer.handle_credential_change(user).await?;

        self.state
            .lock()
            .await
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        self.enable_network_internal().await
    }

    async fn listen(self: &Arc<Self>, target_data: TargetData) -> FirestoreResult<()> {
        {
            let mut state = self.state.lock().await;
            if state.listen_targets.contains_key(&target_data.target_id) {
                return Ok(());
            }
            state
                .listen_targets
                .insert(target_data.target_id, target_data.clone());
        }

        if self.should_start_watch_stream().await {
            self.start_watch_stream().await
        } else if self.watch_stream.is_open().await {
            self.send_watch_request(target_data).await
        } else {
            Ok(())
        }
    }

    async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let (removed, now_empty, can_use_network) = {
            let mut state = self.state.lock().await;
            let removed = state.listen_targets.remove(&target_id).is_some();
            (removed, state.listen_targets.is_empty(), state.can_use_network())
        };
        debug_assert!(removed, "unlistening from target {target_id} that was never listened to");

        let open = self.watch_stream.is_open().await;
        if open {
            self.send_unwatch_request(target_id).await?;
        }
        if now_empty {
            if open {
                self.watch_stream.mark_idle().await;
            } else if can_use_network {
                // Nothing to listen to means there is no health signal either.
                let changed = self
                    .state
                    .lock()
                    .await
                    .online_state_tracker
                    .set(OnlineState::Unknown);
                self.broadcast_online_state(changed).await?;
            }
        }
        Ok(())
    }

    async fn send_watch_request(&self, target_data: TargetData) -> FirestoreResult<()> {
        let request = {
            let mut state = self.state.lock().await;
            if let Some(aggregator) = state.watch_aggregator.as_mut() {
                aggregator.record_pending_target_request(target_data.target_id);
            }
            if !target_data.resume_token.is_empty() || target_data.snapshot_version > SnapshotVersion::min() {
                let expected_count = self
                    .syncer
                    .get_remote_keys_for_target(target_data.target_id)
                    .len();
                target_data.with_expected_count(i32::try_from(expected_count).unwrap_or(i32::MAX))
            } else {
                target_data
            }
        };
        self.watch_stream
            .send(ListenRequest::AddTarget(request))
            .await
    }

    async fn send_unwatch_request(&self, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(aggregator) = self.state.lock().await.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream
            .send(ListenRequest::RemoveTarget(target_id))
            .await
    }

    async fn should_start_watch_stream(&self) -> bool {
        let wanted = {
            let state = self.state.lock().await;
            state.can_use_network() && !state.listen_targets.is_empty()
        };
        wanted && !self.watch_stream.is_started().await
    }

    async fn start_watch_stream(self: &Arc<Self>) -> FirestoreResult<()> {
        self.state.lock().await.watch_aggregator = Some(WatchChangeAggregator::new(self.database_id.clone()));
        self.watch_stream.start().await?;

        let changed = {
            let mut state = self.state.lock().await;
            let queue = self.queue.clone();
            let store = Arc::downgrade(self);
            state.online_state_tracker.handle_watch_stream_start(move || {
                queue.enqueue_after_delay(TimerId::OnlineStateTimeout, ONLINE_STATE_TIMEOUT, async move {
                    match store.upgrade() {
                        Some(store) => store.on_online_state_timeout().await,
                        None => Ok(()),
                    }
                })
            })
        };
        self.broadcast_online_state(changed).await
    }

    async fn on_online_state_timeout(&self) -> FirestoreResult<()> {
        let changed = self
            .state
            .lock()
            .await
            .online_state_tracker
            .handle_timeout_expired();
        self.broadcast_online_state(changed).await
    }

    async fn on_watch_open(&self) -> FirestoreResult<()> {
        let targets: Vec<TargetData> = self
            .state
            .lock()
            .await
            .listen_targets
            .values()
            .cloned()
            .collect();
        for target_data in targets {
            self.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    async fn on_watch_close(self: &Arc<Self>, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.state.lock().await.watch_aggregator = None;

        if self.should_start_watch_stream().await {
            let changed = self
                .state
                .lock()
                .await
                .online_state_tracker
                .handle_watch_stream_failure(error.as_ref());
            self.broadcast_online_state(changed).await?;
            self.start_watch_stream().await
        } else {
            let changed = self
                .state
                .lock()
                .await
                .online_state_tracker
                .set(OnlineState::Unknown);
            self.broadcast_online_state(changed).await
        }
    }

    async fn on_watch_change(&self, change: WatchChange) -> FirestoreResult<()> {
        let changed = self
            .state
            .lock()
            .await
            .online_state_tracker
            .set(OnlineState::Online);
        self.broadcast_online_state(changed).await?;

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed && target_change.cause.is_some() {
                return self.handle_target_error(target_change).await;
            }
        }

        let snapshot_version = change.snapshot_version();
        {
            let mut guard = self.state.lock().await;
            let RemoteStoreState {
                listen_targets,
                watch_aggregator,
                ..
            } = &mut *guard;
            let Some(aggregator) = watch_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenTargetMetadata {
                listen_targets: &*listen_targets,
                syncer: self.syncer.as_ref(),
            };
            match change {
                WatchChange::DocumentChange(document_change) => {
                    aggregator.handle_document_change(document_change, &metadata)
                }
                WatchChange::TargetChange(target_change) => aggregator.handle_target_change(&target_change, &metadata),
                WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&filter, &metadata),
            }
        }

        if snapshot_version.is_min() {
            return Ok(());
        }
        let last_remote_version = self.local_store.lock().await.get_last_remote_snapshot_version()?;
        if snapshot_version >= last_remote_version {
            // Older global snapshots can arrive after a restart and are already applied.
            self.raise_watch_snapshot(snapshot_version).await?;
        }
        Ok(())
    }

    async fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(cause) = change.cause.clone() else {
            return Ok(());
        };
        let rejected: Vec<TargetId> = {
            let mut state = self.state.lock().await;
            let mut rejected = Vec::new();
            for target_id in &change.target_ids {
                if state.listen_targets.remove(target_id).is_some() {
                    if let Some(aggregator) = state.watch_aggregator.as_mut() {
                        aggregator.remove_target(*target_id);
                    }
                    rejected.push(*target_id);
                }
            }
            rejected
        };
        for target_id in rejected {
            log::warn!("listen to target {target_id} was rejected: {cause}");
            self.syncer.reject_listen(target_id, cause.clone()).await?;
        }
        Ok(())
    }

    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let (event, requeries) = {
            let mut guard = self.state.lock().await;
            let RemoteStoreState {
                listen_targets,
                watch_aggregator,
                ..
            } = &mut *guard;
            let Some(aggregator) = watch_aggregator.as_mut() else {
                return Ok(());
            };
            let event = aggregator.create_remote_event(
                snapshot_version,
                &ListenTargetMetadata {
                    listen_targets: &*listen_targets,
                    syncer: self.syncer.as_ref(),
                },
            );

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = listen_targets.get_mut(target_id) {
                    *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            let mut requeries = Vec::new();
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = listen_targets.get_mut(target_id) else {
                    continue;
                };
                // Resume from scratch so the server sends the full result set.
                *target_data = target_data.with_resume_token(Bytes::new(), target_data.snapshot_version);
                requeries.push(TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                ));
            }
            (event, requeries)
        };

        for target_data in requeries {
            log::debug!("re-listening to target {} after an existence filter mismatch", target_data.target_id);
            self.send_unwatch_request(target_data.target_id).await?;
            self.send_watch_request(target_data).await?;
        }

        self.syncer.apply_remote_event(event).await
    }

    async fn fill_write_pipeline(self: &Arc<Self>) -> FirestoreResult<()> {
        loop {
            let last_batch_id = {
                let state = self.state.lock().await;
                if !state.can_add_to_write_pipeline() {
                    break;
                }
                state.write_pipeline.back().map(|batch| batch.batch_id)
            };

            let batch = self.local_store.lock().await.next_mutation_batch(last_batch_id)?;
            match batch {
                Some(batch) => self.add_to_write_pipeline(batch).await?,
                None => {
                    if self.state.lock().await.write_pipeline.is_empty() {
                        self.write_stream.mark_idle().await;
                    }
                    break;
                }
            }
        }

        if self.should_start_write_stream().await {
            self.start_write_stream().await?;
        }
        Ok(())
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        let request = {
            let mut state = self.state.lock().await;
            let request = state.write_handshake_complete.then(|| WriteRequest {
                stream_token: state.last_stream_token.clone(),
                mutations: batch.mutations.clone(),
            });
            state.write_pipeline.push_back(batch);
            request
        };
        match request {
            Some(request) if self.write_stream.is_open().await => self.write_stream.send(request).await,
            _ => Ok(()),
        }
    }

    async fn should_start_write_stream(&self) -> bool {
        let wanted = {
            let state = self.state.lock().await;
            state.can_use_network() && !state.write_pipeline.is_empty()
        };
        wanted && !self.write_stream.is_started().await
    }

    async fn start_write_stream(&self) -> FirestoreResult<()> {
        self.state.lock().await.write_handshake_complete = false;
        self.write_stream.start().await
    }

    async fn on_write_open(&self) -> FirestoreResult<()> {
        let stream_token = self.local_store.lock().await.last_stream_token()?;
        self.state.lock().await.last_stream_token = stream_token.clone();
        self.write_stream
            .send(WriteRequest::handshake(stream_token))
            .await
    }

    async fn on_write_response(self: &Arc<Self>, response: WriteResponse) -> FirestoreResult<()> {
        let handshake_complete = self.state.lock().await.write_handshake_complete;
        if !handshake_complete {
            return self.on_write_handshake_complete(response.stream_token).await;
        }

        let batch = {
            let mut state = self.state.lock().await;
            state.last_stream_token = response.stream_token.clone();
            state.write_pipeline.pop_front()
        };
        let batch = batch.ok_or_else(|| internal_error("received a write acknowledgement with no pending batch"))?;
        if batch.mutations.len() != response.mutation_results.len() {
            return Err(internal_error(format!(
                "batch {} sent {} mutations but received {} results",
                batch.batch_id,
                batch.mutations.len(),
                response.mutation_results.len()
            )));
        }
        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            response.mutation_results,
            response.stream_token,
        );
        self.syncer.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_handshake_complete(&self, stream_token: Bytes) -> FirestoreResult<()> {
        self.local_store
            .lock()
            .await
            .set_last_stream_token(stream_token.clone())?;

        let requests: Vec<WriteRequest> = {
            let mut state = self.state.lock().await;
            state.write_handshake_complete = true;
            state.last_stream_token = stream_token.clone();
            state
                .write_pipeline
                .iter()
                .map(|batch| WriteRequest {
                    stream_token: stream_token.clone(),
                    mutations: batch.mutations.clone(),
                })
                .collect()
        };
        for request in requests {
            self.write_stream.send(request).await?;
        }
        Ok(())
    }

    async fn on_write_close(self: &Arc<Self>, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if let Some(error) = error {
            let handshake_complete = self.state.lock().await.write_handshake_complete;
            if handshake_complete {
                self.handle_write_error(error).await?;
            } else if error.code.is_permanent() {
                log::debug!("write stream handshake failed permanently ({error}); resetting stream token");
                self.state.lock().await.last_stream_token = Bytes::new();
                self.local_store
                    .lock()
                    .await
                    .set_last_stream_token(Bytes::new())?;
            }
        }

        if self.should_start_write_stream().await {
            self.start_write_stream().await?;
        }
        Ok(())
    }

    async fn handle_write_error(self: &Arc<Self>, error: FirestoreError) -> FirestoreResult<()> {
        if !error.code.is_permanent_write_error() {
            return Ok(());
        }
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return Ok(());
        };
        log::warn!("write batch {} was rejected: {error}", batch.batch_id);
        // Retrying a rejected batch would fail the same way.
        self.write_stream.inhibit_backoff().await;
        self.syncer.reject_failed_write(batch.batch_id, error).await?;
        self.fill_write_pipeline().await
    }
}

struct WatchStreamListener {
    store: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamListener<WatchChange> for WatchStreamListener {
    async fn on_open(&self) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_watch_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: WatchChange) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_watch_change(message).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_watch_close(error).await,
            None => Ok(()),
        }
    }
}

struct WriteStreamListener {
    store: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl PersistentStreamListener<WriteResponse> for WriteStreamListener {
    async fn on_open(&self) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_write_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: WriteResponse) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_write_response(message).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.store.upgrade() {
            Some(store) => store.on_write_close(error).await,
            None => Ok(()),
        }
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::core::Query;
    use crate::firestore::error::{invalid_argument, permission_denied, unavailable, FirestoreErrorCode};
    use crate::firestore::local::{MemoryPersistence, QueryEngineSettings, TargetPurpose};
    use crate::firestore::model::{BatchId, DocumentKey, Mutation, MutationResult, MutableDocument};
    use crate::firestore::remote::connection::InMemoryConnection;
    use crate::firestore::remote::credentials::EmptyCredentialsProvider;
    use crate::firestore::remote::remote_event::RemoteEvent;
    use crate::firestore::remote::watch_change::{DocumentWatchChange, ExistenceFilterChange};
    use crate::firestore::value::MapValue;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSyncer {
        remote_events: StdMutex<Vec<RemoteEvent>>,
        rejected_listens: StdMutex<Vec<(TargetId, FirestoreErrorCode)>>,
        acknowledged: StdMutex<Vec<BatchId>>,
        rejected_writes: StdMutex<Vec<(BatchId, FirestoreErrorCode)>>,
        online_states: StdMutex<Vec<OnlineState>>,
        local_store: StdMutex<Option<Arc<Mutex<LocalStore>>>>,
    }

    impl RecordingSyncer {
        fn local_store(&self) -> Arc<Mutex<LocalStore>> {
            self.local_store.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl RemoteSyncer for RecordingSyncer {
        async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()> {
            self.remote_events.lock().unwrap().push(event);
            Ok(())
        }

        async fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
            self.rejected_listens.lock().unwrap().push((target_id, error.code));
            Ok(())
        }

        async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
            self.acknowledged.lock().unwrap().push(result.batch.batch_id);
            self.local_store().lock().await.acknowledge_batch(&result)?;
            Ok(())
        }

        async fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
            self.rejected_writes.lock().unwrap().push((batch_id, error.code));
            self.local_store().lock().await.reject_batch(batch_id)?;
            Ok(())
        }

        async fn apply_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
            self.online_states.lock().unwrap().push(online_state);
            Ok(())
        }

        async fn handle_credential_change(&self, _user: User) -> FirestoreResult<()> {
            Ok(())
        }

        fn get_remote_keys_for_target(&self, _target_id: TargetId) -> DocumentKeySet {
            DocumentKeySet::new()
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        connection: InMemoryConnection,
        local_store: Arc<Mutex<LocalStore>>,
        syncer: Arc<RecordingSyncer>,
        remote_store: RemoteStore,
    }

    fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let connection = InMemoryConnection::new();
        let local_store = Arc::new(Mutex::new(LocalStore::new(
            Arc::new(MemoryPersistence::new()),
            QueryEngineSettings::default(),
            &User::unauthenticated(),
        )));
        let syncer = Arc::new(RecordingSyncer::default());
        *syncer.local_store.lock().unwrap() = Some(Arc::clone(&local_store));
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            Arc::new(connection.clone()),
            Arc::new(EmptyCredentialsProvider),
            queue.clone(),
            DatabaseId::for_project("test-project"),
            BackoffConfig::default(),
            syncer.clone(),
        );
        Fixture {
            queue,
            connection,
            local_store,
            syncer,
            remote_store,
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    async fn allocate(fx: &Fixture, path: &str) -> TargetData {
        let target = Query::collection(path).unwrap().to_target();
        fx.local_store.lock().await.allocate_target(target).unwrap()
    }

    async fn write(fx: &Fixture, path: &str) -> BatchId {
        fx.local_store
            .lock()
            .await
            .local_write(vec![Mutation::set(key(path), MapValue::empty())])
            .unwrap()
            .batch_id
    }

    #[tokio::test]
    async fn listen_opens_the_watch_stream_and_sends_targets() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        assert_eq!(fx.connection.listen_open_count(), 0);

        let target_data = allocate(&fx, "rooms").await;
        fx.remote_store.listen(target_data.clone()).await.unwrap();
        fx.queue.drain().await.unwrap();

        assert!(fx.connection.is_listen_stream_open());
        assert!(fx.connection.watched_targets().contains_key(&target_data.target_id));
    }

    #[tokio::test]
    async fn global_snapshot_raises_a_remote_event() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        let target_data = allocate(&fx, "rooms").await;
        let target_id = target_data.target_id;
        fx.remote_store.listen(target_data).await.unwrap();
        fx.queue.drain().await.unwrap();

        let document = MutableDocument::new_found_document(key("rooms/a"), version(10), MapValue::empty());
        fx.connection
            .push_watch_change(WatchChange::TargetChange(WatchTargetChange::new(
                WatchTargetChangeState::Added,
                vec![target_id],
            )))
            .unwrap();
        fx.connection
            .push_watch_change(WatchChange::DocumentChange(DocumentWatchChange::update(document, vec![target_id])))
            .unwrap();
        fx.connection
            .push_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(WatchTargetChangeState::Current, vec![target_id])
                    .with_resume_token(Bytes::from_static(b"resume")),
            ))
            .unwrap();
        fx.connection
            .push_watch_change(WatchChange::TargetChange(WatchTargetChange::global_snapshot(
                Bytes::new(),
                version(10),
            )))
            .unwrap();
        fx.queue.drain().await.unwrap();

        let events = fx.syncer.remote_events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let change = &events[0].target_changes[&target_id];
        assert!(change.current);
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert_eq!(fx.syncer.online_states.lock().unwrap().last(), Some(&OnlineState::Online));
    }

    #[tokio::test]
    async fn rejected_listen_is_reported() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        let target_data = allocate(&fx, "secret").await;
        let target_id = target_data.target_id;
        fx.remote_store.listen(target_data).await.unwrap();
        fx.queue.drain().await.unwrap();

        fx.connection
            .push_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(WatchTargetChangeState::Removed, vec![target_id])
                    .with_cause(permission_denied("no access")),
            ))
            .unwrap();
        fx.queue.drain().await.unwrap();

        assert_eq!(
            *fx.syncer.rejected_listens.lock().unwrap(),
            vec![(target_id, FirestoreErrorCode::PermissionDenied)]
        );
    }

    #[tokio::test]
    async fn watch_failure_reports_offline_and_reconnects() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        fx.remote_store.listen(allocate(&fx, "rooms").await).await.unwrap();
        fx.queue.drain().await.unwrap();

        fx.connection.set_reachable(false);
        fx.queue.drain().await.unwrap();
        assert_eq!(fx.remote_store.online_state().await, OnlineState::Offline);

        fx.connection.set_reachable(true);
        fx.queue.run_delayed_operations_early(TimerId::ListenStreamConnectionBackoff).await.unwrap();
        fx.queue.drain().await.unwrap();
        assert!(fx.connection.is_listen_stream_open());
        assert!(fx.connection.listen_open_count() >= 2);
    }

    #[tokio::test]
    async fn existence_filter_mismatch_re_listens_without_resume_token() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        let target_data = allocate(&fx, "rooms").await;
        let target_id = target_data.target_id;
        fx.remote_store.listen(target_data).await.unwrap();
        fx.queue.drain().await.unwrap();

        fx.connection
            .push_watch_change(WatchChange::TargetChange(WatchTargetChange::new(
                WatchTargetChangeState::Added,
                vec![target_id],
            )))
            .unwrap();
        fx.connection
            .push_watch_change(WatchChange::TargetChange(
                WatchTargetChange::new(WatchTargetChangeState::Current, vec![target_id])
                    .with_resume_token(Bytes::from_static(b"resume")),
            ))
            .unwrap();
        fx.connection
            .push_watch_change(WatchChange::ExistenceFilter(ExistenceFilterChange::new(target_id, 3)))
            .unwrap();
        fx.connection
            .push_watch_change(WatchChange::TargetChange(WatchTargetChange::global_snapshot(
                Bytes::new(),
                version(20),
            )))
            .unwrap();
        fx.queue.drain().await.unwrap();

        let events = fx.syncer.remote_events.lock().unwrap();
        assert_eq!(
            events.last().unwrap().target_mismatches.get(&target_id),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        let requested = &fx.connection.watched_targets()[&target_id];
        assert!(requested.resume_token.is_empty());
        assert_eq!(requested.purpose, TargetPurpose::ExistenceFilterMismatch);
    }

    #[tokio::test]
    async fn writes_are_sent_after_the_handshake_and_acknowledged() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        let batch_id = write(&fx, "rooms/a").await;
        fx.remote_store.fill_write_pipeline().await.unwrap();
        fx.queue.drain().await.unwrap();

        let handshake = fx.connection.take_write_requests();
        assert_eq!(handshake.len(), 1);
        assert!(handshake[0].is_handshake());

        fx.connection
            .push_write_response(WriteResponse::handshake(Bytes::from_static(b"stream-1")))
            .unwrap();
        fx.queue.drain().await.unwrap();
        let sent = fx.connection.take_write_requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].mutations.len(), 1);

        fx.connection
            .push_write_response(WriteResponse {
                stream_token: Bytes::from_static(b"stream-2"),
                commit_version: version(5),
                mutation_results: vec![MutationResult::new(version(5))],
            })
            .unwrap();
        fx.queue.drain().await.unwrap();

        assert_eq!(*fx.syncer.acknowledged.lock().unwrap(), vec![batch_id]);
        assert_eq!(fx.remote_store.pending_write_count().await, 0);
        assert_eq!(
            fx.local_store.lock().await.last_stream_token().unwrap(),
            Bytes::from_static(b"stream-2")
        );
    }

    #[tokio::test]
    async fn pipeline_holds_at_most_ten_batches() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        for index in 0..12 {
            write(&fx, &format!("rooms/{index}")).await;
        }
        fx.remote_store.fill_write_pipeline().await.unwrap();
        assert_eq!(fx.remote_store.pending_write_count().await, MAX_PENDING_WRITES);
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_the_batch() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        let batch_id = write(&fx, "rooms/a").await;
        fx.remote_store.fill_write_pipeline().await.unwrap();
        fx.queue.drain().await.unwrap();
        fx.connection
            .push_write_response(WriteResponse::handshake(Bytes::from_static(b"stream-1")))
            .unwrap();
        fx.queue.drain().await.unwrap();

        fx.connection.fail_write_stream(invalid_argument("bad field"));
        fx.queue.drain().await.unwrap();

        assert_eq!(
            *fx.syncer.rejected_writes.lock().unwrap(),
            vec![(batch_id, FirestoreErrorCode::InvalidArgument)]
        );
        assert_eq!(fx.remote_store.pending_write_count().await, 0);
    }

    #[tokio::test]
    async fn transient_write_error_keeps_the_batch() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        write(&fx, "rooms/a").await;
        fx.remote_store.fill_write_pipeline().await.unwrap();
        fx.queue.drain().await.unwrap();
        fx.connection
            .push_write_response(WriteResponse::handshake(Bytes::from_static(b"stream-1")))
            .unwrap();
        fx.queue.drain().await.unwrap();

        fx.connection.fail_write_stream(unavailable("dropped"));
        fx.queue.drain().await.unwrap();

        assert!(fx.syncer.rejected_writes.lock().unwrap().is_empty());
        assert_eq!(fx.remote_store.pending_write_count().await, 1);
    }

    #[tokio::test]
    async fn disabling_the_network_goes_offline_and_clears_the_pipeline() {
        let fx = fixture();
        fx.remote_store.start().await.unwrap();
        write(&fx, "rooms/a").await;
        fx.remote_store.fill_write_pipeline().await.unwrap();
        fx.queue.drain().await.unwrap();

        fx.remote_store.disable_network().await.unwrap();
        assert_eq!(fx.remote_store.online_state().await, OnlineState::Offline);
        assert_eq!(fx.remote_store.pending_write_count().await, 0);
        assert!(!fx.connection.is_write_stream_open());

        fx.remote_store.enable_network().await.unwrap();
        assert_eq!(fx.remote_store.pending_write_count().await, 1);
    }
}
