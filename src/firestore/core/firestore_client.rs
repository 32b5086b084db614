use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;

use crate::firestore::core::event_manager::{EventManager, ListenOptions, QueryListener, ViewSnapshotObserver};
use crate::firestore::core::settings::FirestoreSettings;
use crate::firestore::core::sync_engine::SyncEngine;
use crate::firestore::core::view::View;
use crate::firestore::core::{AsyncQueue, OnlineState, Query, User, ViewSnapshot};
use crate::firestore::error::{cancelled, FirestoreResult};
use crate::firestore::local::{LocalStore, LruGarbageCollector, LruScheduler, MemoryPersistence};
use crate::firestore::model::{DocumentKey, FieldIndex, MutableDocument, Mutation};
use crate::firestore::remote::{Connection, CredentialsProvider};

/// The client entry point: wires the local store, the sync engine and the event manager
/// together on one async queue.
///
/// Every call is forwarded to the queue, so the client can be shared between tasks.
pub struct FirestoreClient {
    settings: FirestoreSettings,
    queue: AsyncQueue,
    credentials: Arc<dyn CredentialsProvider>,
    local_store: Arc<Mutex<LocalStore>>,
    sync_engine: SyncEngine,
    event_manager: Arc<EventManager>,
    lru_scheduler: LruScheduler,
}

impl Debug for FirestoreClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirestoreClient")
            .field("database_id", &self.settings.database_id)
            .field("terminated", &self.queue.is_restricted())
            .finish()
    }
}

impl FirestoreClient {
    /// Builds the client with in-memory persistence and starts the network.
    pub async fn new(
        settings: FirestoreSettings,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> FirestoreResult<Self> {
        settings.validate()?;
        let initial_user = credentials
            .get_token()
            .await?
            .map(|token| token.user)
            .unwrap_or_else(User::unauthenticated);
        log::debug!(
            "starting client for {} as {}",
            settings.database_id,
            initial_user.to_key()
        );

        let queue = AsyncQueue::new();
        let local_store = Arc::new(Mutex::new(LocalStore::new(
            Arc::new(MemoryPersistence::new()),
            settings.query_engine.clone(),
            &initial_user,
        )));
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            connection,
            Arc::clone(&credentials),
            queue.clone(),
            settings.database_id.clone(),
            settings.backoff,
            settings.sync_engine,
            initial_user.clone(),
        );
        let event_manager = EventManager::new(sync_engine.clone());

        let garbage_collector = {
            let local_store = local_store.lock().await;
            LruGarbageCollector::new(settings.lru, local_store.lru_delegate())
        };
        let lru_scheduler = LruScheduler::new(queue.clone(), Arc::clone(&local_store), garbage_collector);

        let last_user = StdMutex::new(initial_user);
        let change_queue = queue.clone();
        let remote_store = sync_engine.remote_store().clone();
        credentials.set_change_listener(Arc::new(move |user: User| {
            {
                let mut last_user = last_user.lock().unwrap_or_else(|poison| poison.into_inner());
                if *last_user == user {
                    return;
                }
                *last_user = user.clone();
            }
            log::debug!("credential change to {}", user.to_key());
            let remote_store = remote_store.clone();
            change_queue.enqueue_and_forget(async move { remote_store.handle_credential_change(user).await });
        }));

        let remote_store = sync_engine.remote_store().clone();
        queue.enqueue(async move { remote_store.start().await }).await?;
        lru_scheduler.start();

        Ok(Self {
            settings,
            queue,
            credentials,
            local_store,
            sync_engine,
            event_manager,
            lru_scheduler,
        })
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.settings
    }

    /// The queue every operation runs on. Tests use it to drain work and fire timers.
    pub fn async_queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn online_state(&self) -> OnlineState {
        self.sync_engine.online_state()
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_restricted()
    }

    /// Attaches `observer` to `query`. Snapshots are delivered on the async queue until the
    /// registration is removed or dropped, or a terminal error arrives.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: Arc<dyn ViewSnapshotObserver>,
    ) -> FirestoreResult<ListenerRegistration> {
        let listener = Arc::new(QueryListener::new(query, options, observer));
        let event_manager = Arc::clone(&self.event_manager);
        let registered = Arc::clone(&listener);
        self.queue
            .enqueue(async move { event_manager.listen(registered).await })
            .await?;
        Ok(ListenerRegistration {
            queue: self.queue.clone(),
            event_manager: Arc::downgrade(&self.event_manager),
            listener: Some(listener),
        })
    }

    /// Applies `mutations` locally and resolves once the backend accepts them.
    ///
    /// Listeners see the write immediately; a rejection reverts it and is returned here.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let sync_engine = self.sync_engine.clone();
        let acknowledgement = self
            .queue
            .enqueue(async move { sync_engine.write(mutations).await })
            .await?;
        acknowledgement
            .await
            .map_err(|_| cancelled("the write was abandoned before the backend answered"))?
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(async move {
                let query_result = local_store.lock().await.execute_query(&query, true)?;
                let mut view = View::new(query, query_result.remote_keys);
                let doc_changes = view.compute_doc_changes(&query_result.documents, None);
                let view_change = view.apply_changes(doc_changes, false, None, false);
                Ok(view_change
                    .snapshot
                    .unwrap_or_else(|| view.compute_initial_snapshot()))
            })
            .await
    }

    /// The local view of one document, including pending writes.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<MutableDocument> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(async move { local_store.lock().await.read_document(&key) })
            .await
    }

    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let local_store = Arc::clone(&self.local_store);
        self.queue
            .enqueue(async move { local_store.lock().await.configure_field_indexes(indexes) })
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let remote_store = self.sync_engine.remote_store().clone();
        self.queue
            .enqueue(async move { remote_store.enable_network().await })
            .await
    }

    /// Stops both streams; listeners fall back to the cache and writes queue up locally.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let remote_store = self.sync_engine.remote_store().clone();
        self.queue
            .enqueue(async move { remote_store.disable_network().await })
            .await
    }

    /// Shuts the client down for good. Pending writes and listeners fail with `Cancelled`
    /// and every later call is rejected.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.queue.is_restricted() {
            return Ok(());
        }
        log::debug!("terminating client for {}", self.settings.database_id);
        self.queue.enter_restricted_mode();
        self.lru_scheduler.stop();
        self.credentials.remove_change_listener();

        let sync_engine = self.sync_engine.clone();
        let event_manager = Arc::clone(&self.event_manager);
        self.queue
            .enqueue_even_while_restricted(async move {
                sync_engine.terminate().await?;
                event_manager.terminate();
                Ok(())
            })
            .await
    }
}

/// Keeps a query listener attached. Dropping it detaches the listener.
pub struct ListenerRegistration {
    queue: AsyncQueue,
    event_manager: Weak<EventManager>,
    listener: Option<Arc<QueryListener>>,
}

impl Debug for ListenerRegistration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("listener", &self.listener)
            .finish()
    }
}

impl ListenerRegistration {
    pub fn remove(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        listener.mute();
        let Some(event_manager) = self.event_manager.upgrade() else {
            return;
        };
        self.queue
            .enqueue_and_forget(async move { event_manager.unlisten(&listener).await });
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::model::{MutationResult, SnapshotVersion};
    use crate::firestore::remote::{EmptyCredentialsProvider, InMemoryConnection, StaticCredentialsProvider, WriteResponse};
    use crate::firestore::value::MapValue;
    use bytes::Bytes;

    async fn client(connection: &InMemoryConnection) -> FirestoreClient {
        FirestoreClient::new(FirestoreSettings::default(), Arc::new(connection.clone()), Arc::new(EmptyCredentialsProvider))
            .await
            .unwrap()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn rooms() -> Query {
        Query::collection("rooms").unwrap()
    }

    async fn acknowledge_next_write(client: &FirestoreClient, connection: &InMemoryConnection, version: i64) {
        client.async_queue().drain().await.unwrap();
        connection
            .push_write_response(WriteResponse::handshake(Bytes::from_static(b"stream")))
            .unwrap();
        client.async_queue().drain().await.unwrap();
        connection
            .push_write_response(WriteResponse {
                stream_token: Bytes::from_static(b"stream-2"),
                commit_version: SnapshotVersion::from_micros(version),
                mutation_results: vec![MutationResult::new(SnapshotVersion::from_micros(version))],
            })
            .unwrap();
        client.async_queue().drain().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_settings() {
        let mut settings = FirestoreSettings::default();
        settings.sync_engine.max_concurrent_limbo_resolutions = 0;
        let err = FirestoreClient::new(
            settings,
            Arc::new(InMemoryConnection::new()),
            Arc::new(EmptyCredentialsProvider),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn write_resolves_once_acknowledged() {
        let connection = InMemoryConnection::new();
        let client = client(&connection).await;

        let (written, _) = tokio::join!(
            client.write(vec![Mutation::set(key("rooms/a"), MapValue::empty())]),
            acknowledge_next_write(&client, &connection, 5),
        );
        written.unwrap();

        let document = client.get_document_from_local_cache(key("rooms/a")).await.unwrap();
        assert!(document.is_found_document());
        assert!(!document.has_local_mutations());
    }

    #[tokio::test]
    async fn listener_sees_local_writes_before_the_backend() {
        let connection = InMemoryConnection::new();
        connection.set_reachable(false);
        let client = client(&connection).await;
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let _registration = client
            .listen(
                rooms(),
                ListenOptions::default(),
                Arc::new(move |snapshot: &ViewSnapshot| {
                    recorder
                        .lock()
                        .unwrap()
                        .push(snapshot.docs.keys().cloned().collect::<Vec<_>>())
                }),
            )
            .await
            .unwrap();

        let sync_engine = client.sync_engine.clone();
        client
            .async_queue()
            .enqueue(async move {
                sync_engine
                    .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())])
                    .await
                    .map(|_| ())
            })
            .await
            .unwrap();
        client.async_queue().drain().await.unwrap();

        assert_eq!(seen.lock().unwrap().last(), Some(&vec![key("rooms/a")]));
        let snapshot = client.get_documents_from_local_cache(rooms()).await.unwrap();
        assert!(snapshot.has_pending_writes());
        assert!(snapshot.from_cache);
    }

    #[tokio::test]
    async fn removing_the_registration_stops_watching() {
        let connection = InMemoryConnection::new();
        let client = client(&connection).await;
        let registration = client
            .listen(rooms(), ListenOptions::default(), Arc::new(|_: &ViewSnapshot| {}))
            .await
            .unwrap();
        client.async_queue().drain().await.unwrap();
        assert_eq!(connection.watched_targets().len(), 1);

        registration.remove();
        client.async_queue().drain().await.unwrap();
        assert!(connection.watched_targets().is_empty());
    }

    #[tokio::test]
    async fn terminate_cancels_pending_writes_and_later_calls() {
        let connection = InMemoryConnection::new();
        let client = client(&connection).await;

        let (written, terminated) = tokio::join!(
            client.write(vec![Mutation::set(key("rooms/a"), MapValue::empty())]),
            async {
                client.async_queue().drain().await.unwrap();
                client.terminate().await
            },
        );
        terminated.unwrap();
        assert_eq!(written.unwrap_err().code, FirestoreErrorCode::Cancelled);
        assert!(client.is_terminated());

        let err = client
            .listen(rooms(), ListenOptions::default(), Arc::new(|_: &ViewSnapshot| {}))
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
        client.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn switching_users_hides_the_previous_users_pending_writes() {
        let connection = InMemoryConnection::new();
        connection.set_reachable(false);
        let credentials = Arc::new(StaticCredentialsProvider::new(User::new("alice"), "alice-token"));
        let client = FirestoreClient::new(FirestoreSettings::default(), Arc::new(connection.clone()), credentials.clone())
            .await
            .unwrap();

        let sync_engine = client.sync_engine.clone();
        client
            .async_queue()
            .enqueue(async move {
                sync_engine
                    .write(vec![Mutation::set(key("rooms/a"), MapValue::empty())])
                    .await
                    .map(|_| ())
            })
            .await
            .unwrap();
        assert!(client
            .get_document_from_local_cache(key("rooms/a"))
            .await
            .unwrap()
            .has_local_mutations());

        credentials.change_user(User::new("bob"), Some("bob-token".to_string()));
        client.async_queue().drain().await.unwrap();

        assert_eq!(client.sync_engine.current_user(), User::new("bob"));
        assert!(!client
            .get_document_from_local_cache(key("rooms/a"))
            .await
            .unwrap()
            .is_found_document());
    }
}
