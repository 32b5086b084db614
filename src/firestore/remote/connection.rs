use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::firestore::core::TargetId;
use crate::firestore::error::{failed_precondition, unavailable, FirestoreError, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::credentials::Token;
use crate::firestore::remote::watch_change::WatchChange;

#[derive(Debug, Clone, PartialEq)]
pub enum ListenRequest {
    AddTarget(TargetData),
    RemoveTarget(TargetId),
}

/// A write stream request. The first request on a stream is the handshake and carries no
/// mutations.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub stream_token: Bytes,
    pub mutations: Vec<Mutation>,
}

impl WriteRequest {
    pub fn handshake(stream_token: Bytes) -> Self {
        Self {
            stream_token,
            mutations: Vec::new(),
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Server response on the write stream; the handshake response has no results.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Bytes,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
}

impl WriteResponse {
    pub fn handshake(stream_token: Bytes) -> Self {
        Self {
            stream_token,
            commit_version: SnapshotVersion::min(),
            mutation_results: Vec::new(),
        }
    }
}

/// Receives the events of one opened stream.
///
/// Implementations must return quickly; they typically hand the event to the async queue.
pub trait StreamCallbacks<M>: Send + Sync {
    fn on_open(&self);

    fn on_message(&self, message: M);

    /// The stream ended; `None` for a clean close by the server.
    fn on_close(&self, error: Option<FirestoreError>);
}

/// The sending half of an opened stream.
pub trait StreamHandle<R>: Send + Sync {
    fn send(&self, request: R) -> FirestoreResult<()>;

    /// Closes the stream without invoking its callbacks.
    fn close(&self);
}

/// Opens bidirectional streams to the backend. Encoding and transport live behind it.
pub trait Connection: Send + Sync + 'static {
    fn open_listen_stream(
        &self,
        token: Option<Token>,
        callbacks: Arc<dyn StreamCallbacks<WatchChange>>,
    ) -> Box<dyn StreamHandle<ListenRequest>>;

    fn open_write_stream(
        &self,
        token: Option<Token>,
        callbacks: Arc<dyn StreamCallbacks<WriteResponse>>,
    ) -> Box<dyn StreamHandle<WriteRequest>>;
}

struct OpenStream<M> {
    id: u64,
    callbacks: Arc<dyn StreamCallbacks<M>>,
}

impl<M> Clone for OpenStream<M> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callbacks: Arc::clone(&self.callbacks),
        }
    }
}

struct ConnectionState {
    reachable: bool,
    next_stream_id: u64,
    listen_stream: Option<OpenStream<WatchChange>>,
    write_stream: Option<OpenStream<WriteResponse>>,
    listen_open_count: usize,
    write_open_count: usize,
    listen_requests: Vec<ListenRequest>,
    write_requests: Vec<WriteRequest>,
    watched_targets: BTreeMap<TargetId, TargetData>,
    tokens: Vec<Option<Token>>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            reachable: true,
            next_stream_id: 1,
            listen_stream: None,
            write_stream: None,
            listen_open_count: 0,
            write_open_count: 0,
            listen_requests: Vec::new(),
            write_requests: Vec::new(),
            watched_targets: BTreeMap::new(),
            tokens: Vec::new(),
        }
    }
}

/// A scripted stand-in for the backend.
///
/// Requests sent by the client are recorded; tests answer them by pushing watch changes and
/// write responses, and can drop the network to exercise reconnects.
#[derive(Clone, Default)]
pub struct InMemoryConnection {
    state: Arc<Mutex<ConnectionState>>,
}

impl Debug for InMemoryConnection {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryConnection")
            .field("reachable", &state.reachable)
            .field("listen_open", &state.listen_stream.is_some())
            .field("write_open", &state.write_stream.is_some())
            .finish()
    }
}

impl InMemoryConnection {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Makes the backend (un)reachable. Going unreachable fails every open stream.
    pub fn set_reachable(&self, reachable: bool) {
        let (listen, write) = {
            let mut state = self.lock();
            state.reachable = reachable;
            if reachable {
                (None, None)
            } else {
                state.watched_targets.clear();
                (state.listen_stream.take(), state.write_stream.take())
            }
        };
        if let Some(stream) = listen {
            stream.callbacks.on_close(Some(unavailable("backend unreachable")));
        }
        if let Some(stream) = write {
            stream.callbacks.on_close(Some(unavailable("backend unreachable")));
        }
    }

    pub fn is_listen_stream_open(&self) -> bool {
        self.lock().listen_stream.is_some()
    }

    pub fn is_write_stream_open(&self) -> bool {
        self.lock().write_stream.is_some()
    }

    pub fn listen_open_count(&self) -> usize {
        self.lock().listen_open_count
    }

    pub fn write_open_count(&self) -> usize {
        self.lock().write_open_count
    }

    /// Targets the open listen stream is currently watching.
    pub fn watched_targets(&self) -> BTreeMap<TargetId, TargetData> {
        self.lock().watched_targets.clone()
    }

    pub fn take_listen_requests(&self) -> Vec<ListenRequest> {
        std::mem::take(&mut self.lock().listen_requests)
    }

    pub fn take_write_requests(&self) -> Vec<WriteRequest> {
        std::mem::take(&mut self.lock().write_requests)
    }

    /// Tokens presented on each stream open, in order.
    pub fn tokens(&self) -> Vec<Option<Token>> {
        self.lock().tokens.clone()
    }

    pub fn push_watch_change(&self, change: WatchChange) -> FirestoreResult<()> {
        let stream = self
            .lock()
            .listen_stream
            .clone()
            .ok_or_else(|| failed_precondition("no listen stream is open"))?;
        stream.callbacks.on_message(change);
        Ok(())
    }

    pub fn push_write_response(&self, response: WriteResponse) -> FirestoreResult<()> {
        let stream = self
            .lock()
            .write_stream
            .clone()
            .ok_or_else(|| failed_precondition("no write stream is open"))?;
        stream.callbacks.on_message(response);
        Ok(())
    }

    /// Closes the listen stream from the server side with `error`.
    pub fn fail_listen_stream(&self, error: FirestoreError) {
        let stream = {
            let mut state = self.lock();
            state.watched_targets.clear();
            state.listen_stream.take()
        };
        if let Some(stream) = stream {
            stream.callbacks.on_close(Some(error));
        }
    }

    /// Closes the write stream from the server side with `error`.
    pub fn fail_write_stream(&self, error: FirestoreError) {
        let stream = self.lock().write_stream.take();
        if let Some(stream) = stream {
            stream.callbacks.on_close(Some(error));
        }
    }

    fn record_listen_request(&self, stream_id: u64, request: ListenRequest) -> FirestoreResult<()> {
        let mut state = self.lock();
        if state.listen_stream.as_ref().map(|stream| stream.id) != Some(stream_id) {
            return Err(failed_precondition("listen stream is closed"));
        }
        match &request {
            ListenRequest::AddTarget(target_data) => {
                state
                    .watched_targets
                    .insert(target_data.target_id, target_data.clone());
            }
            ListenRequest::RemoveTarget(target_id) => {
                state.watched_targets.remove(target_id);
            }
        }
        state.listen_requests.push(request);
        Ok(())
    }

    fn record_write_request(&self, stream_id: u64, request: WriteRequest) -> FirestoreResult<()> {
        let mut state = self.lock();
        if state.write_stream.as_ref().map(|stream| stream.id) != Some(stream_id) {
            return Err(failed_precondition("write stream is closed"));
        }
        state.write_requests.push(request);
        Ok(())
    }

    fn close_stream(&self, stream_id: u64) {
        let mut state = self.lock();
        if state.listen_stream.as_ref().map(|stream| stream.id) == Some(stream_id) {
            state.listen_stream = None;
            state.watched_targets.clear();
        }
        if state.write_stream.as_ref().map(|stream| stream.id) == Some(stream_id) {
            state.write_stream = None;
        }
    }
}

struct InMemoryListenHandle {
    connection: InMemoryConnection,
    stream_id: u64,
}

impl StreamHandle<ListenRequest> for InMemoryListenHandle {
    fn send(&self, request: ListenRequest) -> FirestoreResult<()> {
        self.connection.record_listen_request(self.stream_id, request)
    }

    fn close(&self) {
        self.connection.close_stream(self.stream_id);
    }
}

struct InMemoryWriteHandle {
    connection: InMemoryConnection,
    stream_id: u64,
}

impl StreamHandle<WriteRequest> for InMemoryWriteHandle {
    fn send(&self, request: WriteRequest) -> FirestoreResult<()> {
        self.connection.record_write_request(self.stream_id, request)
    }

    fn close(&self) {
        self.connection.close_stream(self.stream_id);
    }
}

impl Connection for InMemoryConnection {
    fn open_listen_stream(
        &self,
        token: Option<Token>,
        callbacks: Arc<dyn StreamCallbacks<WatchChange>>,
    ) -> Box<dyn StreamHandle<ListenRequest>> {
        let (stream_id, reachable) = {
            let mut state = self.lock();
            let stream_id = state.next_stream_id;
            state.next_stream_id += 1;
            state.tokens.push(token);
            state.watched_targets.clear();
            if state.reachable {
                state.listen_open_count += 1;
                state.listen_stream = Some(OpenStream {
                    id: stream_id,
                    callbacks: Arc::clone(&callbacks),
                });
            }
            (stream_id, state.reachable)
        };
        if reachable {
            callbacks.on_open();
        } else {
            callbacks.on_close(Some(unavailable("backend unreachable")));
        }
        Box::new(InMemoryListenHandle {
            connection: self.clone(),
            stream_id,
        })
    }

    fn open_write_stream(
        &self,
        token: Option<Token>,
        callbacks: Arc<dyn StreamCallbacks<WriteResponse>>,
    ) -> Box<dyn StreamHandle<WriteRequest>> {
        let (stream_id, reachable) = {
            let mut state = self.lock();
            let stream_id = state.next_stream_id;
            state.next_stream_id += 1;
            state.tokens.push(token);
            if state.reachable {
                state.write_open_count += 1;
                state.write_stream = Some(OpenStream {
                    id: stream_id,
                    callbacks: Arc::clone(&callbacks),
                });
            }
            (stream_id, state.reachable)
        };
        if reachable {
            callbacks.on_open();
        } else {
            callbacks.on_close(Some(unavailable("backend unreachable")));
        }
        Box::new(InMemoryWriteHandle {
            connection: self.clone(),
            stream_id,
        })
    }
}
