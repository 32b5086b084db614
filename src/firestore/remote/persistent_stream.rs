use std::fmt::{self, Debug, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_lock::Mutex;
use async_trait::async_trait;

use crate::firestore::core::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::error::{failed_precondition, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::connection::{
    Connection, ListenRequest, StreamCallbacks, StreamHandle, WriteRequest, WriteResponse,
};
use crate::firestore::remote::credentials::{CredentialsProvider, Token};
use crate::firestore::remote::watch_change::WatchChange;
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

/// An open stream with no outstanding work is closed after this long.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Binds a stream to its message types and connection entry point.
pub trait StreamProtocol: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    const NAME: &'static str;
    const IDLE_TIMER: TimerId;
    const BACKOFF_TIMER: TimerId;

    fn open(
        connection: &dyn Connection,
        token: Option<Token>,
        callbacks: Arc<dyn StreamCallbacks<Self::Response>>,
    ) -> Box<dyn StreamHandle<Self::Request>>;
}

#[derive(Debug, Clone, Copy)]
pub struct ListenProtocol;

impl StreamProtocol for ListenProtocol {
    type Request = ListenRequest;
    type Response = WatchChange;

    const NAME: &'static str = "listen";
    const IDLE_TIMER: TimerId = TimerId::ListenStreamIdle;
    const BACKOFF_TIMER: TimerId = TimerId::ListenStreamConnectionBackoff;

    fn open(
        connection: &dyn Connection,
        token: Option<Token>,
        callbacks: Arc<dyn StreamCallbacks<WatchChange>>,
    ) -> Box<dyn StreamHandle<ListenRequest>> {
        connection.open_listen_stream(token, callbacks)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteProtocol;

impl StreamProtocol for WriteProtocol {
    type Request = WriteRequest;
    type Response = WriteResponse;

    const NAME: &'static str = "write";
    const IDLE_TIMER: TimerId = TimerId::WriteStreamIdle;
    const BACKOFF_TIMER: TimerId = TimerId::WriteStreamConnectionBackoff;

    fn open(
        connection: &dyn Connection,
        token: Option<Token>,
        callbacks: Arc<dyn StreamCallbacks<WriteResponse>>,
    ) -> Box<dyn StreamHandle<WriteRequest>> {
        connection.open_write_stream(token, callbacks)
    }
}

/// Receives stream events on the async queue.
///
/// `on_close` is only called for closes the stream did not request itself through
/// [`PersistentStream::stop`].
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait PersistentStreamListener<M: Send + 'static>: Send + Sync {
    async fn on_open(&self) -> FirestoreResult<()>;

    async fn on_message(&self, message: M) -> FirestoreResult<()>;

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped cleanly. `start` opens immediately.
    Initial,
    /// Waiting for the token or for the connection to open.
    Starting,
    Open,
    /// Closed by a failure. `start` waits out the backoff first.
    Error,
    /// A reconnect is scheduled.
    Backoff,
}

enum StreamEvent<M> {
    Open,
    Message(M),
    Close(Option<FirestoreError>),
}

struct StreamCore<P: StreamProtocol> {
    state: StreamState,
    /// Bumped on every close so events from an earlier connection are ignored.
    close_count: u64,
    backoff: ExponentialBackoff,
    handle: Option<Box<dyn StreamHandle<P::Request>>>,
    idle_timer: Option<DelayedOperation>,
    backoff_timer: Option<DelayedOperation>,
}

impl<P: StreamProtocol> StreamCore<P> {
    fn is_started(&self) -> bool {
        matches!(self.state, StreamState::Starting | StreamState::Backoff | StreamState::Open)
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }
}

struct StreamInner<P: StreamProtocol> {
    queue: AsyncQueue,
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    listener: Arc<dyn PersistentStreamListener<P::Response>>,
    core: Mutex<StreamCore<P>>,
}

/// A stream that reconnects with exponential backoff and closes itself when idle.
pub struct PersistentStream<P: StreamProtocol> {
    inner: Arc<StreamInner<P>>,
}

pub type WatchStream = PersistentStream<ListenProtocol>;
pub type WriteStream = PersistentStream<WriteProtocol>;

impl<P: StreamProtocol> Clone for PersistentStream<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: StreamProtocol> Debug for PersistentStream<P> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentStream").field("name", &P::NAME).finish()
    }
}

impl<P: StreamProtocol> PersistentStream<P> {
    pub fn new(
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
        backoff: BackoffConfig,
        listener: Arc<dyn PersistentStreamListener<P::Response>>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                queue,
                connection,
                credentials,
                listener,
                core: Mutex::new(StreamCore {
                    state: StreamState::Initial,
                    close_count: 0,
                    backoff: ExponentialBackoff::new(backoff),
                    handle: None,
                    idle_timer: None,
                    backoff_timer: None,
                }),
            }),
        }
    }

    pub async fn state(&self) -> StreamState {
        self.inner.core.lock().await.state
    }

    /// Whether `start` was called and the stream has not closed since.
    pub async fn is_started(&self) -> bool {
        self.inner.core.lock().await.is_started()
    }

    pub async fn is_open(&self) -> bool {
        self.inner.core.lock().await.state == StreamState::Open
    }

    /// Opens the stream, after the backoff delay if the previous attempt failed.
    pub async fn start(&self) -> FirestoreResult<()> {
        let close_count = {
            let mut core = self.inner.core.lock().await;
            if core.state == StreamState::Error {
                self.perform_backoff(&mut core);
                return Ok(());
            }
            if core.state != StreamState::Initial {
                return Ok(());
            }
            core.state = StreamState::Starting;
            core.close_count
        };
        self.open_connection(close_count).await
    }

    async fn open_connection(&self, close_count: u64) -> FirestoreResult<()> {
        let token = self.inner.credentials.get_token().await;

        let mut core = self.inner.core.lock().await;
        if core.close_count != close_count {
            // Stopped while the token was being fetched.
            return Ok(());
        }
        match token {
            Ok(token) => {
                log::debug!("opening {} stream", P::NAME);
                let callbacks: Arc<dyn StreamCallbacks<P::Response>> = Arc::new(QueuedCallbacks::<P> {
                    stream: Arc::downgrade(&self.inner),
                    queue: self.inner.queue.clone(),
                    close_count,
                });
                core.handle = Some(P::open(self.inner.connection.as_ref(), token, callbacks));
                Ok(())
            }
            Err(err) => {
                log::warn!("failed to fetch a token for the {} stream: {err}", P::NAME);
                self.close_locked(&mut core, StreamState::Error, Some(&err));
                drop(core);
                self.inner.listener.on_close(Some(err)).await
            }
        }
    }

    fn perform_backoff(&self, core: &mut StreamCore<P>) {
        core.state = StreamState::Backoff;
        let delay = core.backoff.next_delay();
        let close_count = core.close_count;
        let weak = Arc::downgrade(&self.inner);
        core.backoff_timer = Some(self.inner.queue.enqueue_after_delay(P::BACKOFF_TIMER, delay, async move {
            match weak.upgrade() {
                Some(inner) => PersistentStream { inner }.finish_backoff(close_count).await,
                None => Ok(()),
            }
        }));
    }

    async fn finish_backoff(&self, close_count: u64) -> FirestoreResult<()> {
        {
            let mut core = self.inner.core.lock().await;
            if core.state != StreamState::Backoff || core.close_count != close_count {
                return Ok(());
            }
            core.backoff_timer = None;
            core.state = StreamState::Starting;
        }
        self.open_connection(close_count).await
    }

    /// Closes the stream without notifying the listener.
    pub async fn stop(&self) {
        let mut core = self.inner.core.lock().await;
        if core.is_started() || core.state == StreamState::Error {
            self.close_locked(&mut core, StreamState::Initial, None);
        }
    }

    /// After a permanent write failure the next start reconnects without waiting.
    pub async fn inhibit_backoff(&self) {
        let mut core = self.inner.core.lock().await;
        debug_assert!(!core.is_started(), "can only inhibit backoff on a stopped stream");
        core.state = StreamState::Initial;
        core.backoff.reset();
    }

    /// Schedules the stream to close after [`IDLE_TIMEOUT`] unless something is sent first.
    pub async fn mark_idle(&self) {
        let mut core = self.inner.core.lock().await;
        if core.state != StreamState::Open || core.idle_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        core.idle_timer = Some(self.inner.queue.enqueue_after_delay(P::IDLE_TIMER, IDLE_TIMEOUT, async move {
            match weak.upgrade() {
                Some(inner) => PersistentStream { inner }.handle_idle_close().await,
                None => Ok(()),
            }
        }));
    }

    async fn handle_idle_close(&self) -> FirestoreResult<()> {
        {
            let mut core = self.inner.core.lock().await;
            core.idle_timer = None;
            if core.state != StreamState::Open {
                return Ok(());
            }
            log::debug!("closing idle {} stream", P::NAME);
            self.close_locked(&mut core, StreamState::Initial, None);
        }
        self.inner.listener.on_close(None).await
    }

    pub async fn send(&self, request: P::Request) -> FirestoreResult<()> {
        let mut core = self.inner.core.lock().await;
        core.cancel_idle_timer();
        match (&core.handle, core.state) {
            (Some(handle), StreamState::Open) => handle.send(request),
            _ => Err(failed_precondition(format!("the {} stream is not open", P::NAME))),
        }
    }

    fn close_locked(&self, core: &mut StreamCore<P>, final_state: StreamState, error: Option<&FirestoreError>) {
        core.cancel_idle_timer();
        if let Some(timer) = core.backoff_timer.take() {
            timer.cancel();
        }
        core.close_count += 1;

        match error.map(|error| error.code) {
            _ if final_state != StreamState::Error => core.backoff.reset(),
            Some(FirestoreErrorCode::ResourceExhausted) => {
                log::debug!("{} stream was throttled; using maximum backoff", P::NAME);
                core.backoff.reset_to_max();
            }
            Some(FirestoreErrorCode::Unauthenticated) => {
                log::debug!("{} stream was rejected as unauthenticated; refreshing token", P::NAME);
                self.inner.credentials.invalidate_token();
            }
            _ => {}
        }

        if let Some(handle) = core.handle.take() {
            handle.close();
        }
        core.state = final_state;
    }

    async fn handle_event(&self, close_count: u64, event: StreamEvent<P::Response>) -> FirestoreResult<()> {
        let mut core = self.inner.core.lock().await;
        if core.close_count != close_count {
            return Ok(());
        }
        match event {
            StreamEvent::Open => {
                core.state = StreamState::Open;
                drop(core);
                log::debug!("{} stream opened", P::NAME);
                self.inner.listener.on_open().await
            }
            StreamEvent::Message(message) => {
                // A message proves the connection is healthy.
                core.backoff.reset();
                drop(core);
                self.inner.listener.on_message(message).await
            }
            StreamEvent::Close(error) => {
                // Server-side closes count as failures so reconnects back off.
                self.close_locked(&mut core, StreamState::Error, error.as_ref());
                drop(core);
                match &error {
                    Some(error) => log::warn!("{} stream closed with error: {error}", P::NAME),
                    None => log::debug!("{} stream closed by the server", P::NAME),
                }
                self.inner.listener.on_close(error).await
            }
        }
    }
}

/// Moves connection callbacks onto the async queue, tagged with the connection they
/// belong to.
struct QueuedCallbacks<P: StreamProtocol> {
    stream: Weak<StreamInner<P>>,
    queue: AsyncQueue,
    close_count: u64,
}

impl<P: StreamProtocol> QueuedCallbacks<P> {
    fn dispatch(&self, event: StreamEvent<P::Response>) {
        let stream = self.stream.clone();
        let close_count = self.close_count;
        self.queue.enqueue_and_forget(async move {
            match stream.upgrade() {
                Some(inner) => PersistentStream { inner }.handle_event(close_count, event).await,
                None => Ok(()),
            }
        });
    }
}

impl<P: StreamProtocol> StreamCallbacks<P::Response> for QueuedCallbacks<P> {
    fn on_open(&self) {
        self.dispatch(StreamEvent::Open);
    }

    fn on_message(&self, message: P::Response) {
        self.dispatch(StreamEvent::Message(message));
    }

    fn on_close(&self, error: Option<FirestoreError>) {
        self.dispatch(StreamEvent::Close(error));
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::core::User;
    use crate::firestore::error::{resource_exhausted, unauthenticated, unavailable};
    use crate::firestore::remote::connection::InMemoryConnection;
    use crate::firestore::remote::credentials::StaticCredentialsProvider;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingListener {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingListener {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PersistentStreamListener<WatchChange> for RecordingListener {
        async fn on_open(&self) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("open".to_string());
            Ok(())
        }

        async fn on_message(&self, _message: WatchChange) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("message".to_string());
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
            let code = error.map(|error| error.code);
            self.events.lock().unwrap().push(format!("close {code:?}"));
            Ok(())
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        connection: InMemoryConnection,
        credentials: Arc<StaticCredentialsProvider>,
        listener: Arc<RecordingListener>,
        stream: WatchStream,
    }

    fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let connection = InMemoryConnection::new();
        let credentials = Arc::new(StaticCredentialsProvider::new(User::new("alice"), "token"));
        let listener = Arc::new(RecordingListener::default());
        let stream = WatchStream::new(
            queue.clone(),
            Arc::new(connection.clone()),
            credentials.clone(),
            BackoffConfig::default(),
            listener.clone(),
        );
        Fixture {
            queue,
            connection,
            credentials,
            listener,
            stream,
        }
    }

    #[tokio::test]
    async fn opens_and_sends() {
        let fx = fixture();
        fx.stream.start().await.unwrap();
        fx.queue.drain().await.unwrap();
        assert!(fx.stream.is_open().await);
        assert_eq!(fx.listener.events(), vec!["open"]);

        fx.stream.send(ListenRequest::RemoveTarget(2)).await.unwrap();
        assert_eq!(fx.connection.take_listen_requests(), vec![ListenRequest::RemoveTarget(2)]);
        assert_eq!(fx.connection.tokens()[0].as_ref().map(|token| token.value.as_str()), Some("token"));
    }

    #[tokio::test]
    async fn reconnects_after_backoff() {
        let fx = fixture();
        fx.stream.start().await.unwrap();
        fx.queue.drain().await.unwrap();

        fx.connection.fail_listen_stream(unavailable("dropped"));
        fx.queue.drain().await.unwrap();
        assert_eq!(fx.stream.state().await, StreamState::Error);
        assert_eq!(fx.listener.events(), vec!["open", "close Some(Unavailable)"]);

        fx.stream.start().await.unwrap();
        fx.queue.run_delayed_operations_early(TimerId::All).await.unwrap();
        fx.queue.drain().await.unwrap();
        assert!(fx.stream.is_open().await);
        assert_eq!(fx.connection.listen_open_count(), 2);
    }

    #[tokio::test]
    async fn stale_events_from_closed_connections_are_ignored() {
        let fx = fixture();
        fx.stream.start().await.unwrap();
        fx.stream.stop().await;
        fx.queue.drain().await.unwrap();
        assert_eq!(fx.stream.state().await, StreamState::Initial);
        assert!(fx.listener.events().is_empty());
    }

    #[tokio::test]
    async fn unauthenticated_close_refreshes_the_token() {
        let fx = fixture();
        fx.stream.start().await.unwrap();
        fx.queue.drain().await.unwrap();
        fx.connection.fail_listen_stream(unauthenticated("token expired"));
        fx.queue.drain().await.unwrap();

        fx.stream.start().await.unwrap();
        fx.queue.run_delayed_operations_early(TimerId::All).await.unwrap();
        fx.queue.drain().await.unwrap();
        assert_eq!(fx.credentials.refresh_count(), 1);
        assert!(fx.stream.is_open().await);
    }

    #[tokio::test]
    async fn resource_exhausted_waits_the_maximum_delay() {
        let fx = fixture();
        fx.stream.start().await.unwrap();
        fx.queue.drain().await.unwrap();
        fx.connection.fail_listen_stream(resource_exhausted("quota"));
        fx.queue.drain().await.unwrap();

        fx.stream.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        fx.queue.drain().await.unwrap();
        assert_eq!(fx.stream.state().await, StreamState::Backoff);
        assert_eq!(fx.connection.listen_open_count(), 1);
    }

    #[tokio::test]
    async fn idle_stream_closes_and_notifies() {
        let fx = fixture();
        fx.stream.start().await.unwrap();
        fx.queue.drain().await.unwrap();
        fx.stream.mark_idle().await;
        assert!(fx.queue.contains_delayed_operation(TimerId::ListenStreamIdle));

        fx.queue.run_delayed_operations_early(TimerId::ListenStreamIdle).await.unwrap();
        assert_eq!(fx.stream.state().await, StreamState::Initial);
        assert_eq!(fx.listener.events(), vec!["open", "close None"]);
        assert!(!fx.connection.is_listen_stream_open());
    }

    #[tokio::test]
    async fn sending_cancels_the_idle_timer() {
        let fx = fixture();
        fx.stream.start().await.unwrap();
        fx.queue.drain().await.unwrap();
        fx.stream.mark_idle().await;
        fx.stream.send(ListenRequest::RemoveTarget(2)).await.unwrap();
        assert!(!fx.queue.contains_delayed_operation(TimerId::ListenStreamIdle));
    }
}
