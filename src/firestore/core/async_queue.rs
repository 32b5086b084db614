use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::channel::oneshot;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::platform::runtime::{boxed, sleep, spawn_detached, BoxedFuture, MaybeSend};

/// Identifies the kind of a delayed operation so tests can fast-forward specific timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_delayed_operations_early`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    LruGarbageCollection,
    UnlistenGracePeriod,
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time_ms: i64,
    job: BoxedFuture<()>,
}

struct AsyncQueueInner {
    sender: async_channel::Sender<BoxedFuture<()>>,
    restricted: AtomicBool,
    delayed: StdMutex<Vec<DelayedEntry>>,
    next_delayed_id: AtomicU64,
}

impl AsyncQueueInner {
    fn submit(&self, job: BoxedFuture<()>) -> FirestoreResult<()> {
        self.sender
            .try_send(job)
            .map_err(|_| cancelled("the async queue has shut down"))
    }

    fn take_delayed(&self, id: u64) -> Option<DelayedEntry> {
        let mut delayed = self.delayed.lock().unwrap_or_else(|poison| poison.into_inner());
        let position = delayed.iter().position(|entry| entry.id == id)?;
        Some(delayed.remove(position))
    }
}

/// Serial executor for everything that touches client state.
///
/// Operations run one at a time in submission order. An operation must never await
/// another operation enqueued on the same queue.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

impl Debug for AsyncQueue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncQueue")
            .field("restricted", &self.is_restricted())
            .finish()
    }
}

impl AsyncQueue {
    /// Creates the queue and spawns its worker on the current runtime.
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<BoxedFuture<()>>();
        spawn_detached(boxed(async move {
            while let Ok(job) = receiver.recv().await {
                job.await;
            }
            log::debug!("async queue worker stopped");
        }));
        Self {
            inner: Arc::new(AsyncQueueInner {
                sender,
                restricted: AtomicBool::new(false),
                delayed: StdMutex::new(Vec::new()),
                next_delayed_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_restricted(&self) -> bool {
        self.inner.restricted.load(Ordering::SeqCst)
    }

    /// Runs `operation` after everything already queued and returns its result.
    pub async fn enqueue<F, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
        T: MaybeSend + 'static,
    {
        if self.is_restricted() {
            return Err(cancelled("the client has been terminated"));
        }
        self.enqueue_even_while_restricted(operation).await
    }

    /// Like [`Self::enqueue`] but also accepted after [`Self::enter_restricted_mode`].
    pub async fn enqueue_even_while_restricted<F, T>(&self, operation: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
        T: MaybeSend + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.inner.submit(boxed(async move {
            let _ = sender.send(operation.await);
        }))?;
        receiver
            .await
            .map_err(|_| cancelled("the operation was dropped before completing"))?
    }

    /// Queues `operation` without waiting; failures are logged.
    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: Future<Output = FirestoreResult<()>> + MaybeSend + 'static,
    {
        if self.is_restricted() {
            log::debug!("dropping operation enqueued after termination");
            return;
        }
        let job = boxed(async move {
            if let Err(err) = operation.await {
                log::error!("async queue operation failed: {err}");
            }
        });
        if let Err(err) = self.inner.submit(job) {
            log::debug!("{err}");
        }
    }

    /// Schedules `operation` to be queued once `delay` has elapsed.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, operation: F) -> DelayedOperation
    where
        F: Future<Output = FirestoreResult<()>> + MaybeSend + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let target_time_ms = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let job = boxed(async move {
            if let Err(err) = operation.await {
                log::error!("delayed operation {timer_id:?} failed: {err}");
            }
        });
        {
            let mut delayed = self.inner.delayed.lock().unwrap_or_else(|poison| poison.into_inner());
            delayed.push(DelayedEntry {
                id,
                timer_id,
                target_time_ms,
                job,
            });
        }

        let weak = Arc::downgrade(&self.inner);
        spawn_detached(boxed(async move {
            sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.restricted.load(Ordering::SeqCst) {
                return;
            }
            if let Some(entry) = inner.take_delayed(id) {
                let _ = inner.submit(entry.job);
            }
        }));

        DelayedOperation {
            id,
            timer_id,
            queue: Arc::downgrade(&self.inner),
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        let delayed = self.inner.delayed.lock().unwrap_or_else(|poison| poison.into_inner());
        delayed.iter().any(|entry| timer_id == TimerId::All || entry.timer_id == timer_id)
    }

    /// Runs pending delayed operations in due order, up to and including the first one with
    /// `last_timer_id`, then waits for the queue to drain.
    pub async fn run_delayed_operations_early(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        let mut ready = {
            let mut delayed = self.inner.delayed.lock().unwrap_or_else(|poison| poison.into_inner());
            std::mem::take(&mut *delayed)
        };
        ready.sort_by_key(|entry| (entry.target_time_ms, entry.id));

        let mut remaining = Vec::new();
        let mut stopped = false;
        for entry in ready {
            if stopped {
                remaining.push(entry);
                continue;
            }
            let timer_id = entry.timer_id;
            self.inner.submit(entry.job)?;
            if last_timer_id != TimerId::All && timer_id == last_timer_id {
                stopped = true;
            }
        }
        if !remaining.is_empty() {
            let mut delayed = self.inner.delayed.lock().unwrap_or_else(|poison| poison.into_inner());
            delayed.extend(remaining);
        }
        self.drain().await
    }

    /// Resolves once every operation queued before this call has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue_even_while_restricted(async { Ok(()) }).await
    }

    /// Rejects every later [`Self::enqueue`] with `Cancelled` and drops pending delayed
    /// operations.
    pub fn enter_restricted_mode(&self) {
        self.inner.restricted.store(true, Ordering::SeqCst);
        let mut delayed = self.inner.delayed.lock().unwrap_or_else(|poison| poison.into_inner());
        delayed.clear();
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    queue: Weak<AsyncQueueInner>,
}

impl Debug for DelayedOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running if it has not been queued yet.
    pub fn cancel(&self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.take_delayed(self.id);
        }
    }
}
