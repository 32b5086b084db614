use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// `Send` on native targets; no bound on wasm32 where futures are single-threaded.
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSend: Send {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send> MaybeSend for T {}

#[cfg(target_arch = "wasm32")]
pub trait MaybeSend {}
#[cfg(target_arch = "wasm32")]
impl<T> MaybeSend for T {}

#[cfg(not(target_arch = "wasm32"))]
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
#[cfg(target_arch = "wasm32")]
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

pub fn boxed<F>(future: F) -> BoxedFuture<F::Output>
where
    F: Future + MaybeSend + 'static,
{
    Box::pin(future)
}

/// Spawns a task that runs to completion in the background.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Spawns a task that runs to completion in the background.
///
/// Uses the ambient tokio runtime when there is one and a lazily built single-threaded
/// runtime otherwise.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use once_cell::sync::Lazy;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
        match Builder::new_multi_thread().worker_threads(1).enable_all().build() {
            Ok(runtime) => Some(runtime),
            Err(err) => {
                log::error!("failed to build background runtime: {err}");
                None
            }
        }
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else if let Some(runtime) = BACKGROUND_RUNTIME.as_ref() {
        runtime.spawn(future);
    }
}

/// Waits for `duration`; returns immediately for a zero duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }

    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    use gloo_timers::future::sleep;
    sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    use tokio::time::sleep;
    sleep(duration).await;
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn spawned_tasks_run_on_the_current_runtime() {
        let (sender, receiver) = futures::channel::oneshot::channel();
        spawn_detached(async move {
            sleep(Duration::from_millis(1)).await;
            let _ = sender.send(7);
        });
        assert_eq!(receiver.await.unwrap(), 7);
    }

    #[test]
    fn spawning_without_a_runtime_uses_the_background_runtime() {
        let flag = Arc::new(AtomicBool::new(false));
        let (sender, receiver) = std::sync::mpsc::channel();
        let task_flag = Arc::clone(&flag);
        spawn_detached(async move {
            task_flag.store(true, Ordering::SeqCst);
            let _ = sender.send(());
        });
        receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(flag.load(Ordering::SeqCst));
    }
}
