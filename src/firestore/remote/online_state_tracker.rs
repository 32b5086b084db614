use std::time::Duration;

use crate::firestore::core::{DelayedOperation, OnlineState};
use crate::firestore::error::FirestoreError;

/// Watch stream failures tolerated before reporting `Offline`.
pub const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long to wait for the watch stream to become healthy before reporting `Offline`.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Derives the client's online state from watch stream health.
///
/// Starts `Unknown`. A single failed connection attempt, or no success within
/// [`ONLINE_STATE_TIMEOUT`], moves to `Offline`; any watch message moves to `Online`.
/// Methods return the new state when it changed so the caller can broadcast it once its
/// locks are released.
#[derive(Debug)]
pub struct OnlineStateTracker {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

impl Default for OnlineStateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OnlineStateTracker {
    pub fn new() -> Self {
        Self {
            state: OnlineState::Unknown,
            watch_stream_failures: 0,
            online_state_timer: None,
            should_warn_client_is_offline: true,
        }
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    /// Called whenever the watch stream is (re)started.
    ///
    /// `schedule_timeout` arms the offline timer; it is only invoked on the first attempt
    /// after a success.
    pub fn handle_watch_stream_start(
        &mut self,
        schedule_timeout: impl FnOnce() -> DelayedOperation,
    ) -> Option<OnlineState> {
        if self.watch_stream_failures != 0 {
            return None;
        }
        let changed = self.set_and_broadcast(OnlineState::Unknown);
        debug_assert!(self.online_state_timer.is_none(), "online state timer already running");
        self.online_state_timer = Some(schedule_timeout());
        changed
    }

    /// The offline timer fired without the stream becoming healthy.
    pub fn handle_timeout_expired(&mut self) -> Option<OnlineState> {
        self.online_state_timer = None;
        debug_assert_eq!(self.state, OnlineState::Unknown, "timer fired while not in Unknown state");
        self.log_client_offline_warning(&format!(
            "backend didn't respond within {} seconds",
            ONLINE_STATE_TIMEOUT.as_secs()
        ));
        self.set_and_broadcast(OnlineState::Offline)
    }

    pub fn handle_watch_stream_failure(&mut self, error: Option<&FirestoreError>) -> Option<OnlineState> {
        if self.state == OnlineState::Online {
            // A healthy stream dropping is not proof of being offline yet.
            return self.set_and_broadcast(OnlineState::Unknown);
        }
        self.watch_stream_failures += 1;
        if self.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
            self.clear_online_state_timer();
            let reason = match error {
                Some(error) => format!("connection failed {} times; most recent error: {error}", self.watch_stream_failures),
                None => format!("connection failed {} times", self.watch_stream_failures),
            };
            self.log_client_offline_warning(&reason);
            return self.set_and_broadcast(OnlineState::Offline);
        }
        None
    }

    /// Explicitly moves to `state`, resetting the failure count and timer.
    pub fn set(&mut self, state: OnlineState) -> Option<OnlineState> {
        self.clear_online_state_timer();
        self.watch_stream_failures = 0;
        if state == OnlineState::Online {
            self.should_warn_client_is_offline = false;
        }
        self.set_and_broadcast(state)
    }

    fn set_and_broadcast(&mut self, state: OnlineState) -> Option<OnlineState> {
        if state == self.state {
            return None;
        }
        self.state = state;
        Some(state)
    }

    fn log_client_offline_warning(&mut self, details: &str) {
        let message = format!(
            "could not reach the backend ({details}); the client will operate in offline mode until it can connect"
        );
        if self.should_warn_client_is_offline {
            log::warn!("{message}");
            self.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }

    fn clear_online_state_timer(&mut self) {
        if let Some(timer) = self.online_state_timer.take() {
            timer.cancel();
        }
    }
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::firestore::core::{AsyncQueue, TimerId};
    use crate::firestore::error::unavailable;

    fn timer(queue: &AsyncQueue) -> DelayedOperation {
        queue.enqueue_after_delay(TimerId::OnlineStateTimeout, ONLINE_STATE_TIMEOUT, async { Ok(()) })
    }

    #[tokio::test]
    async fn first_failure_goes_offline() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new();
        assert_eq!(tracker.handle_watch_stream_start(|| timer(&queue)), None);
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));

        let changed = tracker.handle_watch_stream_failure(Some(&unavailable("no route")));
        assert_eq!(changed, Some(OnlineState::Offline));
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }

    #[tokio::test]
    async fn timeout_goes_offline_and_success_goes_online() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new();
        tracker.handle_watch_stream_start(|| timer(&queue));
        assert_eq!(tracker.handle_timeout_expired(), Some(OnlineState::Offline));
        assert_eq!(tracker.set(OnlineState::Online), Some(OnlineState::Online));
        assert_eq!(tracker.set(OnlineState::Online), None);
    }

    #[tokio::test]
    async fn losing_a_healthy_stream_returns_to_unknown() {
        let queue = AsyncQueue::new();
        let mut tracker = OnlineStateTracker::new();
        tracker.handle_watch_stream_start(|| timer(&queue));
        tracker.set(OnlineState::Online);
        assert_eq!(tracker.handle_watch_stream_failure(None), Some(OnlineState::Unknown));
        assert_eq!(tracker.state(), OnlineState::Unknown);
    }
}
