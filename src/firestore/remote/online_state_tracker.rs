use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::firestore::core::types::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::firestore::util::assert::hard_assert;
use crate::firestore::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Watch stream failures tolerated before the client is considered offline.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long the first connection attempt may take before the client is
/// considered offline.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) -> BoxFuture<'static, ()> + Send + Sync>;

/// Derives the client's [`OnlineState`] from the health of the watch stream.
///
/// A stream that fails once, or that does not come up within
/// [`ONLINE_STATE_TIMEOUT`], switches the state to `Offline` so cached
/// results are raised without waiting for the backend.
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    me: Weak<Self>,
    state: StdMutex<TrackerState>,
}

struct TrackerState {
    online_state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            queue,
            handler,
            me: me.clone(),
            state: StdMutex::new(TrackerState {
                online_state: OnlineState::Unknown,
                watch_stream_failures: 0,
                online_state_timer: None,
                should_warn_client_is_offline: true,
            }),
        })
    }

    pub fn online_state(&self) -> OnlineState {
        self.state.lock().unwrap().online_state
    }

    /// Called whenever the watch stream is (re)started.
    pub async fn handle_watch_stream_start(&self) {
        let first_attempt = {
            let mut state = self.state.lock().unwrap();
            if state.watch_stream_failures != 0 {
                false
            } else {
                if let Some(timer) = state.online_state_timer.take() {
                    timer.cancel();
                }
                let me = self.me.clone();
                state.online_state_timer = Some(self.queue.enqueue_after_delay(
                    TimerId::OnlineStateTimeout,
                    ONLINE_STATE_TIMEOUT,
                    move || async move {
                        if let Some(tracker) = me.upgrade() {
                            tracker.handle_timeout().await;
                        }
                        Ok(())
                    },
                ));
                true
            }
        };
        if first_attempt {
            self.set_and_broadcast(OnlineState::Unknown).await;
        }
    }

    pub async fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let next = {
            let mut state = self.state.lock().unwrap();
            if state.online_state == OnlineState::Online {
                // A single failure only makes an online client uncertain.
                hard_assert(
                    state.watch_stream_failures == 0,
                    "watch failures counted while online",
                );
                hard_assert(
                    state.online_state_timer.is_none(),
                    "online state timer running while online",
                );
                Some(OnlineState::Unknown)
            } else {
                state.watch_stream_failures += 1;
                if state.watch_stream_failures >= MAX_WATCH_STREAM_FAILURES {
                    if let Some(timer) = state.online_state_timer.take() {
                        timer.cancel();
                    }
                    self.log_client_offline_warning(
                        &mut state,
                        &format!(
                            "Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"
                        ),
                    );
                    Some(OnlineState::Offline)
                } else {
                    None
                }
            }
        };
        if let Some(next) = next {
            self.set_and_broadcast(next).await;
        }
    }

    /// Sets an explicit state and resets failure tracking.
    pub async fn set(&self, online_state: OnlineState) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(timer) = state.online_state_timer.take() {
                timer.cancel();
            }
            state.watch_stream_failures = 0;
            if online_state == OnlineState::Online {
                state.should_warn_client_is_offline = false;
            }
        }
        self.set_and_broadcast(online_state).await;
    }

    pub fn shutdown(&self) {
        if let Some(timer) = self.state.lock().unwrap().online_state_timer.take() {
            timer.cancel();
        }
    }

    async fn handle_timeout(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.online_state_timer = None;
            if state.online_state != OnlineState::Unknown {
                return;
            }
            self.log_client_offline_warning(
                &mut state,
                &format!(
                    "Backend didn't respond within {} seconds.",
                    ONLINE_STATE_TIMEOUT.as_secs()
                ),
            );
        }
        self.set_and_broadcast(OnlineState::Offline).await;
    }

    async fn set_and_broadcast(&self, online_state: OnlineState) {
        {
            let mut state = self.state.lock().unwrap();
            if state.online_state == online_state {
                return;
            }
            state.online_state = online_state;
        }
        (self.handler)(online_state).await;
    }

    fn log_client_offline_warning(&self, state: &mut TrackerState, details: &str) {
        let message = format!(
            "Could not reach the backend. {details} The client will operate in offline mode \
             until it is able to successfully connect to the backend."
        );
        if state.should_warn_client_is_offline {
            log::warn!("{message}");
            state.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }
}
