use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core::types::OnlineState;
use crate::error::FirestoreError;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::box_future;

pub type OnlineStateCallback = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: usize,
    timer: Option<DelayedOperation>,
    /// Whether an offline transition was already logged since the last
    /// time the client was online.
    should_warn_offline: bool,
}

/// Derives the client's online state from the health of the watch stream.
///
/// The state starts `Unknown`. It becomes `Online` once the stream delivers
/// a message and `Offline` after repeated failures, or when the first
/// connection attempt does not succeed within the timeout.
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    handler: OnlineStateCallback,
    max_watch_stream_failures: usize,
    online_state_timeout: Duration,
    inner: Arc<Mutex<TrackerState>>,
}

impl OnlineStateTracker {
    pub fn new(
        queue: AsyncQueue,
        handler: OnlineStateCallback,
        max_watch_stream_failures: usize,
        online_state_timeout: Duration,
    ) -> Self {
        Self {
            queue,
            handler,
            max_watch_stream_failures,
            online_state_timeout,
            inner: Arc::new(Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                timer: None,
                should_warn_offline: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        lock_state(&self.inner)
    }

    pub fn state(&self) -> OnlineState {
        self.lock().state
    }

    /// Called when the watch stream starts connecting. The first attempt
    /// after a healthy period arms the offline timeout.
    pub fn handle_watch_stream_start(&self) {
        let changed = {
            let mut inner = self.lock();
            if inner.watch_stream_failures != 0 {
                return;
            }
            let changed = set_and_clear(&mut inner, OnlineState::Unknown);
            let tracker = Arc::clone(&self.inner);
            let handler = Arc::clone(&self.handler);
            let timeout = self.online_state_timeout;
            inner.timer = Some(self.queue.enqueue_after_delay(
                TimerId::OnlineStateTimeout,
                timeout,
                move || {
                    box_future(async move {
                        let changed = {
                            let mut inner = lock_state(&tracker);
                            inner.timer = None;
                            if inner.state != OnlineState::Unknown {
                                return;
                            }
                            log_offline(
                                &mut inner,
                                &format!("backend did not respond within {} seconds", timeout.as_secs_f64()),
                            );
                            set_and_clear(&mut inner, OnlineState::Offline)
                        };
                        if changed {
                            handler(OnlineState::Offline);
                        }
                    })
                },
            ));
            changed
        };
        if changed {
            (self.handler)(OnlineState::Unknown);
        }
    }

    /// Called when the watch stream fails. While online, a single failure
    /// only drops back to `Unknown`.
    pub fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let new_state = {
            let mut inner = self.lock();
            if inner.state == OnlineState::Online {
                set_and_clear(&mut inner, OnlineState::Unknown).then_some(OnlineState::Unknown)
            } else {
                inner.watch_stream_failures += 1;
                if inner.watch_stream_failures >= self.max_watch_stream_failures {
                    if let Some(timer) = inner.timer.take() {
                        timer.cancel();
                    }
                    log_offline(
                        &mut inner,
                        &format!("connection failed {} times: {error}", self.max_watch_stream_failures),
                    );
                    set_and_clear(&mut inner, OnlineState::Offline).then_some(OnlineState::Offline)
                } else {
                    None
                }
            }
        };
        if let Some(state) = new_state {
            (self.handler)(state);
        }
    }

    /// Explicitly sets the state, clearing failure tracking. Used when a
    /// message arrives or the network is disabled.
    pub fn set(&self, new_state: OnlineState) {
        let changed = {
            let mut inner = self.lock();
            if new_state == OnlineState::Online {
                inner.should_warn_offline = false;
            }
            set_and_clear(&mut inner, new_state)
        };
        if changed {
            (self.handler)(new_state);
        }
    }
}

fn lock_state(inner: &Mutex<TrackerState>) -> MutexGuard<'_, TrackerState> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resets failure tracking and stores `state`. Returns whether it changed.
fn set_and_clear(inner: &mut TrackerState, state: OnlineState) -> bool {
    inner.watch_stream_failures = 0;
    if let Some(timer) = inner.timer.take() {
        timer.cancel();
    }
    let changed = inner.state != state;
    inner.state = state;
    changed
}

fn log_offline(inner: &mut TrackerState, details: &str) {
    let message = format!("Could not reach the backend; operating in offline mode ({details})");
    if inner.should_warn_offline {
        log::warn!("{message}");
        inner.should_warn_offline = false;
    } else {
        log::debug!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::unavailable;

    fn tracker(max_failures: usize) -> (AsyncQueue, OnlineStateTracker, Arc<Mutex<Vec<OnlineState>>>) {
        let queue = AsyncQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = OnlineStateTracker::new(
            queue.clone(),
            Arc::new(move |state| sink.lock().unwrap().push(state)),
            max_failures,
            Duration::from_secs(10),
        );
        (queue, tracker, seen)
    }

    #[tokio::test]
    async fn goes_offline_after_repeated_failures() {
        let (_queue, tracker, seen) = tracker(2);
        tracker.handle_watch_stream_start();
        tracker.handle_watch_stream_failure(&unavailable("a"));
        assert_eq!(tracker.state(), OnlineState::Unknown);
        tracker.handle_watch_stream_start();
        tracker.handle_watch_stream_failure(&unavailable("b"));
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);
    }

    #[tokio::test]
    async fn a_failure_while_online_only_drops_to_unknown() {
        let (_queue, tracker, seen) = tracker(1);
        tracker.set(OnlineState::Online);
        tracker.handle_watch_stream_failure(&unavailable("a"));
        assert_eq!(tracker.state(), OnlineState::Unknown);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![OnlineState::Online, OnlineState::Unknown]
        );
    }

    #[tokio::test]
    async fn timeout_reports_offline_while_still_unknown() {
        let (queue, tracker, seen) = tracker(3);
        tracker.handle_watch_stream_start();
        assert!(queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
        queue
            .run_delayed_operations_early(TimerId::OnlineStateTimeout)
            .await
            .unwrap();
        assert_eq!(tracker.state(), OnlineState::Offline);
        assert_eq!(*seen.lock().unwrap(), vec![OnlineState::Offline]);

        tracker.set(OnlineState::Online);
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }
}
