use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::channel::oneshot;

use crate::error::{cancelled, failed_precondition, FirestoreResult};
use crate::platform::runtime;
use crate::util::assert::hard_assert;
use crate::util::backoff::{Backoff, BackoffSettings};
use crate::util::{box_future, BoxedFuture, MaybeSend};

/// Identifies the kind of a delayed operation so tests can fast-forward
/// specific timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_delayed_operations_early`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    TransactionRetry,
    AsyncQueueRetry,
}

type QueuedOp = BoxedFuture<'static, ()>;

#[cfg(not(target_arch = "wasm32"))]
type DeferredOp = Box<dyn FnOnce() -> BoxedFuture<'static, ()> + Send>;
#[cfg(target_arch = "wasm32")]
type DeferredOp = Box<dyn FnOnce() -> BoxedFuture<'static, ()>>;

#[cfg(not(target_arch = "wasm32"))]
type RetryableOp = Arc<dyn Fn() -> BoxedFuture<'static, FirestoreResult<()>> + Send + Sync>;
#[cfg(target_arch = "wasm32")]
type RetryableOp = Arc<dyn Fn() -> BoxedFuture<'static, FirestoreResult<()>>>;

/// Serialized executor for every state-mutating operation of a client.
///
/// Operations run one at a time, in submission order, on a single worker
/// task. An operation must never enqueue another operation and then await
/// its result: the worker is busy with the caller and the wait never ends.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    sender: async_channel::Sender<QueuedOp>,
    state: Mutex<QueueState>,
    operation_in_progress: Arc<AtomicBool>,
    shutting_down: AtomicBool,
}

struct QueueState {
    delayed: Vec<Arc<DelayedInner>>,
    retryable: VecDeque<RetryableOp>,
    retry_backoff: Backoff,
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::with_retry_backoff(BackoffSettings::default())
    }

    pub fn with_retry_backoff(settings: BackoffSettings) -> Self {
        let (sender, receiver) = async_channel::unbounded::<QueuedOp>();
        let operation_in_progress = Arc::new(AtomicBool::new(false));
        let in_progress = Arc::clone(&operation_in_progress);
        runtime::spawn_detached(async move {
            while let Ok(op) = receiver.recv().await {
                in_progress.store(true, Ordering::SeqCst);
                op.await;
                in_progress.store(false, Ordering::SeqCst);
            }
        });

        Self {
            inner: Arc::new(QueueInner {
                sender,
                state: Mutex::new(QueueState {
                    delayed: Vec::new(),
                    retryable: VecDeque::new(),
                    retry_backoff: Backoff::new(settings),
                }),
                operation_in_progress,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Runs `op` after every previously enqueued operation and returns its
    /// result.
    pub async fn enqueue<F, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
        T: MaybeSend + 'static,
    {
        if self.is_shutting_down() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        self.enqueue_unchecked(op).await
    }

    /// Like [`enqueue`](Self::enqueue) but still accepted after shutdown began.
    pub async fn enqueue_even_while_shutting_down<F, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
        T: MaybeSend + 'static,
    {
        self.enqueue_unchecked(op).await
    }

    async fn enqueue_unchecked<F, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + MaybeSend + 'static,
        T: MaybeSend + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.push(box_future(async move {
            let result = op.await;
            let _ = tx.send(result);
        }))?;
        rx.await
            .map_err(|_| cancelled("queued operation was dropped before completing"))?
    }

    /// Fire-and-forget variant; failures are the operation's own business.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = ()> + MaybeSend + 'static,
    {
        if self.is_shutting_down() {
            log::debug!("ignoring operation enqueued after shutdown");
            return;
        }
        if let Err(err) = self.inner.push(box_future(op)) {
            log::warn!("failed to enqueue operation: {err}");
        }
    }

    /// Schedules `op` to be enqueued once `delay` has elapsed.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, op: F) -> DelayedOperation
    where
        F: FnOnce() -> BoxedFuture<'static, ()> + MaybeSend + 'static,
    {
        let delayed = Arc::new(DelayedInner {
            timer_id,
            target_time_ms: runtime::now_millis().saturating_add(delay.as_millis() as i64),
            op: Mutex::new(Some(Box::new(op) as DeferredOp)),
            queue: Arc::downgrade(&self.inner),
        });
        {
            let mut state = self.inner.lock_state();
            state.delayed.push(Arc::clone(&delayed));
        }

        let timer = Arc::downgrade(&delayed);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(delayed) = timer.upgrade() {
                delayed.fire();
            }
        });

        DelayedOperation { inner: delayed }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .lock_state()
            .delayed
            .iter()
            .any(|op| op.timer_id == timer_id)
    }

    /// Fires pending delayed operations in target-time order, stopping after
    /// the first one whose id is `last_timer_id`.
    pub async fn run_delayed_operations_early(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        self.drain().await?;
        let mut pending = self.inner.lock_state().delayed.clone();
        pending.sort_by_key(|op| op.target_time_ms);
        for op in pending {
            op.fire();
            if last_timer_id != TimerId::All && op.timer_id == last_timer_id {
                break;
            }
        }
        self.drain().await
    }

    /// Resolves once everything enqueued so far has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.enqueue_unchecked(async { Ok(()) }).await
    }

    /// Adds `op` to the retry chain. Operations in the chain run strictly in
    /// order; one failing with a storage failure is retried after a shared
    /// backoff before anything behind it runs.
    pub fn enqueue_retryable<F>(&self, op: F)
    where
        F: Fn() -> BoxedFuture<'static, FirestoreResult<()>> + MaybeSend + Sync + 'static,
    {
        let start = {
            let mut state = self.inner.lock_state();
            state.retryable.push_back(Arc::new(op) as RetryableOp);
            state.retryable.len() == 1
        };
        if start {
            self.retry_next_op();
        }
    }

    fn retry_next_op(&self) {
        let queue = self.clone();
        self.enqueue_and_forget(async move {
            let head = queue.inner.lock_state().retryable.front().cloned();
            let Some(head) = head else {
                return;
            };
            match head().await {
                Ok(()) => {
                    let more = {
                        let mut state = queue.inner.lock_state();
                        state.retryable.pop_front();
                        state.retry_backoff.reset();
                        !state.retryable.is_empty()
                    };
                    if more {
                        queue.retry_next_op();
                    }
                }
                Err(err) if err.is_storage_failure() => {
                    let delay = queue.inner.lock_state().retry_backoff.next_delay();
                    log::debug!("retryable operation failed, retrying in {delay:?}: {err}");
                    let retry_queue = queue.clone();
                    queue.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, move || {
                        box_future(async move { retry_queue.retry_next_op() })
                    });
                }
                Err(err) => {
                    log::error!("retryable operation failed permanently: {err}");
                    let more = {
                        let mut state = queue.inner.lock_state();
                        state.retryable.pop_front();
                        !state.retryable.is_empty()
                    };
                    if more {
                        queue.retry_next_op();
                    }
                }
            }
        });
    }

    pub fn verify_operation_in_progress(&self) {
        hard_assert(
            self.inner.operation_in_progress.load(Ordering::SeqCst),
            "expected to be called from inside an AsyncQueue operation",
        );
    }

    /// Rejects every later operation (except the shutdown variants) and
    /// cancels pending timers.
    pub fn enter_shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let delayed = std::mem::take(&mut self.inner.lock_state().delayed);
        for op in delayed {
            op.op_take();
        }
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, op: QueuedOp) -> FirestoreResult<()> {
        self.sender
            .try_send(op)
            .map_err(|_| cancelled("async queue worker is no longer running"))
    }

    fn remove_delayed(&self, target: &Arc<DelayedInner>) {
        self.lock_state()
            .delayed
            .retain(|candidate| !Arc::ptr_eq(candidate, target));
    }
}

struct DelayedInner {
    timer_id: TimerId,
    target_time_ms: i64,
    op: Mutex<Option<DeferredOp>>,
    queue: Weak<QueueInner>,
}

impl DelayedInner {
    fn op_take(&self) -> Option<DeferredOp> {
        self.op
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn fire(self: &Arc<Self>) {
        let Some(op) = self.op_take() else {
            return;
        };
        if let Some(queue) = self.queue.upgrade() {
            queue.remove_delayed(self);
            if let Err(err) = queue.push(op()) {
                log::debug!("dropping delayed {:?} operation: {err}", self.timer_id);
            }
        }
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    inner: Arc<DelayedInner>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.inner.timer_id
    }

    /// Enqueues the operation now instead of waiting for the timer.
    pub fn skip_delay(&self) {
        self.inner.fire();
    }

    /// Drops the operation if it has not been enqueued yet.
    pub fn cancel(&self) {
        if self.inner.op_take().is_some() {
            if let Some(queue) = self.inner.queue.upgrade() {
                queue.remove_delayed(&self.inner);
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner
            .op
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }
}
