use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{abortable, AbortHandle};
use serde_json::Value as JsonValue;

use crate::error::{unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::platform::runtime;
use crate::remote::connection::StreamHandle;
use crate::remote::datastore::{Datastore, LISTEN_RPC, WRITE_RPC};
use crate::util::assert::hard_assert;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::{BackoffSettings, ExponentialBackoff};
use crate::util::box_future;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    fn rpc_name(self) -> &'static str {
        match self {
            StreamKind::Listen => LISTEN_RPC,
            StreamKind::Write => WRITE_RPC,
        }
    }

    fn idle_timer(self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer(self) -> TimerId {
        match self {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }
}

/// Lifecycle of a [`PersistentStream`].
///
/// ```text
/// Initial -> Starting -> Open -> Error -> Backoff -> Initial
///              |                  ^
///              +------------------+
/// ```
///
/// `stop` returns any state to `Initial`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    Initial,
    Starting,
    Open,
    /// Closed by an error; the next start backs off first.
    Error,
    /// Waiting for the backoff timer before reconnecting.
    Backoff,
}

/// Raw stream events, delivered on the async queue.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamEvents: Send + Sync {
    async fn on_open(&self) -> FirestoreResult<()>;
    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()>;
    /// `error` is `None` when the stream was stopped locally.
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

struct StreamInner {
    state: PersistentStreamState,
    /// Incremented on every close. Callbacks of an older connection carry
    /// a stale generation and are dropped.
    generation: u64,
    handle: Option<Arc<StreamHandle>>,
    reader: Option<AbortHandle>,
    backoff: ExponentialBackoff,
    idle_timer: Option<DelayedOperation>,
}

/// A stream that reconnects with backoff after errors and closes itself
/// after a period without outstanding work.
///
/// Every method must be called from an operation on the async queue.
pub struct PersistentStream {
    kind: StreamKind,
    queue: AsyncQueue,
    datastore: Arc<Datastore>,
    idle_timeout: Duration,
    events: Weak<dyn StreamEvents>,
    inner: Mutex<StreamInner>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        queue: AsyncQueue,
        datastore: Arc<Datastore>,
        backoff: BackoffSettings,
        idle_timeout: Duration,
        events: Weak<dyn StreamEvents>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            queue: queue.clone(),
            datastore,
            idle_timeout,
            events,
            inner: Mutex::new(StreamInner {
                state: PersistentStreamState::Initial,
                generation: 0,
                handle: None,
                reader: None,
                backoff: ExponentialBackoff::new(queue, kind.backoff_timer(), backoff),
                idle_timer: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> PersistentStreamState {
        self.lock().state
    }

    /// Whether `start` was called and `stop` was not, including while
    /// connecting or backing off.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Starting | PersistentStreamState::Open | PersistentStreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == PersistentStreamState::Open
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Connects the stream. After an error the connection attempt waits for
    /// the backoff delay.
    pub fn start(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.lock();
            if inner.state == PersistentStreamState::Error {
                drop(inner);
                self.perform_backoff();
                return;
            }
            hard_assert(
                inner.state == PersistentStreamState::Initial,
                "stream started while already running",
            );
            inner.state = PersistentStreamState::Starting;
            inner.generation
        };

        let stream = Arc::clone(self);
        runtime::spawn_detached(async move {
            let opened = stream.datastore.open_stream(stream.kind.rpc_name()).await;
            let queued = Arc::clone(&stream);
            stream.queue.enqueue_and_forget(async move {
                if !queued.is_current(generation) {
                    if let Ok(handle) = opened {
                        handle.close();
                    }
                    return;
                }
                match opened {
                    Ok(handle) => queued.on_stream_opened(generation, Arc::new(handle)).await,
                    Err(err) => queued.handle_stream_close(err).await,
                }
            });
        });
    }

    async fn on_stream_opened(self: &Arc<Self>, generation: u64, handle: Arc<StreamHandle>) {
        let reader = self.spawn_reader(generation, Arc::clone(&handle));
        {
            let mut inner = self.lock();
            inner.handle = Some(handle);
            inner.reader = Some(reader);
            inner.state = PersistentStreamState::Open;
        }
        log::debug!("{:?} stream opened", self.kind);
        if let Some(events) = self.events.upgrade() {
            if let Err(err) = events.on_open().await {
                log::warn!("{:?} stream open handler failed: {err}", self.kind);
            }
        }
    }

    /// Forwards server frames to the queue, tagged with the generation of
    /// the connection they arrived on.
    fn spawn_reader(self: &Arc<Self>, generation: u64, handle: Arc<StreamHandle>) -> AbortHandle {
        let stream = Arc::clone(self);
        let (reader, abort) = abortable(async move {
            loop {
                let next = handle.next().await;
                let finished = !matches!(next, Some(Ok(_)));
                let target = Arc::clone(&stream);
                stream.queue.enqueue_and_forget(async move {
                    if !target.is_current(generation) {
                        return;
                    }
                    match next {
                        Some(Ok(message)) => target.handle_message(message).await,
                        Some(Err(err)) => target.handle_stream_close(err).await,
                        None => {
                            target
                                .handle_stream_close(unavailable("stream closed by the backend"))
                                .await
                        }
                    }
                });
                if finished {
                    break;
                }
            }
        });
        runtime::spawn_detached(async move {
            let _ = reader.await;
        });
        abort
    }

    async fn handle_message(&self, message: JsonValue) {
        self.lock().backoff.reset();
        let Some(events) = self.events.upgrade() else {
            return;
        };
        if let Err(err) = events.on_message(message).await {
            log::warn!("{:?} stream message handler failed: {err}", self.kind);
        }
    }

    async fn handle_stream_close(&self, error: FirestoreError) {
        hard_assert(self.is_started(), "stream error on a stream that was not started");
        log::debug!("{:?} stream closed with error: {error}", self.kind);
        self.close(PersistentStreamState::Error, Some(error)).await;
    }

    fn perform_backoff(self: &Arc<Self>) {
        let stream = Arc::clone(self);
        let mut inner = self.lock();
        inner.state = PersistentStreamState::Backoff;
        inner.backoff.backoff_and_run(move || {
            box_future(async move {
                {
                    let mut inner = stream.lock();
                    if inner.state != PersistentStreamState::Backoff {
                        return;
                    }
                    inner.state = PersistentStreamState::Initial;
                }
                stream.start();
            })
        });
    }

    /// Closes the stream and returns it to `Initial`. The events receive a
    /// close without an error.
    pub async fn stop(&self) {
        if self.is_started() {
            self.close(PersistentStreamState::Initial, None).await;
        }
    }

    /// Clears the backoff so that the next start after an error connects
    /// immediately.
    pub fn inhibit_backoff(&self) {
        let mut inner = self.lock();
        hard_assert(
            !matches!(
                inner.state,
                PersistentStreamState::Starting | PersistentStreamState::Open | PersistentStreamState::Backoff
            ),
            "can only inhibit backoff on a stopped stream",
        );
        inner.state = PersistentStreamState::Initial;
        inner.backoff.reset();
    }

    /// Schedules the stream to close after the idle timeout unless more
    /// work arrives first.
    pub fn mark_idle(self: &Arc<Self>) {
        let mut inner = self.lock();
        if inner.state != PersistentStreamState::Open || inner.idle_timer.is_some() {
            return;
        }
        let stream = Arc::clone(self);
        inner.idle_timer = Some(self.queue.enqueue_after_delay(
            self.kind.idle_timer(),
            self.idle_timeout,
            move || {
                box_future(async move {
                    stream.lock().idle_timer = None;
                    if stream.is_open() {
                        log::debug!("{:?} stream idle, closing", stream.kind);
                        stream.close(PersistentStreamState::Initial, None).await;
                    }
                })
            },
        ));
    }

    pub fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        let handle = {
            let mut inner = self.lock();
            if let Some(timer) = inner.idle_timer.take() {
                timer.cancel();
            }
            inner.handle.clone()
        };
        match handle {
            Some(handle) => handle.send(message),
            None => Err(unavailable("stream is not open")),
        }
    }

    async fn close(&self, final_state: PersistentStreamState, error: Option<FirestoreError>) {
        hard_assert(
            final_state == PersistentStreamState::Error || error.is_none(),
            "only an error close may carry an error",
        );
        let handle = {
            let mut inner = self.lock();
            if let Some(timer) = inner.idle_timer.take() {
                timer.cancel();
            }
            inner.backoff.cancel();
            inner.generation += 1;

            if final_state != PersistentStreamState::Error {
                inner.backoff.reset();
            } else if let Some(err) = &error {
                match err.code {
                    FirestoreErrorCode::ResourceExhausted => {
                        log::warn!("{:?} stream exhausted the backend quota: {err}", self.kind);
                        inner.backoff.reset_to_max();
                    }
                    FirestoreErrorCode::Unauthenticated => self.datastore.invalidate_token(),
                    _ => {}
                }
            }

            if let Some(reader) = inner.reader.take() {
                reader.abort();
            }
            inner.state = final_state;
            inner.handle.take()
        };
        if let Some(handle) = handle {
            handle.close();
        }

        if let Some(events) = self.events.upgrade() {
            if let Err(err) = events.on_close(error).await {
                log::warn!("{:?} stream close handler failed: {err}", self.kind);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DatabaseId;
    use crate::remote::connection::InMemoryConnection;
    use crate::remote::credentials::NoopTokenProvider;
    use crate::remote::serializer::JsonProtoSerializer;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl StreamEvents for Recorder {
        async fn on_open(&self) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("open".into());
            Ok(())
        }

        async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
            self.events.lock().unwrap().push(format!("message {message}"));
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
            let entry = match error {
                Some(err) => format!("close {}", err.code_str()),
                None => "close".to_string(),
            };
            self.events.lock().unwrap().push(entry);
            Ok(())
        }
    }

    fn setup() -> (AsyncQueue, InMemoryConnection, Arc<Recorder>, Arc<PersistentStream>) {
        let queue = AsyncQueue::new();
        let connection = InMemoryConnection::new();
        let datastore = Arc::new(Datastore::new(
            Arc::new(connection.clone()),
            Arc::new(NoopTokenProvider),
            Arc::new(JsonProtoSerializer::new(DatabaseId::default("p"))),
        ));
        let recorder = Arc::new(Recorder::default());
        let events: Weak<dyn StreamEvents> = Arc::downgrade(&(recorder.clone() as Arc<dyn StreamEvents>));
        let stream = PersistentStream::new(
            StreamKind::Listen,
            queue.clone(),
            datastore,
            BackoffSettings::default(),
            Duration::from_secs(60),
            events,
        );
        (queue, connection, recorder, stream)
    }

    async fn start(queue: &AsyncQueue, stream: &Arc<PersistentStream>) {
        let started = Arc::clone(stream);
        queue
            .enqueue(async move {
                started.start();
                Ok(())
            })
            .await
            .unwrap();
    }

    async fn settle(queue: &AsyncQueue) {
        for _ in 0..5 {
            tokio::task::yield_now().await;
            queue.drain().await.unwrap();
        }
    }

    #[tokio::test]
    async fn delivers_messages_and_errors_in_order() {
        let (queue, connection, recorder, stream) = setup();
        start(&queue, &stream).await;
        let server = connection.accept("Listen").await;
        settle(&queue).await;
        assert!(stream.is_open());

        server.send(json!({"n": 1})).unwrap();
        server.fail(FirestoreError::new(FirestoreErrorCode::Unavailable, "down"));
        settle(&queue).await;

        assert_eq!(
            recorder.take(),
            vec!["open", "message {\"n\":1}", "close firestore/unavailable"]
        );
        assert_eq!(stream.state(), PersistentStreamState::Error);
    }

    #[tokio::test]
    async fn repeated_failures_back_off_before_reconnecting() {
        let (queue, connection, recorder, stream) = setup();
        start(&queue, &stream).await;
        let server = connection.accept("Listen").await;
        settle(&queue).await;
        server.fail(FirestoreError::new(FirestoreErrorCode::Unavailable, "down"));
        settle(&queue).await;

        // The first retry is immediate.
        start(&queue, &stream).await;
        let server = connection.accept("Listen").await;
        settle(&queue).await;
        assert!(stream.is_open());
        server.fail(FirestoreError::new(FirestoreErrorCode::Unavailable, "down again"));
        settle(&queue).await;

        start(&queue, &stream).await;
        assert_eq!(stream.state(), PersistentStreamState::Backoff);
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamConnectionBackoff));

        queue
            .run_delayed_operations_early(TimerId::ListenStreamConnectionBackoff)
            .await
            .unwrap();
        let _server = connection.accept("Listen").await;
        settle(&queue).await;
        assert!(stream.is_open());
        assert_eq!(recorder.take().last().map(String::as_str), Some("open"));
    }

    #[tokio::test]
    async fn stop_drops_messages_of_the_old_connection() {
        let (queue, connection, recorder, stream) = setup();
        start(&queue, &stream).await;
        let server = connection.accept("Listen").await;
        settle(&queue).await;

        let stopping = Arc::clone(&stream);
        queue
            .enqueue(async move {
                stopping.stop().await;
                Ok(())
            })
            .await
            .unwrap();
        let _ = server.send(json!({"late": true}));
        settle(&queue).await;

        assert_eq!(recorder.take(), vec!["open", "close"]);
        assert_eq!(stream.state(), PersistentStreamState::Initial);
    }

    #[tokio::test]
    async fn idle_stream_closes_when_the_timer_fires() {
        let (queue, connection, recorder, stream) = setup();
        start(&queue, &stream).await;
        let _server = connection.accept("Listen").await;
        settle(&queue).await;

        let idle = Arc::clone(&stream);
        queue
            .enqueue(async move {
                idle.mark_idle();
                Ok(())
            })
            .await
            .unwrap();
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        queue
            .run_delayed_operations_early(TimerId::ListenStreamIdle)
            .await
            .unwrap();
        settle(&queue).await;
        assert_eq!(recorder.take(), vec!["open", "close"]);
        assert!(!stream.is_started());
    }
}
