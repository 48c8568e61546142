use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{Mutation, MutationResult, SnapshotVersion};
use crate::remote::datastore::Datastore;
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::stream::persistent::{PersistentStream, StreamEvents, StreamKind};
use crate::util::assert::hard_assert;
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffSettings;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamListener: Send + Sync {
    async fn on_write_stream_open(&self) -> FirestoreResult<()>;
    async fn on_write_handshake_complete(&self) -> FirestoreResult<()>;
    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()>;
    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Default)]
struct WriteState {
    handshake_complete: bool,
    /// Echoed back on every request; survives reconnects.
    last_stream_token: Vec<u8>,
}

/// The write stream. After opening, the client sends a handshake and waits
/// for the server's first response before sending mutations.
pub struct WriteStream {
    stream: Arc<PersistentStream>,
    serializer: Arc<JsonProtoSerializer>,
    listener: Weak<dyn WriteStreamListener>,
    state: Mutex<WriteState>,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        datastore: Arc<Datastore>,
        backoff: BackoffSettings,
        idle_timeout: Duration,
        listener: Weak<dyn WriteStreamListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<WriteStream>| {
            let events: Weak<dyn StreamEvents> = me.clone();
            let serializer = Arc::clone(datastore.serializer());
            Self {
                stream: PersistentStream::new(
                    StreamKind::Write,
                    queue,
                    datastore,
                    backoff,
                    idle_timeout,
                    events,
                ),
                serializer,
                listener,
                state: Mutex::new(WriteState::default()),
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, WriteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start(&self) {
        self.lock().handshake_complete = false;
        self.stream.start();
    }

    pub async fn stop(&self) {
        self.stream.stop().await;
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    pub fn handshake_complete(&self) -> bool {
        self.lock().handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        self.lock().last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        self.lock().last_stream_token = token;
    }

    /// Sends the initial request of a freshly opened stream.
    pub fn write_handshake(&self) -> FirestoreResult<()> {
        hard_assert(self.is_open(), "writing handshake requires an opened stream");
        hard_assert(!self.handshake_complete(), "handshake already completed");
        self.stream.send(json!({ "database": self.serializer.database_name() }))
    }

    pub fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        hard_assert(self.is_open(), "writing mutations requires an opened stream");
        hard_assert(
            self.handshake_complete(),
            "handshake must be complete before writing mutations",
        );
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let token = self.serializer.encode_bytes(&self.last_stream_token());
        self.stream.send(json!({ "streamToken": token, "writes": writes }))
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamEvents for WriteStream {
    async fn on_open(&self) -> FirestoreResult<()> {
        match self.listener.upgrade() {
            Some(listener) => listener.on_write_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let token = message
            .get("streamToken")
            .and_then(JsonValue::as_str)
            .map(|token| self.serializer.decode_bytes(token))
            .transpose()?;
        let was_handshake = {
            let mut state = self.lock();
            if let Some(token) = token {
                state.last_stream_token = token;
            }
            let was_handshake = !state.handshake_complete;
            state.handshake_complete = true;
            was_handshake
        };
        let Some(listener) = self.listener.upgrade() else {
            return Ok(());
        };

        if was_handshake {
            let has_results = message
                .get("writeResults")
                .and_then(JsonValue::as_array)
                .map_or(false, |results| !results.is_empty());
            hard_assert(!has_results, "got mutation results for the handshake");
            return listener.on_write_handshake_complete().await;
        }

        let commit_version = self.serializer.decode_version(message.get("commitTime"))?;
        let results = self
            .serializer
            .decode_write_results(message.get("writeResults"), commit_version)?;
        listener.on_mutation_result(commit_version, results).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.listener.upgrade() {
            Some(listener) => listener.on_write_stream_close(error).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatabaseId, DocumentKey, ObjectValue};
    use crate::remote::connection::InMemoryConnection;
    use crate::remote::credentials::NoopTokenProvider;

    #[derive(Default)]
    struct Listener {
        events: Mutex<Vec<String>>,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl WriteStreamListener for Listener {
        async fn on_write_stream_open(&self) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("open".into());
            Ok(())
        }

        async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("handshake".into());
            Ok(())
        }

        async fn on_mutation_result(
            &self,
            _commit_version: SnapshotVersion,
            results: Vec<MutationResult>,
        ) -> FirestoreResult<()> {
            self.events.lock().unwrap().push(format!("results {}", results.len()));
            Ok(())
        }

        async fn on_write_stream_close(&self, _error: Option<FirestoreError>) -> FirestoreResult<()> {
            self.events.lock().unwrap().push("close".into());
            Ok(())
        }
    }

    async fn settle(queue: &AsyncQueue) {
        for _ in 0..3 {
            tokio::task::yield_now().await;
            queue.drain().await.unwrap();
        }
    }

    #[tokio::test]
    async fn handshake_precedes_mutations_and_tokens_are_echoed() {
        let queue = AsyncQueue::new();
        let connection = InMemoryConnection::new();
        let datastore = Arc::new(Datastore::new(
            Arc::new(connection.clone()),
            Arc::new(NoopTokenProvider),
            Arc::new(JsonProtoSerializer::new(DatabaseId::default("p"))),
        ));
        let listener = Arc::new(Listener::default());
        let weak: Weak<dyn WriteStreamListener> =
            Arc::downgrade(&(listener.clone() as Arc<dyn WriteStreamListener>));
        let write = WriteStream::new(
            queue.clone(),
            Arc::clone(&datastore),
            BackoffSettings::default(),
            Duration::from_secs(60),
            weak,
        );

        let starting = Arc::clone(&write);
        queue
            .enqueue(async move {
                starting.start();
                Ok(())
            })
            .await
            .unwrap();
        let server = connection.accept("Write").await;
        settle(&queue).await;
        write.write_handshake().unwrap();
        assert_eq!(
            server.receive().await.unwrap(),
            json!({ "database": "projects/p/databases/(default)" })
        );

        let token = datastore.serializer().encode_bytes(b"t1");
        server.send(json!({ "streamToken": token })).unwrap();
        settle(&queue).await;
        assert!(write.handshake_complete());
        assert_eq!(write.last_stream_token(), b"t1".to_vec());

        let key = DocumentKey::from_string("c/1").unwrap();
        write
            .write_mutations(&[Mutation::set(key, ObjectValue::empty())])
            .unwrap();
        let request = server.receive().await.unwrap();
        assert_eq!(request["streamToken"], json!(token));
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));

        server
            .send(json!({
                "streamToken": datastore.serializer().encode_bytes(b"t2"),
                "commitTime": "2024-01-01T00:00:01Z",
                "writeResults": [{ "updateTime": "2024-01-01T00:00:01Z" }]
            }))
            .unwrap();
        settle(&queue).await;
        assert_eq!(
            *listener.events.lock().unwrap(),
            vec!["open", "handshake", "results 1"]
        );
        assert_eq!(write.last_stream_token(), b"t2".to_vec());
    }
}
