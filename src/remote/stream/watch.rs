use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::error::{FirestoreError, FirestoreResult};
use crate::local::TargetData;
use crate::model::{SnapshotVersion, TargetId};
use crate::remote::datastore::Datastore;
use crate::remote::serializer::JsonProtoSerializer;
use crate::remote::stream::persistent::{PersistentStream, StreamEvents, StreamKind};
use crate::remote::watch_change::WatchChange;
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffSettings;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WatchStreamListener: Send + Sync {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()>;
    async fn on_watch_stream_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()>;
    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// The listen stream: adds and removes targets and reports watch changes.
pub struct WatchStream {
    stream: Arc<PersistentStream>,
    serializer: Arc<JsonProtoSerializer>,
    listener: Weak<dyn WatchStreamListener>,
}

impl WatchStream {
    pub fn new(
        queue: AsyncQueue,
        datastore: Arc<Datastore>,
        backoff: BackoffSettings,
        idle_timeout: Duration,
        listener: Weak<dyn WatchStreamListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<WatchStream>| {
            let events: Weak<dyn StreamEvents> = me.clone();
            let serializer = Arc::clone(datastore.serializer());
            Self {
                stream: PersistentStream::new(
                    StreamKind::Listen,
                    queue,
                    datastore,
                    backoff,
                    idle_timeout,
                    events,
                ),
                serializer,
                listener,
            }
        })
    }

    pub fn stream(&self) -> &Arc<PersistentStream> {
        &self.stream
    }

    pub fn start(&self) {
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

    /// Registers `target_data` with the backend, resuming from its token.
    pub fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let mut request = JsonMap::new();
        request.insert("database".into(), json!(self.serializer.database_name()));
        request.insert("addTarget".into(), self.serializer.encode_target(target_data));
        if let Some(labels) = self.serializer.encode_listen_request_labels(target_data.purpose) {
            request.insert("labels".into(), labels);
        }
        log::debug!("watching target {}", target_data.target_id);
        self.stream.send(JsonValue::Object(request))
    }

    pub fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        log::debug!("unwatching target {target_id}");
        self.stream.send(json!({
            "database": self.serializer.database_name(),
            "removeTarget": target_id,
        }))
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamEvents for WatchStream {
    async fn on_open(&self) -> FirestoreResult<()> {
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_stream_open().await,
            None => Ok(()),
        }
    }

    async fn on_message(&self, message: JsonValue) -> FirestoreResult<()> {
        let change = self.serializer.decode_watch_change(&message)?;
        let version = self.serializer.version_from_listen_response(&message)?;
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_stream_change(change, version).await,
            None => Ok(()),
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        match self.listener.upgrade() {
            Some(listener) => listener.on_watch_stream_close(error).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::TargetPurpose;
    use crate::model::{DatabaseId, ResourcePath};
    use crate::remote::connection::InMemoryConnection;
    use crate::remote::credentials::NoopTokenProvider;
    use crate::remote::watch_change::WatchTargetChangeState;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Listener {
        changes: Mutex<Vec<(WatchChange, SnapshotVersion)>>,
        opened: Mutex<bool>,
    }

    #[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
    #[cfg_attr(not(target_arch = "wasm32"), async_trait)]
    impl WatchStreamListener for Listener {
        async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
            *self.opened.lock().unwrap() = true;
            Ok(())
        }

        async fn on_watch_stream_change(
            &self,
            change: WatchChange,
            snapshot_version: SnapshotVersion,
        ) -> FirestoreResult<()> {
            self.changes.lock().unwrap().push((change, snapshot_version));
            Ok(())
        }

        async fn on_watch_stream_close(&self, _error: Option<FirestoreError>) -> FirestoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn watch_requests_carry_target_and_labels() {
        let queue = AsyncQueue::new();
        let connection = InMemoryConnection::new();
        let datastore = Arc::new(Datastore::new(
            Arc::new(connection.clone()),
            Arc::new(NoopTokenProvider),
            Arc::new(JsonProtoSerializer::new(DatabaseId::default("p"))),
        ));
        let listener = Arc::new(Listener::default());
        let weak: Weak<dyn WatchStreamListener> =
            Arc::downgrade(&(listener.clone() as Arc<dyn WatchStreamListener>));
        let watch = WatchStream::new(
            queue.clone(),
            datastore,
            BackoffSettings::default(),
            Duration::from_secs(60),
            weak,
        );

        let starting = Arc::clone(&watch);
        queue
            .enqueue(async move {
                starting.start();
                Ok(())
            })
            .await
            .unwrap();
        let server = connection.accept("Listen").await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
            queue.drain().await.unwrap();
        }
        assert!(*listener.opened.lock().unwrap());

        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, 4, TargetPurpose::ExistenceFilterMismatch, 1);
        watch.watch(&data).unwrap();
        let request = server.receive().await.unwrap();
        assert_eq!(request["addTarget"]["targetId"], json!(4));
        assert_eq!(request["labels"]["goog-listen-tags"], json!("existence-filter-mismatch"));

        watch.unwatch(4).unwrap();
        assert_eq!(server.receive().await.unwrap()["removeTarget"], json!(4));

        server
            .send(json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [4] } }))
            .unwrap();
        for _ in 0..3 {
            tokio::task::yield_now().await;
            queue.drain().await.unwrap();
        }
        let changes = listener.changes.lock().unwrap();
        let (WatchChange::Target(change), version) = &changes[0] else {
            panic!("expected a target change");
        };
        assert_eq!(change.state, WatchTargetChangeState::Current);
        assert!(version.is_min());
    }
}
