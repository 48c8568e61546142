//! Entry point that wires the local store, the remote store, the sync engine
//! and the event manager of one client together.

use std::sync::{Arc, OnceLock, Weak};

use futures::channel::oneshot;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::config::{PersistenceSettings, SyncSettings};
use crate::core::event_manager::{
    EventManager, ListenOptions, QueryListener, SnapshotsInSyncCallback, ViewSnapshotObserver,
};
use crate::core::query::Query;
use crate::core::sync_engine::SyncEngine;
use crate::core::transaction_runner::{TransactionRunner, UpdateFunction};
use crate::core::types::{OnlineState, OnlineStateSource};
use crate::core::view::View;
use crate::core::view_snapshot::ViewSnapshot;
use crate::error::{cancelled, internal_error, unavailable, FirestoreResult};
use crate::local::kv::{KvPersistence, KvPersistenceOptions};
use crate::local::memory::MemoryPersistence;
use crate::local::persistence::PrimaryStateListener;
use crate::local::{IndexFreeQueryEngine, LocalStore, LruScheduler, Persistence};
use crate::model::{DatabaseId, Document, DocumentKey, MaybeDocument, Mutation};
use crate::multi_tab::{BroadcastSharedClientState, MemorySharedClientState, SharedClientState};
use crate::remote::{Connection, Datastore, JsonProtoSerializer, RemoteStore, TokenProvider, User};
use crate::util::{AsyncQueue, MaybeSend};

/// Slot filled once the sync engine exists; callbacks wired up before that
/// point reach the engine through it.
type SyncEngineSlot = Arc<OnceLock<Weak<SyncEngine>>>;

struct Components {
    persistence: Arc<dyn Persistence>,
    local_store: Arc<LocalStore>,
    datastore: Arc<Datastore>,
    remote_store: Arc<RemoteStore>,
    shared_client_state: Arc<dyn SharedClientState>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    lru_scheduler: Option<Arc<LruScheduler>>,
}

/// A client of one database. Every operation runs on the client's
/// [`AsyncQueue`], in the order it was issued.
pub struct FirestoreClient {
    queue: AsyncQueue,
    settings: SyncSettings,
    client_id: String,
    components: Components,
}

impl FirestoreClient {
    pub async fn new(
        database_id: DatabaseId,
        settings: SyncSettings,
        connection: Arc<dyn Connection>,
        token_provider: Arc<dyn TokenProvider>,
        user: User,
        persistence: PersistenceSettings,
    ) -> FirestoreResult<Self> {
        let queue = AsyncQueue::new();
        let client_id = generate_client_id();
        log::debug!("initializing client {client_id} with {persistence:?} persistence");

        let components = {
            let queue = queue.clone();
            let settings = settings.clone();
            let client_id = client_id.clone();
            queue
                .clone()
                .enqueue(async move {
                    initialize_components(
                        queue,
                        database_id,
                        settings,
                        client_id,
                        connection,
                        token_provider,
                        user,
                        persistence,
                    )
                    .await
                })
                .await?
        };

        Ok(Self {
            queue,
            settings,
            client_id,
            components,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.queue
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.components.sync_engine
    }

    pub fn is_terminated(&self) -> bool {
        self.queue.is_shutting_down()
    }

    /// Starts listening to `query`. `observer` receives every snapshot and,
    /// at most once, an error after which the listener is dead.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: ViewSnapshotObserver,
    ) -> FirestoreResult<Arc<QueryListener>> {
        let listener = QueryListener::new(query, options, observer);
        let event_manager = Arc::clone(&self.components.event_manager);
        let registered = Arc::clone(&listener);
        self.queue
            .enqueue(async move { event_manager.listen(registered).await })
            .await?;
        Ok(listener)
    }

    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let event_manager = Arc::clone(&self.components.event_manager);
        let listener = Arc::clone(listener);
        self.queue
            .enqueue(async move { event_manager.unlisten(&listener).await })
            .await
    }

    /// Applies `mutations` locally and resolves once the backend accepted
    /// them. While offline the returned future stays pending.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        let sync_engine = Arc::clone(&self.components.sync_engine);
        self.queue
            .enqueue(async move { sync_engine.write(mutations, sender).await })
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("the write was abandoned before the backend responded"))?
    }

    /// Resolves once every write issued before the call was acknowledged or
    /// rejected by the backend.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (sender, receiver) = oneshot::channel();
        let sync_engine = Arc::clone(&self.components.sync_engine);
        self.queue
            .enqueue(async move {
                sync_engine.register_pending_writes_callback(sender).await;
                Ok(())
            })
            .await?;
        receiver
            .await
            .map_err(|_| cancelled("pending writes callback was abandoned"))?
    }

    /// The cached version of `key`. `None` means the document is known not
    /// to exist; an uncached document is an UNAVAILABLE error.
    pub async fn get_document_from_local_cache(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        let local_store = Arc::clone(&self.components.local_store);
        self.queue
            .enqueue(async move {
                match local_store.read_document(&key)? {
                    Some(MaybeDocument::Document(doc)) => Ok(Some(doc)),
                    Some(MaybeDocument::NoDocument(_)) => Ok(None),
                    _ => Err(unavailable(
                        "Failed to get document from cache. (However, this document may exist on the \
                         server. Run again without setting 'source' in the GetOptions to attempt to \
                         retrieve the document from the server.)",
                    )),
                }
            })
            .await
    }

    /// Runs `query` against the local cache only.
    pub async fn get_documents_from_local_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = Arc::clone(&self.components.local_store);
        self.queue
            .enqueue(async move {
                let result = local_store.execute_query(&query, true)?;
                let mut view = View::new(query, result.remote_keys.clone());
                let changes = view.compute_doc_changes_from_cache(&result.documents, None);
                view.apply_changes(changes, false, None)
                    .snapshot
                    .ok_or_else(|| internal_error("a fresh view always raises a snapshot"))
            })
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let persistence = Arc::clone(&self.components.persistence);
        let remote_store = Arc::clone(&self.components.remote_store);
        self.queue
            .enqueue(async move {
                persistence.set_network_enabled(true)?;
                remote_store.enable_network().await
            })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let persistence = Arc::clone(&self.components.persistence);
        let remote_store = Arc::clone(&self.components.remote_store);
        self.queue
            .enqueue(async move {
                persistence.set_network_enabled(false)?;
                remote_store.disable_network().await
            })
            .await
    }

    /// Runs `update_function` in a transaction, retrying on contention.
    pub async fn transaction<T, F>(&self, update_function: F) -> FirestoreResult<T>
    where
        F: UpdateFunction<T> + 'static,
        T: MaybeSend + 'static,
    {
        TransactionRunner::new(
            self.queue.clone(),
            Arc::clone(&self.components.datastore),
            &self.settings,
            update_function,
        )
        .run()
        .await
    }

    /// Switches to `user`'s pending writes and reconnects with their
    /// credentials.
    pub async fn handle_user_change(&self, user: User) -> FirestoreResult<()> {
        let remote_store = Arc::clone(&self.components.remote_store);
        self.queue
            .enqueue(async move { remote_store.handle_credential_change(user).await })
            .await
    }

    pub async fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()> {
        let persistence = Arc::clone(&self.components.persistence);
        self.queue
            .enqueue(async move { persistence.set_in_foreground(in_foreground) })
            .await
    }

    pub fn add_snapshots_in_sync_listener(&self, callback: SnapshotsInSyncCallback) -> u64 {
        self.components
            .event_manager
            .add_snapshots_in_sync_listener(callback)
    }

    pub fn remove_snapshots_in_sync_listener(&self, id: u64) {
        self.components
            .event_manager
            .remove_snapshots_in_sync_listener(id);
    }

    /// Shuts the client down. Operations issued afterwards fail with
    /// FAILED_PRECONDITION.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.queue.is_shutting_down() {
            return Ok(());
        }
        self.queue.enter_shutdown();
        let lru_scheduler = self.components.lru_scheduler.clone();
        let remote_store = Arc::clone(&self.components.remote_store);
        let shared_client_state = Arc::clone(&self.components.shared_client_state);
        let persistence = Arc::clone(&self.components.persistence);
        self.queue
            .enqueue_even_while_shutting_down(async move {
                if let Some(scheduler) = lru_scheduler {
                    scheduler.stop();
                }
                remote_store.shutdown().await;
                shared_client_state.shutdown();
                persistence.shutdown()
            })
            .await
    }
}

#[allow(clippy::too_many_arguments)]
async fn initialize_components(
    queue: AsyncQueue,
    database_id: DatabaseId,
    settings: SyncSettings,
    client_id: String,
    connection: Arc<dyn Connection>,
    token_provider: Arc<dyn TokenProvider>,
    user: User,
    persistence_settings: PersistenceSettings,
) -> FirestoreResult<Components> {
    let sync_engine_slot: SyncEngineSlot = Arc::default();

    let (persistence, kv_persistence, shared_client_state): (
        Arc<dyn Persistence>,
        Option<Arc<KvPersistence>>,
        Arc<dyn SharedClientState>,
    ) = match persistence_settings {
        PersistenceSettings::Memory => (
            Arc::new(MemoryPersistence::new(client_id.clone())),
            None,
            Arc::new(MemorySharedClientState::new()),
        ),
        PersistenceSettings::Durable {
            persistence_key,
            store,
            broadcast,
            synchronize_tabs,
        } => {
            let options = KvPersistenceOptions::new(
                persistence_key.clone(),
                client_id.clone(),
                database_id.clone(),
                store,
                Arc::clone(&broadcast),
                queue.clone(),
                &settings,
            )
            .with_tab_synchronization(synchronize_tabs);
            let kv = KvPersistence::new(options);
            kv.start()?;
            let shared: Arc<dyn SharedClientState> = if synchronize_tabs {
                Arc::new(BroadcastSharedClientState::new(
                    &persistence_key,
                    client_id.clone(),
                    broadcast,
                    queue.clone(),
                    user.clone(),
                ))
            } else {
                Arc::new(MemorySharedClientState::new())
            };
            (kv.clone(), Some(kv), shared)
        }
    };

    let local_store = Arc::new(LocalStore::new(
        Arc::clone(&persistence),
        IndexFreeQueryEngine::new(),
        &user,
        &settings,
    ));
    local_store.start()?;

    let datastore = Arc::new(Datastore::new(
        connection,
        token_provider,
        Arc::new(JsonProtoSerializer::new(database_id)),
    ));
    let remote_store = RemoteStore::new(
        Arc::clone(&local_store),
        Arc::clone(&datastore),
        queue.clone(),
        online_state_handler(&sync_engine_slot, OnlineStateSource::RemoteStore),
        &settings,
    );

    shared_client_state.set_online_state_handler(online_state_handler(
        &sync_engine_slot,
        OnlineStateSource::SharedClientState,
    ));
    if let Some(kv) = &kv_persistence {
        let receiver = Arc::clone(kv);
        shared_client_state.set_sequence_number_handler(Arc::new(move |sequence_number| {
            receiver.on_remote_sequence_number(sequence_number);
        }));
        let shared = Arc::clone(&shared_client_state);
        kv.set_sequence_number_listener(Arc::new(move |sequence_number| {
            shared.write_sequence_number(sequence_number);
        }));
    }

    let sync_engine = SyncEngine::new(
        Arc::clone(&local_store),
        Arc::clone(&remote_store),
        Arc::clone(&shared_client_state),
        user,
        &settings,
    );
    let _ = sync_engine_slot.set(Arc::downgrade(&sync_engine));
    let event_manager = EventManager::new(Arc::clone(&sync_engine));
    shared_client_state.start()?;

    let lru_scheduler = kv_persistence.as_ref().map(|kv| {
        LruScheduler::new(
            kv.lru_garbage_collector(),
            Arc::clone(&local_store),
            queue.clone(),
            settings.lru_initial_delay,
            settings.lru_regular_delay,
        )
    });

    // The lease state decides whether this client may use the network at
    // all, so it is applied before the remote store starts.
    let is_primary = kv_persistence.as_ref().map_or(true, |kv| kv.is_primary());
    sync_engine.apply_primary_state(is_primary).await?;
    apply_lru_schedule(lru_scheduler.as_ref(), is_primary);
    remote_store.start().await?;
    persistence.set_primary_state_listener(primary_state_listener(
        queue,
        Arc::downgrade(&sync_engine),
        lru_scheduler.clone(),
    ))?;

    Ok(Components {
        persistence,
        local_store,
        datastore,
        remote_store,
        shared_client_state,
        sync_engine,
        event_manager,
        lru_scheduler,
    })
}

fn online_state_handler(
    slot: &SyncEngineSlot,
    source: OnlineStateSource,
) -> Arc<dyn Fn(OnlineState) + Send + Sync> {
    let slot = Arc::clone(slot);
    Arc::new(move |online_state| {
        if let Some(sync_engine) = slot.get().and_then(Weak::upgrade) {
            sync_engine.apply_online_state_change(online_state, source);
        }
    })
}

fn primary_state_listener(
    queue: AsyncQueue,
    sync_engine: Weak<SyncEngine>,
    lru_scheduler: Option<Arc<LruScheduler>>,
) -> PrimaryStateListener {
    Arc::new(move |is_primary| {
        let Some(sync_engine) = sync_engine.upgrade() else {
            return;
        };
        let lru_scheduler = lru_scheduler.clone();
        queue.enqueue_and_forget(async move {
            if let Err(err) = sync_engine.apply_primary_state(is_primary).await {
                log::warn!("failed to apply primary state {is_primary}: {err}");
            }
            apply_lru_schedule(lru_scheduler.as_ref(), is_primary);
        });
    })
}

/// Garbage collection only runs in the primary client.
fn apply_lru_schedule(lru_scheduler: Option<&Arc<LruScheduler>>, is_primary: bool) {
    let Some(scheduler) = lru_scheduler else {
        return;
    };
    if is_primary && !scheduler.is_started() {
        scheduler.start();
    } else if !is_primary {
        scheduler.stop();
    }
}

fn generate_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(20)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirestoreErrorCode;
    use crate::model::{ObjectValue, ResourcePath};
    use crate::remote::{InMemoryConnection, NoopTokenProvider};
    use std::sync::Mutex;

    async fn memory_client(connection: &InMemoryConnection) -> FirestoreClient {
        FirestoreClient::new(
            DatabaseId::default("p"),
            SyncSettings::default(),
            Arc::new(connection.clone()),
            Arc::new(NoopTokenProvider),
            User::unauthenticated(),
            PersistenceSettings::Memory,
        )
        .await
        .unwrap()
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[tokio::test]
    async fn local_cache_reads_see_pending_writes() {
        let connection = InMemoryConnection::new();
        let client = memory_client(&connection).await;
        client.disable_network().await.unwrap();

        let sync_engine = Arc::clone(client.sync_engine());
        let (sender, _receiver) = oneshot::channel();
        client
            .queue()
            .enqueue(async move {
                sync_engine
                    .write(vec![Mutation::set(key("c/1"), ObjectValue::empty())], sender)
                    .await
            })
            .await
            .unwrap();

        let doc = client.get_document_from_local_cache(key("c/1")).await.unwrap();
        assert!(doc.unwrap().has_local_mutations());

        let err = client
            .get_document_from_local_cache(key("c/2"))
            .await
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);

        let snapshot = client
            .get_documents_from_local_cache(Query::new(ResourcePath::from_string("c").unwrap()))
            .await
            .unwrap();
        assert_eq!(snapshot.docs.len(), 1);
        assert!(snapshot.from_cache);
    }

    #[tokio::test]
    async fn listeners_receive_cached_snapshots_when_offline() {
        let connection = InMemoryConnection::new();
        let client = memory_client(&connection).await;
        client.disable_network().await.unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer: ViewSnapshotObserver = Arc::new(move |event: FirestoreResult<ViewSnapshot>| {
            sink.lock().unwrap().push(event);
        });
        let listener = client
            .listen(
                Query::new(ResourcePath::from_string("c").unwrap()),
                ListenOptions::default(),
                observer,
            )
            .await
            .unwrap();

        {
            let events = events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert!(events[0].as_ref().unwrap().from_cache);
        }
        client.unlisten(&listener).await.unwrap();
    }

    #[tokio::test]
    async fn terminated_clients_reject_operations() {
        let connection = InMemoryConnection::new();
        let client = memory_client(&connection).await;
        client.terminate().await.unwrap();
        assert!(client.is_terminated());

        let err = client.enable_network().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }
}
