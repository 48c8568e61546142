//! Durable persistence shared by several tabs.
//!
//! At most one tab holds the primary lease. Each tab refreshes its client
//! metadata row periodically and, while doing so, decides whether it should
//! acquire, extend or release the lease. Only transactions of the lease
//! holder may run in [`TransactionMode::ReadWritePrimary`].

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::{LruParams, SyncSettings};
use crate::error::{failed_precondition, internal_error, FirestoreResult};
use crate::local::kv::index_manager::KvIndexManager;
use crate::local::kv::key_builder::table_range;
use crate::local::kv::local_serializer::LocalSerializer;
use crate::local::kv::lru_delegate::KvLruDelegate;
use crate::local::kv::mutation_queue::KvMutationQueue;
use crate::local::kv::remote_document_cache::KvRemoteDocumentCache;
use crate::local::kv::schema::{
    client_metadata_key, collect_records, owner_key, read_record, schema_version_key,
    write_record, ClientMetadataRecord, PrimaryLeaseRecord, CLIENT_METADATA, SCHEMA_VERSION,
};
use crate::local::kv::target_cache::KvTargetCache;
use crate::local::kv::{KvStore, KvTransaction};
use crate::local::lru::LruGarbageCollector;
use crate::local::persistence::{
    primary_lease_lost, IndexManager, MutationQueue, Persistence, PersistenceTransaction,
    PrimaryStateListener, ReferenceDelegate, RemoteDocumentCache, TargetCache, TransactionMode,
    PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG,
};
use crate::model::{DatabaseId, ListenSequenceNumber};
use crate::multi_tab::BroadcastChannel;
use crate::platform::runtime::now_millis;
use crate::remote::credentials::User;
use crate::remote::serializer::JsonProtoSerializer;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::box_future;

pub type SequenceNumberListener = Arc<dyn Fn(ListenSequenceNumber) + Send + Sync>;

/// Everything a [`KvPersistence`] needs from its environment.
#[derive(Clone)]
pub struct KvPersistenceOptions {
    /// Namespaces the zombie markers of this database in the broadcast
    /// storage.
    pub persistence_key: String,
    pub client_id: String,
    pub database_id: DatabaseId,
    /// Whether other tabs may use the store while this one holds the lease.
    pub allow_tab_synchronization: bool,
    pub store: Arc<dyn KvStore>,
    pub broadcast: Arc<dyn BroadcastChannel>,
    pub queue: AsyncQueue,
    pub lru: LruParams,
    pub client_metadata_refresh_interval: Duration,
    pub max_primary_eligible_age: Duration,
    pub max_client_age: Duration,
}

impl KvPersistenceOptions {
    pub fn new(
        persistence_key: impl Into<String>,
        client_id: impl Into<String>,
        database_id: DatabaseId,
        store: Arc<dyn KvStore>,
        broadcast: Arc<dyn BroadcastChannel>,
        queue: AsyncQueue,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            persistence_key: persistence_key.into(),
            client_id: client_id.into(),
            database_id,
            allow_tab_synchronization: true,
            store,
            broadcast,
            queue,
            lru: settings.lru,
            client_metadata_refresh_interval: settings.client_metadata_refresh_interval,
            max_primary_eligible_age: settings.max_primary_eligible_age,
            max_client_age: settings.max_client_age,
        }
    }

    pub fn with_tab_synchronization(mut self, allow: bool) -> Self {
        self.allow_tab_synchronization = allow;
        self
    }
}

pub struct KvPersistence {
    options: KvPersistenceOptions,
    serializer: LocalSerializer,
    index_manager: Arc<KvIndexManager>,
    remote_document_cache: Arc<KvRemoteDocumentCache>,
    target_cache: Arc<KvTargetCache>,
    reference_delegate: Arc<KvLruDelegate>,
    lru_collector: Arc<LruGarbageCollector>,
    started: AtomicBool,
    is_primary: AtomicBool,
    network_enabled: AtomicBool,
    in_foreground: AtomicBool,
    last_sequence_number: AtomicI64,
    last_client_gc_ms: AtomicI64,
    primary_state_listener: Mutex<Option<PrimaryStateListener>>,
    sequence_number_listener: Mutex<Option<SequenceNumberListener>>,
    refresh_task: Mutex<Option<DelayedOperation>>,
}

impl KvPersistence {
    pub fn new(options: KvPersistenceOptions) -> Arc<Self> {
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(options.database_id.clone()));
        let index_manager = Arc::new(KvIndexManager::new());
        let remote_document_cache = Arc::new(KvRemoteDocumentCache::new(
            serializer.clone(),
            index_manager.clone(),
        ));
        let target_cache = Arc::new(KvTargetCache::new(serializer.clone()));
        let reference_delegate = Arc::new(KvLruDelegate::new(
            target_cache.clone(),
            remote_document_cache.clone(),
        ));
        let lru_collector = Arc::new(LruGarbageCollector::new(
            reference_delegate.clone(),
            options.lru,
        ));
        Arc::new(Self {
            options,
            serializer,
            index_manager,
            remote_document_cache,
            target_cache,
            reference_delegate,
            lru_collector,
            started: AtomicBool::new(false),
            is_primary: AtomicBool::new(false),
            network_enabled: AtomicBool::new(true),
            in_foreground: AtomicBool::new(false),
            last_sequence_number: AtomicI64::new(0),
            last_client_gc_ms: AtomicI64::new(i64::MIN),
            primary_state_listener: Mutex::new(None),
            sequence_number_listener: Mutex::new(None),
            refresh_task: Mutex::new(None),
        })
    }

    /// Opens the store, joins the lease arbitration and starts the metadata
    /// refresh timer.
    ///
    /// Fails with FAILED_PRECONDITION when another tab holds the lease and
    /// tab synchronization is disabled on either side.
    pub fn start(self: &Arc<Self>) -> FirestoreResult<()> {
        self.ensure_schema()?;
        let highest = self.with_store(true, |store| {
            Ok(self.target_cache.global(store)?.highest_listen_sequence_number)
        })?;
        self.last_sequence_number.store(highest, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);

        let is_primary = match self.update_client_metadata_and_try_become_primary() {
            Ok(is_primary) => is_primary,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        if !is_primary && !self.options.allow_tab_synchronization {
            self.started.store(false, Ordering::SeqCst);
            return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
        }
        self.schedule_client_metadata_refresh();
        Ok(())
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn lru_garbage_collector(&self) -> Arc<LruGarbageCollector> {
        Arc::clone(&self.lru_collector)
    }

    pub fn serializer(&self) -> &LocalSerializer {
        &self.serializer
    }

    /// Notified with every sequence number handed out, so other tabs can
    /// be told about it.
    pub fn set_sequence_number_listener(&self, listener: SequenceNumberListener) {
        if let Ok(mut slot) = self.sequence_number_listener.lock() {
            *slot = Some(listener);
        }
    }

    /// Raises the local sequence counter to a value another tab used.
    pub fn on_remote_sequence_number(&self, sequence_number: ListenSequenceNumber) {
        self.last_sequence_number
            .fetch_max(sequence_number, Ordering::SeqCst);
    }

    /// Records synchronously that this tab is going away without a clean
    /// shutdown, so other tabs stop waiting for its lease to expire.
    pub fn mark_client_zombied(&self) {
        let key = self.zombie_key(&self.options.client_id);
        if let Err(err) = self.options.broadcast.set(&key, &now_millis().to_string()) {
            log::warn!("failed to mark client as zombied: {err}");
        }
    }

    fn remove_client_zombied_entry(&self) {
        self.options
            .broadcast
            .remove(&self.zombie_key(&self.options.client_id));
    }

    fn zombie_key(&self, client_id: &str) -> String {
        format!(
            "firestore_zombie_{}_{}",
            self.options.persistence_key, client_id
        )
    }

    fn is_client_zombied(&self, client_id: &str) -> bool {
        self.options.broadcast.get(&self.zombie_key(client_id)).is_some()
    }

    fn is_within_age(&self, timestamp_ms: i64, max_age: Duration) -> bool {
        let now = now_millis();
        let min_acceptable = now - max_age.as_millis() as i64;
        if timestamp_ms < min_acceptable {
            return false;
        }
        if timestamp_ms > now {
            log::error!("detected an update time that is in the future: {timestamp_ms} > {now}");
            return false;
        }
        true
    }

    fn filter_active_clients(
        &self,
        clients: Vec<ClientMetadataRecord>,
        max_age: Duration,
    ) -> Vec<ClientMetadataRecord> {
        clients
            .into_iter()
            .filter(|client| {
                self.is_within_age(client.update_time_ms, max_age)
                    && !self.is_client_zombied(&client.client_id)
            })
            .collect()
    }

    fn client_metadata(&self, store: &dyn KvTransaction) -> FirestoreResult<Vec<ClientMetadataRecord>> {
        collect_records(store, &table_range(CLIENT_METADATA))
    }

    fn ensure_schema(&self) -> FirestoreResult<()> {
        self.with_store(false, |store| {
            let version: Option<u32> = read_record(store, &schema_version_key())?;
            match version {
                Some(version) if version > SCHEMA_VERSION => Err(failed_precondition(format!(
                    "Persisted schema version {version} is newer than the supported version \
                     {SCHEMA_VERSION}"
                ))),
                Some(version) if version == SCHEMA_VERSION => Ok(()),
                _ => write_record(store, &schema_version_key(), &SCHEMA_VERSION),
            }
        })
    }

    /// Runs `operation` on a raw store transaction outside of lease checks.
    fn with_store<T>(
        &self,
        read_only: bool,
        operation: impl FnOnce(&dyn KvTransaction) -> FirestoreResult<T>,
    ) -> FirestoreResult<T> {
        let txn = self.options.store.begin(read_only)?;
        match operation(txn.as_ref()) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }

    fn next_sequence_number(&self) -> ListenSequenceNumber {
        let next = self.last_sequence_number.fetch_add(1, Ordering::SeqCst) + 1;
        let listener = self
            .sequence_number_listener
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(listener) = listener {
            listener(next);
        }
        next
    }

    fn is_local_client(&self, lease: Option<&PrimaryLeaseRecord>) -> bool {
        lease.is_some_and(|lease| lease.owner_id == self.options.client_id)
    }

    fn verify_primary_lease(&self, store: &dyn KvTransaction) -> FirestoreResult<bool> {
        let lease: Option<PrimaryLeaseRecord> = read_record(store, &owner_key())?;
        Ok(self.is_local_client(lease.as_ref()))
    }

    fn acquire_or_extend_primary_lease(&self, store: &dyn KvTransaction) -> FirestoreResult<()> {
        write_record(
            store,
            &owner_key(),
            &PrimaryLeaseRecord {
                owner_id: self.options.client_id.clone(),
                allow_tab_synchronization: self.options.allow_tab_synchronization,
                lease_timestamp_ms: now_millis(),
            },
        )
    }

    fn release_primary_lease_if_held(&self, store: &dyn KvTransaction) -> FirestoreResult<()> {
        if self.verify_primary_lease(store)? {
            log::debug!("releasing primary lease");
            store.delete(&owner_key())?;
        }
        Ok(())
    }

    /// Whether this tab should hold the lease, given the current lease and
    /// the metadata of every other tab.
    fn can_act_as_primary(&self, store: &dyn KvTransaction) -> FirestoreResult<bool> {
        let lease: Option<PrimaryLeaseRecord> = read_record(store, &owner_key())?;
        let network_enabled = self.network_enabled.load(Ordering::SeqCst);
        let in_foreground = self.in_foreground.load(Ordering::SeqCst);

        if let Some(current) = &lease {
            let lease_is_valid = self
                .is_within_age(current.lease_timestamp_ms, self.options.max_primary_eligible_age)
                && !self.is_client_zombied(&current.owner_id);
            if lease_is_valid {
                if self.is_local_client(Some(current)) {
                    if network_enabled {
                        return Ok(true);
                    }
                } else {
                    if !current.allow_tab_synchronization {
                        return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
                    }
                    return Ok(false);
                }
            }
        }

        if network_enabled && in_foreground {
            return Ok(true);
        }

        let others = self.filter_active_clients(
            self.client_metadata(store)?,
            self.options.max_primary_eligible_age,
        );
        let preferred = others.iter().find(|other| {
            if other.client_id == self.options.client_id {
                return false;
            }
            let better_network = !network_enabled && other.network_enabled;
            let better_visibility = !in_foreground && other.in_foreground;
            let same_network = network_enabled == other.network_enabled;
            better_network || (better_visibility && same_network)
        });
        Ok(preferred.is_none())
    }

    /// Writes this tab's metadata row and settles its lease state. Returns
    /// whether the tab is primary afterwards.
    pub fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<bool> {
        let was_primary = self.is_primary();
        let result = self.with_store(false, |store| {
            write_record(
                store,
                &client_metadata_key(&self.options.client_id),
                &ClientMetadataRecord {
                    client_id: self.options.client_id.clone(),
                    update_time_ms: now_millis(),
                    network_enabled: self.network_enabled.load(Ordering::SeqCst),
                    in_foreground: self.in_foreground.load(Ordering::SeqCst),
                },
            )?;
            if was_primary && !self.verify_primary_lease(store)? {
                log::debug!("primary lease was taken over by another tab");
                return Ok(false);
            }
            let can_act = self.can_act_as_primary(store)?;
            if can_act {
                self.acquire_or_extend_primary_lease(store)?;
            } else if was_primary {
                self.release_primary_lease_if_held(store)?;
            }
            Ok(can_act)
        });

        let is_primary = match result {
            Ok(is_primary) => is_primary,
            Err(err) if err.is_storage_failure() => {
                log::debug!("failed to extend the primary lease: {err}");
                false
            }
            Err(err) => return Err(err),
        };
        if is_primary != was_primary {
            log::debug!(
                "client {} {} the primary lease",
                self.options.client_id,
                if is_primary { "acquired" } else { "lost" }
            );
            self.set_primary(is_primary);
        }
        Ok(is_primary)
    }

    fn set_primary(&self, is_primary: bool) {
        self.is_primary.store(is_primary, Ordering::SeqCst);
        let listener = self
            .primary_state_listener
            .lock()
            .ok()
            .and_then(|slot| slot.clone());
        if let Some(listener) = listener {
            listener(is_primary);
        }
    }

    /// Deletes the metadata of tabs that have been gone for longer than the
    /// maximum client age. Runs at most once per that age, on the primary.
    fn maybe_garbage_collect_multi_client_state(&self) -> FirestoreResult<()> {
        let last_gc = self.last_client_gc_ms.load(Ordering::SeqCst);
        if !self.is_primary() || self.is_within_age(last_gc, self.options.max_client_age) {
            return Ok(());
        }
        let removed = self.with_store(false, |store| {
            if !self.verify_primary_lease(store)? {
                return Ok(Vec::new());
            }
            let mut removed = Vec::new();
            for client in self.client_metadata(store)? {
                if !self.is_within_age(client.update_time_ms, self.options.max_client_age) {
                    store.delete(&client_metadata_key(&client.client_id))?;
                    removed.push(client.client_id);
                }
            }
            Ok(removed)
        })?;
        for client_id in removed {
            log::debug!("garbage collected metadata of inactive client {client_id}");
            self.options.broadcast.remove(&self.zombie_key(&client_id));
        }
        self.last_client_gc_ms.store(now_millis(), Ordering::SeqCst);
        Ok(())
    }

    fn schedule_client_metadata_refresh(self: &Arc<Self>) {
        let persistence = Arc::clone(self);
        let task = self.options.queue.enqueue_after_delay(
            TimerId::ClientMetadataRefresh,
            self.options.client_metadata_refresh_interval,
            move || {
                box_future(async move {
                    if !persistence.started() {
                        return;
                    }
                    if let Err(err) = persistence
                        .update_client_metadata_and_try_become_primary()
                        .and_then(|_| persistence.maybe_garbage_collect_multi_client_state())
                    {
                        log::warn!("client metadata refresh failed: {err}");
                    }
                    persistence.schedule_client_metadata_refresh();
                })
            },
        );
        if let Ok(mut slot) = self.refresh_task.lock() {
            *slot = Some(task);
        }
    }
}

impl Persistence for KvPersistence {
    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn shutdown(&self) -> FirestoreResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.mark_client_zombied();
        if let Ok(mut task) = self.refresh_task.lock() {
            if let Some(task) = task.take() {
                task.cancel();
            }
        }
        self.with_store(false, |store| {
            self.release_primary_lease_if_held(store)?;
            store.delete(&client_metadata_key(&self.options.client_id))
        })?;
        self.is_primary.store(false, Ordering::SeqCst);
        self.remove_client_zombied_entry();
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.options.client_id
    }

    fn get_mutation_queue(&self, user: &User) -> Arc<dyn MutationQueue> {
        Arc::new(KvMutationQueue::new(
            user.to_key(),
            self.serializer.clone(),
            self.index_manager.clone(),
        ))
    }

    fn get_target_cache(&self) -> Arc<dyn TargetCache> {
        self.target_cache.clone()
    }

    fn get_remote_document_cache(&self) -> Arc<dyn RemoteDocumentCache> {
        self.remote_document_cache.clone()
    }

    fn get_index_manager(&self) -> Arc<dyn IndexManager> {
        self.index_manager.clone()
    }

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate> {
        self.reference_delegate.clone()
    }

    fn set_primary_state_listener(&self, listener: PrimaryStateListener) -> FirestoreResult<()> {
        if let Ok(mut slot) = self.primary_state_listener.lock() {
            *slot = Some(Arc::clone(&listener));
        }
        listener(self.is_primary());
        Ok(())
    }

    fn set_network_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        if self.network_enabled.swap(enabled, Ordering::SeqCst) != enabled {
            self.update_client_metadata_and_try_become_primary()?;
        }
        Ok(())
    }

    fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()> {
        if self.in_foreground.swap(in_foreground, Ordering::SeqCst) != in_foreground {
            self.update_client_metadata_and_try_become_primary()?;
        }
        Ok(())
    }

    /// Ids of tabs that refreshed their metadata recently and are not
    /// zombied.
    fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        let clients = self.with_store(true, |store| self.client_metadata(store))?;
        Ok(self
            .filter_active_clients(clients, self.options.max_client_age)
            .into_iter()
            .map(|client| client.client_id)
            .collect())
    }

    fn run_transaction_dyn(
        &self,
        action: &str,
        mode: TransactionMode,
        operation: &mut dyn FnMut(&PersistenceTransaction) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        if !self.started() {
            return Err(failed_precondition("The client has already been terminated."));
        }
        log::debug!("starting transaction: {action}");
        let kv = self.options.store.begin(mode.is_read_only())?;
        let txn = PersistenceTransaction::new(action, mode, self.next_sequence_number(), Some(kv));

        self.reference_delegate.on_transaction_started();
        let result = self
            .run_in_mode(&txn, action, mode, operation)
            .and_then(|()| self.reference_delegate.on_transaction_committed(&txn));

        match result {
            Ok(()) => txn.commit(),
            Err(err) => {
                txn.abort();
                Err(err)
            }
        }
    }
}

impl KvPersistence {
    fn run_in_mode(
        &self,
        txn: &PersistenceTransaction,
        action: &str,
        mode: TransactionMode,
        operation: &mut dyn FnMut(&PersistenceTransaction) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        match mode {
            TransactionMode::ReadWritePrimary => {
                if !self.verify_primary_lease(txn.store()?)? {
                    log::error!("failed to obtain primary lease for action '{action}'");
                    self.on_primary_lease_lost()?;
                    return Err(primary_lease_lost());
                }
                operation(txn)?;
                self.acquire_or_extend_primary_lease(txn.store()?)
            }
            TransactionMode::ReadWrite => {
                self.verify_allow_tab_synchronization(txn.store()?)?;
                operation(txn)
            }
            TransactionMode::ReadOnly => operation(txn),
        }
    }

    /// Demotes this tab and tells the listener from a fresh queue turn, since
    /// the failing transaction usually runs inside a queue operation.
    fn on_primary_lease_lost(&self) -> FirestoreResult<()> {
        if !self.is_primary.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = self
            .primary_state_listener
            .lock()
            .map_err(|_| internal_error("primary listener lock poisoned"))?
            .clone();
        if let Some(listener) = listener {
            self.options.queue.enqueue_and_forget(async move {
                listener(false);
            });
        }
        Ok(())
    }

    fn verify_allow_tab_synchronization(&self, store: &dyn KvTransaction) -> FirestoreResult<()> {
        let lease: Option<PrimaryLeaseRecord> = read_record(store, &owner_key())?;
        let Some(current) = lease else {
            return Ok(());
        };
        let lease_is_valid = self
            .is_within_age(current.lease_timestamp_ms, self.options.max_primary_eligible_age)
            && !self.is_client_zombied(&current.owner_id);
        if lease_is_valid
            && !self.is_local_client(Some(&current))
            && (!self.options.allow_tab_synchronization || !current.allow_tab_synchronization)
        {
            return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::kv::MemoryKvStore;
    use crate::local::persistence::{is_primary_lease_lost, run_transaction};
    use crate::multi_tab::InMemoryBroadcastHub;

    fn options(
        client_id: &str,
        store: &MemoryKvStore,
        hub: &InMemoryBroadcastHub,
        queue: &AsyncQueue,
    ) -> KvPersistenceOptions {
        KvPersistenceOptions::new(
            "app",
            client_id,
            DatabaseId::default("p"),
            Arc::new(store.clone()),
            hub.channel(),
            queue.clone(),
            &SyncSettings::default(),
        )
    }

    #[tokio::test]
    async fn first_tab_becomes_primary_and_second_waits() {
        let store = MemoryKvStore::new();
        let hub = InMemoryBroadcastHub::new();
        let queue = AsyncQueue::new();
        let first = KvPersistence::new(options("tab-1", &store, &hub, &queue));
        let second = KvPersistence::new(options("tab-2", &store, &hub, &queue));
        first.start().unwrap();
        second.start().unwrap();
        assert!(first.is_primary());
        assert!(!second.is_primary());

        let err = run_transaction(
            second.as_ref(),
            "primary only",
            TransactionMode::ReadWritePrimary,
            |_| Ok(()),
        )
        .unwrap_err();
        assert!(is_primary_lease_lost(&err));
    }

    #[tokio::test]
    async fn exclusive_lease_rejects_other_tabs() {
        let store = MemoryKvStore::new();
        let hub = InMemoryBroadcastHub::new();
        let queue = AsyncQueue::new();
        let owner = KvPersistence::new(
            options("tab-1", &store, &hub, &queue).with_tab_synchronization(false),
        );
        owner.start().unwrap();
        let other = KvPersistence::new(options("tab-2", &store, &hub, &queue));
        let err = other.start().unwrap_err();
        assert_eq!(err.code, crate::error::FirestoreErrorCode::FailedPrecondition);
        assert_eq!(err.message(), PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG);
    }

    #[tokio::test]
    async fn zombied_lease_holder_is_replaced() {
        let store = MemoryKvStore::new();
        let hub = InMemoryBroadcastHub::new();
        let queue = AsyncQueue::new();
        let first = KvPersistence::new(options("tab-1", &store, &hub, &queue));
        let second = KvPersistence::new(options("tab-2", &store, &hub, &queue));
        first.start().unwrap();
        second.start().unwrap();
        assert!(!second.is_primary());

        first.mark_client_zombied();
        assert!(second.update_client_metadata_and_try_become_primary().unwrap());
        assert!(!first.update_client_metadata_and_try_become_primary().unwrap());
    }

    #[tokio::test]
    async fn shutdown_releases_the_lease() {
        let store = MemoryKvStore::new();
        let hub = InMemoryBroadcastHub::new();
        let queue = AsyncQueue::new();
        let first = KvPersistence::new(options("tab-1", &store, &hub, &queue));
        let second = KvPersistence::new(options("tab-2", &store, &hub, &queue));
        first.start().unwrap();
        second.start().unwrap();
        first.shutdown().unwrap();
        assert!(second.update_client_metadata_and_try_become_primary().unwrap());
        assert_eq!(second.get_active_clients().unwrap(), vec!["tab-2".to_string()]);
    }

    #[tokio::test]
    async fn primary_transactions_receive_increasing_sequence_numbers() {
        let store = MemoryKvStore::new();
        let hub = InMemoryBroadcastHub::new();
        let queue = AsyncQueue::new();
        let persistence = KvPersistence::new(options("tab-1", &store, &hub, &queue));
        persistence.start().unwrap();
        let first = run_transaction(persistence.as_ref(), "a", TransactionMode::ReadWritePrimary, |txn| {
            Ok(txn.current_sequence_number())
        })
        .unwrap();
        persistence.on_remote_sequence_number(first + 10);
        let second = run_transaction(persistence.as_ref(), "b", TransactionMode::ReadOnly, |txn| {
            Ok(txn.current_sequence_number())
        })
        .unwrap();
        assert_eq!(second, first + 11);
    }
}
