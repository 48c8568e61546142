//! Process-memory persistence with eager garbage collection.

mod index_manager;
pub(crate) mod mutation_queue;
mod remote_document_cache;
mod target_cache;

pub use index_manager::MemoryIndexManager;
pub use mutation_queue::MemoryMutationQueue;
pub use remote_document_cache::{DocumentSizer, MemoryRemoteDocumentCache};
pub use target_cache::MemoryTargetCache;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{failed_precondition, internal_error, FirestoreResult};
use crate::local::persistence::{
    new_change_buffer, IndexManager, MutationQueue, Persistence, PersistenceTransaction,
    PrimaryStateListener, ReferenceDelegate, RemoteDocumentCache, TargetCache, TransactionMode,
    INVALID_SEQUENCE_NUMBER,
};
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, MaybeDocument, SnapshotVersion, TargetId};
use crate::remote::credentials::User;

type MutationQueues = Arc<Mutex<HashMap<String, Arc<MemoryMutationQueue>>>>;

/// Single-tab persistence that lives and dies with the client.
pub struct MemoryPersistence {
    client_id: String,
    mutation_queues: MutationQueues,
    index_manager: Arc<MemoryIndexManager>,
    remote_document_cache: Arc<MemoryRemoteDocumentCache>,
    target_cache: Arc<MemoryTargetCache>,
    reference_delegate: Arc<MemoryEagerDelegate>,
    transaction_lock: Mutex<()>,
    started: AtomicBool,
}

impl MemoryPersistence {
    pub fn new(client_id: impl Into<String>) -> Self {
        let index_manager = Arc::new(MemoryIndexManager::new());
        let remote_document_cache = Arc::new(MemoryRemoteDocumentCache::new(
            index_manager.clone(),
            Arc::new(|_: &MaybeDocument| 0),
        ));
        let target_cache = Arc::new(MemoryTargetCache::new());
        let mutation_queues: MutationQueues = Arc::default();
        let reference_delegate = Arc::new(MemoryEagerDelegate {
            target_cache: target_cache.clone(),
            remote_document_cache: remote_document_cache.clone(),
            mutation_queues: mutation_queues.clone(),
            in_memory_pins: Mutex::new(None),
            orphaned_documents: Mutex::new(None),
        });
        Self {
            client_id: client_id.into(),
            mutation_queues,
            index_manager,
            remote_document_cache,
            target_cache,
            reference_delegate,
            transaction_lock: Mutex::new(()),
            started: AtomicBool::new(true),
        }
    }
}

impl Persistence for MemoryPersistence {
    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn shutdown(&self) -> FirestoreResult<()> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn get_mutation_queue(&self, user: &User) -> Arc<dyn MutationQueue> {
        let mut queues = match self.mutation_queues.lock() {
            Ok(queues) => queues,
            Err(poisoned) => poisoned.into_inner(),
        };
        queues
            .entry(user.to_key())
            .or_insert_with(|| Arc::new(MemoryMutationQueue::new(self.index_manager.clone())))
            .clone()
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
        // A memory-backed client is always the only and primary tab.
        listener(true);
        Ok(())
    }

    fn set_network_enabled(&self, _enabled: bool) -> FirestoreResult<()> {
        Ok(())
    }

    fn set_in_foreground(&self, _in_foreground: bool) -> FirestoreResult<()> {
        Ok(())
    }

    fn get_active_clients(&self) -> FirestoreResult<Vec<String>> {
        Ok(vec![self.client_id.clone()])
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
        let _guard = self
            .transaction_lock
            .lock()
            .map_err(|_| internal_error("transaction lock poisoned"))?;
        log::debug!("starting transaction: {action}");
        let txn = PersistenceTransaction::new(action, mode, INVALID_SEQUENCE_NUMBER, None);
        self.reference_delegate.on_transaction_started();
        operation(&txn)?;
        self.reference_delegate.on_transaction_committed(&txn)?;
        txn.commit()
    }
}

/// Removes documents from the cache as soon as nothing references them.
pub struct MemoryEagerDelegate {
    target_cache: Arc<MemoryTargetCache>,
    remote_document_cache: Arc<MemoryRemoteDocumentCache>,
    mutation_queues: MutationQueues,
    in_memory_pins: Mutex<Option<Arc<Mutex<ReferenceSet>>>>,
    /// Candidates collected during the running transaction.
    orphaned_documents: Mutex<Option<BTreeSet<DocumentKey>>>,
}

impl MemoryEagerDelegate {
    fn mark_orphaned(&self, key: &DocumentKey) -> FirestoreResult<()> {
        let mut orphaned = self
            .orphaned_documents
            .lock()
            .map_err(|_| internal_error("orphaned documents lock poisoned"))?;
        match orphaned.as_mut() {
            Some(set) => {
                set.insert(key.clone());
                Ok(())
            }
            None => Err(internal_error("orphaned documents are only tracked inside a transaction")),
        }
    }

    fn is_referenced(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
        if self.target_cache.contains_key(txn, key)? {
            return Ok(true);
        }
        let queues: Vec<Arc<MemoryMutationQueue>> = match self.mutation_queues.lock() {
            Ok(queues) => queues.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        for queue in queues {
            if queue.contains_key(txn, key)? {
                return Ok(true);
            }
        }
        let pins = self
            .in_memory_pins
            .lock()
            .map_err(|_| internal_error("in-memory pins lock poisoned"))?
            .clone();
        match pins {
            Some(pins) => Ok(pins
                .lock()
                .map_err(|_| internal_error("in-memory pins lock poisoned"))?
                .contains_key(key)),
            None => Ok(false),
        }
    }
}

impl ReferenceDelegate for MemoryEagerDelegate {
    fn set_in_memory_pins(&self, pins: Arc<Mutex<ReferenceSet>>) {
        if let Ok(mut slot) = self.in_memory_pins.lock() {
            *slot = Some(pins);
        }
    }

    fn add_reference(
        &self,
        _txn: &PersistenceTransaction,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        if let Some(set) = self
            .orphaned_documents
            .lock()
            .map_err(|_| internal_error("orphaned documents lock poisoned"))?
            .as_mut()
        {
            set.remove(key);
        }
        Ok(())
    }

    fn remove_reference(
        &self,
        _txn: &PersistenceTransaction,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.mark_orphaned(key)
    }

    fn remove_target(&self, txn: &PersistenceTransaction, data: &TargetData) -> FirestoreResult<()> {
        for key in &self
            .target_cache
            .get_matching_keys_for_target_id(txn, data.target_id)?
        {
            self.mark_orphaned(key)?;
        }
        self.target_cache.remove_target_data(txn, data)
    }

    fn mark_potentially_orphaned(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.mark_orphaned(key)
    }

    fn update_limbo_document(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        if self.is_referenced(txn, key)? {
            if let Some(set) = self
                .orphaned_documents
                .lock()
                .map_err(|_| internal_error("orphaned documents lock poisoned"))?
                .as_mut()
            {
                set.remove(key);
            }
            Ok(())
        } else {
            self.mark_orphaned(key)
        }
    }

    fn on_transaction_started(&self) {
        if let Ok(mut orphaned) = self.orphaned_documents.lock() {
            *orphaned = Some(BTreeSet::new());
        }
    }

    fn on_transaction_committed(&self, txn: &PersistenceTransaction) -> FirestoreResult<()> {
        let orphaned = self
            .orphaned_documents
            .lock()
            .map_err(|_| internal_error("orphaned documents lock poisoned"))?
            .take()
            .unwrap_or_default();
        if orphaned.is_empty() {
            return Ok(());
        }
        let mut buffer = new_change_buffer(self.remote_document_cache.clone(), false);
        for key in orphaned {
            if !self.is_referenced(txn, &key)? && buffer.get_entry(txn, &key)?.is_some() {
                log::debug!("eagerly collecting {key}");
                buffer.remove_entry(key, SnapshotVersion::min());
            }
        }
        buffer.apply(txn)
    }
}
