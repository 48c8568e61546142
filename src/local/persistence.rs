//! Storage contract shared by the in-memory and durable persistence.
//!
//! Every component operates on a [`PersistenceTransaction`] handed out by
//! [`Persistence::run_transaction`]. Transactions are synchronous: they run
//! to completion without yielding to the task queue.

use std::collections::HashSet;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use crate::core::query::Query;
use crate::core::target::Target;
use crate::error::{failed_precondition, internal_error, FirestoreError, FirestoreResult};
use crate::local::kv::KvTransaction;
use crate::local::remote_document_change_buffer::RemoteDocumentChangeBuffer;
use crate::local::target_data::TargetData;
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, DocumentMap, ListenSequenceNumber, MaybeDocument,
    MaybeDocumentMap, Mutation, MutationBatch, NullableMaybeDocumentMap, ResourcePath,
    SnapshotVersion, TargetId, Timestamp,
};
use crate::remote::credentials::User;

pub const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current tab is not in the required state to perform this operation. \
     It might be necessary to refresh the browser tab.";

pub const PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG: &str =
    "There is another tab open with offline persistence enabled. \
     Only one such tab is allowed at a time. The other tab must be closed \
     or persistence must be disabled.";

/// Sequence number used by persistence without LRU bookkeeping.
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

pub fn primary_lease_lost() -> FirestoreError {
    failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG)
}

pub fn is_primary_lease_lost(err: &FirestoreError) -> bool {
    err.code == crate::error::FirestoreErrorCode::FailedPrecondition
        && err.message() == PRIMARY_LEASE_LOST_ERROR_MSG
}

/// Swallows the error raised when a secondary tab attempts a
/// primary-only transaction.
pub fn ignore_if_primary_lease_loss(result: FirestoreResult<()>) -> FirestoreResult<()> {
    match result {
        Err(err) if is_primary_lease_lost(&err) => {
            log::debug!("unexpectedly lost primary lease");
            Ok(())
        }
        other => other,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Only the lease holder may run these.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_read_only(self) -> bool {
        self == TransactionMode::ReadOnly
    }
}

type CommitListener = Box<dyn FnOnce() + Send>;

/// Handle threaded through every persistence operation.
pub struct PersistenceTransaction {
    action: String,
    mode: TransactionMode,
    current_sequence_number: ListenSequenceNumber,
    kv: Option<Box<dyn KvTransaction>>,
    committed_listeners: Mutex<Vec<CommitListener>>,
}

impl PersistenceTransaction {
    pub fn new(
        action: impl Into<String>,
        mode: TransactionMode,
        current_sequence_number: ListenSequenceNumber,
        kv: Option<Box<dyn KvTransaction>>,
    ) -> Self {
        Self {
            action: action.into(),
            mode,
            current_sequence_number,
            kv,
            committed_listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }

    /// Underlying key-value transaction of the durable persistence.
    pub fn store(&self) -> FirestoreResult<&dyn KvTransaction> {
        self.kv
            .as_deref()
            .ok_or_else(|| internal_error("transaction is not backed by a key-value store"))
    }

    /// Registers a callback that runs once the transaction committed.
    pub fn add_on_committed_listener(&self, listener: impl FnOnce() + Send + 'static) {
        if let Ok(mut listeners) = self.committed_listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    /// Commits the key-value transaction, if any, and fires the commit
    /// listeners.
    pub fn commit(mut self) -> FirestoreResult<()> {
        if let Some(kv) = self.kv.take() {
            kv.commit()?;
        }
        let listeners = match self.committed_listeners.into_inner() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for listener in listeners {
            listener();
        }
        Ok(())
    }

    pub fn abort(mut self) {
        if let Some(kv) = self.kv.take() {
            kv.abort();
        }
    }
}

impl Debug for PersistenceTransaction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceTransaction")
            .field("action", &self.action)
            .field("mode", &self.mode)
            .field("current_sequence_number", &self.current_sequence_number)
            .finish_non_exhaustive()
    }
}

pub type PrimaryStateListener = Arc<dyn Fn(bool) + Send + Sync>;

/// Entry point of a storage backend.
pub trait Persistence: Send + Sync {
    fn started(&self) -> bool;

    fn shutdown(&self) -> FirestoreResult<()>;

    /// Id of the client (tab) owning this instance.
    fn client_id(&self) -> &str;

    fn get_mutation_queue(&self, user: &User) -> Arc<dyn MutationQueue>;

    fn get_target_cache(&self) -> Arc<dyn TargetCache>;

    fn get_remote_document_cache(&self) -> Arc<dyn RemoteDocumentCache>;

    fn get_index_manager(&self) -> Arc<dyn IndexManager>;

    fn reference_delegate(&self) -> Arc<dyn ReferenceDelegate>;

    /// Registers the listener notified whenever this client gains or loses
    /// the primary lease. It is invoked immediately with the current state.
    fn set_primary_state_listener(&self, listener: PrimaryStateListener) -> FirestoreResult<()>;

    fn set_network_enabled(&self, enabled: bool) -> FirestoreResult<()>;

    /// Foreground tabs are preferred when the primary lease is assigned.
    fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()>;

    /// Ids of clients whose metadata is recent enough to count as alive.
    fn get_active_clients(&self) -> FirestoreResult<Vec<String>>;

    /// Object-safe transaction runner. Prefer [`run_transaction`].
    fn run_transaction_dyn(
        &self,
        action: &str,
        mode: TransactionMode,
        operation: &mut dyn FnMut(&PersistenceTransaction) -> FirestoreResult<()>,
    ) -> FirestoreResult<()>;
}

/// Runs `operation` inside a transaction and returns its result.
pub fn run_transaction<P, T, F>(
    persistence: &P,
    action: &str,
    mode: TransactionMode,
    operation: F,
) -> FirestoreResult<T>
where
    P: Persistence + ?Sized,
    F: FnOnce(&PersistenceTransaction) -> FirestoreResult<T>,
{
    let mut operation = Some(operation);
    let mut output = None;
    persistence.run_transaction_dyn(action, mode, &mut |txn| {
        let operation = operation
            .take()
            .ok_or_else(|| internal_error("transaction body executed twice"))?;
        output = Some(operation(txn)?);
        Ok(())
    })?;
    output.ok_or_else(|| internal_error("transaction completed without a result"))
}

/// Per-user queue of locally written batches awaiting acknowledgement.
pub trait MutationQueue: Send + Sync {
    fn check_empty(&self, txn: &PersistenceTransaction) -> FirestoreResult<bool>;

    fn acknowledge_batch(
        &self,
        txn: &PersistenceTransaction,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()>;

    fn get_last_stream_token(&self, txn: &PersistenceTransaction) -> FirestoreResult<Vec<u8>>;

    fn set_last_stream_token(
        &self,
        txn: &PersistenceTransaction,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()>;

    /// Appends a batch with the next batch id.
    fn add_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch>;

    fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>>;

    /// Keys written by `batch_id`, or `None` if the batch is gone.
    fn lookup_mutation_keys(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<DocumentKeySet>>;

    /// First batch with an id strictly greater than `batch_id`.
    fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>>;

    fn get_highest_unacknowledged_batch_id(
        &self,
        txn: &PersistenceTransaction,
    ) -> FirestoreResult<BatchId>;

    fn get_all_mutation_batches(
        &self,
        txn: &PersistenceTransaction,
    ) -> FirestoreResult<Vec<MutationBatch>>;

    fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>>;

    fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<Vec<MutationBatch>>;

    /// Batches touching documents that are immediate children of the
    /// query's collection. Collection-group queries are expanded by the
    /// caller.
    fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>>;

    fn remove_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        batch: &MutationBatch,
    ) -> FirestoreResult<()>;

    /// Verifies that no document index entries outlive their batches once
    /// the queue is empty.
    fn perform_consistency_check(&self, txn: &PersistenceTransaction) -> FirestoreResult<()>;

    fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool>;
}

/// Cache of documents as last seen from the backend.
///
/// Writes go through a [`RemoteDocumentChangeBuffer`]; the raw `put_entry`,
/// `delete_entry` and `update_size` operations exist for the buffer only.
pub trait RemoteDocumentCache: Send + Sync {
    fn get_entry(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        Ok(self.get_sized_entry(txn, key)?.map(|(doc, _)| doc))
    }

    fn get_entries(
        &self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<NullableMaybeDocumentMap> {
        let mut results = crate::model::nullable_maybe_document_map();
        for key in keys {
            results = results.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(results)
    }

    /// Entry together with its stored size in bytes.
    fn get_sized_entry(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<(MaybeDocument, i64)>>;

    /// Documents that are immediate children of the query's path and were
    /// read after `since_read_time`. Results are not filtered by the query.
    fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap>;

    /// Entries read after `since_read_time`, along with the newest read
    /// time seen. Removed entries are reported as `NoDocument`s.
    fn get_new_document_changes(
        &self,
        txn: &PersistenceTransaction,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<(MaybeDocumentMap, SnapshotVersion)>;

    /// Newest read time in the cache.
    fn get_last_read_time(&self, txn: &PersistenceTransaction) -> FirestoreResult<SnapshotVersion>;

    /// Approximate total size of the cached documents.
    fn get_size(&self, txn: &PersistenceTransaction) -> FirestoreResult<i64>;

    /// Stores `doc` and returns its size in bytes.
    fn put_entry(
        &self,
        txn: &PersistenceTransaction,
        doc: &MaybeDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<i64>;

    /// Marks `key` as removed at `read_time`, keeping a tombstone so that
    /// [`get_new_document_changes`](Self::get_new_document_changes) reports it.
    fn put_removal(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<i64>;

    fn delete_entry(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<()>;

    fn update_size(&self, txn: &PersistenceTransaction, delta: i64) -> FirestoreResult<()>;
}

/// Creates a change buffer over `cache`.
pub fn new_change_buffer(
    cache: Arc<dyn RemoteDocumentCache>,
    track_removals: bool,
) -> RemoteDocumentChangeBuffer {
    RemoteDocumentChangeBuffer::new(cache, track_removals)
}

/// Persisted targets and their matching documents.
pub trait TargetCache: Send + Sync {
    fn get_last_remote_snapshot_version(
        &self,
        txn: &PersistenceTransaction,
    ) -> FirestoreResult<SnapshotVersion>;

    fn get_highest_sequence_number(
        &self,
        txn: &PersistenceTransaction,
    ) -> FirestoreResult<ListenSequenceNumber>;

    fn allocate_target_id(&self, txn: &PersistenceTransaction) -> FirestoreResult<TargetId>;

    fn set_targets_metadata(
        &self,
        txn: &PersistenceTransaction,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()>;

    fn add_target_data(&self, txn: &PersistenceTransaction, data: &TargetData) -> FirestoreResult<()>;

    fn update_target_data(
        &self,
        txn: &PersistenceTransaction,
        data: &TargetData,
    ) -> FirestoreResult<()>;

    /// Removes the target and its document associations.
    fn remove_target_data(
        &self,
        txn: &PersistenceTransaction,
        data: &TargetData,
    ) -> FirestoreResult<()>;

    fn get_target_count(&self, txn: &PersistenceTransaction) -> FirestoreResult<usize>;

    fn get_target_data(
        &self,
        txn: &PersistenceTransaction,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>>;

    fn get_target_data_for_target_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>>;

    fn for_each_target(
        &self,
        txn: &PersistenceTransaction,
        visitor: &mut dyn FnMut(&TargetData),
    ) -> FirestoreResult<()>;

    fn add_matching_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()>;

    fn remove_matching_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()>;

    fn remove_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<()>;

    fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<DocumentKeySet>;

    /// Whether any target currently matches `key`.
    fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool>;
}

/// Collection-id to parent-path index used to expand collection-group
/// queries.
pub trait IndexManager: Send + Sync {
    /// Records the parent of `collection_path`. Idempotent.
    fn add_to_collection_parent_index(
        &self,
        txn: &PersistenceTransaction,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()>;

    fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>>;
}

/// Hooks through which the local store reports document references so the
/// persistence can garbage collect unreferenced documents.
pub trait ReferenceDelegate: Send + Sync {
    /// Shares the local view references, which pin documents shown by a
    /// view.
    fn set_in_memory_pins(&self, pins: Arc<Mutex<crate::local::ReferenceSet>>);

    fn add_reference(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()>;

    fn remove_reference(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()>;

    /// Called when a target is released for good.
    fn remove_target(&self, txn: &PersistenceTransaction, data: &TargetData) -> FirestoreResult<()>;

    /// The document lost a reference that is not tracked per target, such as
    /// a removed mutation.
    fn mark_potentially_orphaned(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()>;

    /// The document was updated by a limbo resolution.
    fn update_limbo_document(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()>;

    fn on_transaction_started(&self) {}

    /// Runs inside the transaction right before it commits.
    fn on_transaction_committed(&self, _txn: &PersistenceTransaction) -> FirestoreResult<()> {
        Ok(())
    }
}

/// Target ids of the currently active targets, used to protect them from
/// collection.
pub type ActiveTargets = HashSet<TargetId>;
