//! Orchestrates the persistence components into the client's local view.
//!
//! The local store owns every write to the persisted caches. Writes are
//! applied optimistically on top of the remote document cache, remote events
//! are merged into it, and queries are answered from the combination.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::SyncSettings;
use crate::core::query::Query;
use crate::core::target::Target;
use crate::core::view_snapshot::ViewSnapshot;
use crate::error::{internal_error, not_found, FirestoreResult};
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::lru::{LruGarbageCollector, LruResults};
use crate::local::persistence::{
    new_change_buffer, run_transaction, ActiveTargets, MutationQueue, Persistence,
    PersistenceTransaction, TransactionMode,
};
use crate::local::query_engine::IndexFreeQueryEngine;
use crate::local::reference_set::ReferenceSet;
use crate::local::remote_document_change_buffer::RemoteDocumentChangeBuffer;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{
    document_key_set, BatchId, ChangeType, DocumentKey, DocumentKeySet, DocumentMap,
    MaybeDocument, MaybeDocumentMap, Mutation, MutationBatch, MutationBatchResult, Precondition,
    SnapshotVersion, TargetId, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::remote::credentials::User;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::util::assert::hard_assert;

/// Outcome of [`LocalStore::local_write`].
#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: MaybeDocumentMap,
}

/// Outcome of [`LocalStore::handle_user_change`].
#[derive(Clone, Debug)]
pub struct UserChangeResult {
    pub affected_documents: MaybeDocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

/// Documents matching a query together with the keys the backend last
/// reported for its target.
#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: DocumentKeySet,
}

/// Keys that entered or left a view, reported back so documents shown to the
/// user are not garbage collected.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = document_key_set();
        let mut removed_keys = document_key_set();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => added_keys = added_keys.insert(change.doc.key().clone()),
                ChangeType::Removed => removed_keys = removed_keys.insert(change.doc.key().clone()),
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}

struct LocalStoreState {
    mutation_queue: Arc<dyn MutationQueue>,
    local_documents: LocalDocumentsView,
    /// Active targets keyed by id.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    /// Canonical id of each active target.
    target_id_by_target: HashMap<String, TargetId>,
    /// Read time of the newest remote document seen by
    /// [`LocalStore::get_new_document_changes`].
    last_document_change_read_time: SnapshotVersion,
}

pub struct LocalStore {
    persistence: Arc<dyn Persistence>,
    query_engine: IndexFreeQueryEngine,
    resume_token_max_age: Duration,
    local_view_references: Arc<Mutex<ReferenceSet>>,
    state: Mutex<LocalStoreState>,
}

impl LocalStore {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        query_engine: IndexFreeQueryEngine,
        initial_user: &User,
        settings: &SyncSettings,
    ) -> Self {
        let mutation_queue = persistence.get_mutation_queue(initial_user);
        let local_documents = LocalDocumentsView::new(
            persistence.get_remote_document_cache(),
            mutation_queue.clone(),
            persistence.get_index_manager(),
        );
        let local_view_references = Arc::new(Mutex::new(ReferenceSet::new()));
        persistence
            .reference_delegate()
            .set_in_memory_pins(local_view_references.clone());
        Self {
            persistence,
            query_engine,
            resume_token_max_age: settings.resume_token_max_age,
            local_view_references,
            state: Mutex::new(LocalStoreState {
                mutation_queue,
                local_documents,
                target_data_by_target: BTreeMap::new(),
                target_id_by_target: HashMap::new(),
                last_document_change_read_time: SnapshotVersion::min(),
            }),
        }
    }

    fn lock(&self) -> FirestoreResult<MutexGuard<'_, LocalStoreState>> {
        self.state
            .lock()
            .map_err(|_| internal_error("local store state poisoned"))
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    pub fn start(&self) -> FirestoreResult<()> {
        self.synchronize_last_document_change_read_time()
    }

    /// Switches to the mutation queue of `user` and reports which local
    /// documents changed as a result.
    pub fn handle_user_change(&self, user: &User) -> FirestoreResult<UserChangeResult> {
        let mut state = self.lock()?;
        let persistence = &self.persistence;
        let old_queue = state.mutation_queue.clone();
        let new_queue = persistence.get_mutation_queue(user);
        let new_documents = LocalDocumentsView::new(
            persistence.get_remote_document_cache(),
            new_queue.clone(),
            persistence.get_index_manager(),
        );

        let result = run_transaction(
            persistence.as_ref(),
            "Handle user change",
            TransactionMode::ReadOnly,
            |txn| {
                let old_batches = old_queue.get_all_mutation_batches(txn)?;
                let new_batches = new_queue.get_all_mutation_batches(txn)?;
                let changed_keys = old_batches
                    .iter()
                    .chain(new_batches.iter())
                    .fold(document_key_set(), |keys, batch| keys.union(&batch.keys()));
                Ok(UserChangeResult {
                    affected_documents: new_documents.get_documents(txn, &changed_keys)?,
                    removed_batch_ids: old_batches.iter().map(|b| b.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|b| b.batch_id).collect(),
                })
            },
        )?;

        state.mutation_queue = new_queue;
        state.local_documents = new_documents;
        Ok(result)
    }

    /// Appends a batch for `mutations` and returns the optimistic view of
    /// the affected documents.
    pub fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let state = self.lock()?;
        let local_write_time = Timestamp::now();
        let keys = mutations
            .iter()
            .fold(document_key_set(), |keys, m| keys.insert(m.key().clone()));

        run_transaction(
            self.persistence.as_ref(),
            "Locally write mutations",
            TransactionMode::ReadWrite,
            |txn| {
                let existing_docs = state.local_documents.get_documents(txn, &keys)?;
                // Non-idempotent transforms are seeded with the value they
                // saw so that replays over later remote states stay stable.
                let base_mutations = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let base_value = mutation.extract_base_value(existing_docs.get(mutation.key()))?;
                        let mask = base_value.field_mask();
                        Some(
                            Mutation::patch(mutation.key().clone(), base_value, mask)
                                .with_precondition(Precondition::Exists(true)),
                        )
                    })
                    .collect();
                let batch = state.mutation_queue.add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations,
                )?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: batch.apply_to_local_document_set(&existing_docs),
                })
            },
        )
    }

    /// Applies the backend's acknowledgement of a batch to the remote
    /// document cache and drops the batch from the queue.
    pub fn acknowledge_batch(
        &self,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let state = self.lock()?;
        run_transaction(
            self.persistence.as_ref(),
            "Acknowledge batch",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let affected = batch_result.batch.keys();
                let mut buffer = new_change_buffer(self.persistence.get_remote_document_cache(), true);
                state.mutation_queue.acknowledge_batch(
                    txn,
                    &batch_result.batch,
                    batch_result.stream_token.clone(),
                )?;
                self.apply_write_to_remote_documents(txn, &state, batch_result, &mut buffer)?;
                buffer.apply(txn)?;
                state.mutation_queue.perform_consistency_check(txn)?;
                state.local_documents.get_documents(txn, &affected)
            },
        )
    }

    fn apply_write_to_remote_documents(
        &self,
        txn: &PersistenceTransaction,
        state: &LocalStoreState,
        batch_result: &MutationBatchResult,
        buffer: &mut RemoteDocumentChangeBuffer,
    ) -> FirestoreResult<()> {
        let batch = &batch_result.batch;
        for key in &batch.keys() {
            let remote_doc = buffer.get_entry(txn, key)?;
            let Some(ack_version) = batch_result.doc_versions.get(key).copied() else {
                return Err(internal_error(format!("doc_versions should contain every doc in the write ({key})")));
            };
            let outdated = remote_doc
                .as_ref()
                .map_or(true, |doc| doc.version() < ack_version);
            if outdated {
                match batch.apply_to_remote_document(key, remote_doc.clone(), batch_result) {
                    Some(doc) => buffer.add_entry(doc, batch_result.commit_version),
                    None => hard_assert(
                        remote_doc.is_none(),
                        format!("Mutation batch {batch:?} applied to document {remote_doc:?} resulted in none"),
                    ),
                }
            }
        }
        self.remove_mutation_batch(txn, state, batch)
    }

    fn remove_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        state: &LocalStoreState,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        state.mutation_queue.remove_mutation_batch(txn, batch)?;
        let delegate = self.persistence.reference_delegate();
        for key in &batch.keys() {
            delegate.mark_potentially_orphaned(txn, key)?;
        }
        Ok(())
    }

    /// Drops a batch the backend rejected and returns the affected
    /// documents without its mutations.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<MaybeDocumentMap> {
        let state = self.lock()?;
        run_transaction(
            self.persistence.as_ref(),
            "Reject batch",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let batch = state
                    .mutation_queue
                    .lookup_mutation_batch(txn, batch_id)?
                    .ok_or_else(|| not_found(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                let affected = batch.keys();
                self.remove_mutation_batch(txn, &state, &batch)?;
                state.mutation_queue.perform_consistency_check(txn)?;
                state.local_documents.get_documents(txn, &affected)
            },
        )
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let state = self.lock()?;
        run_transaction(
            self.persistence.as_ref(),
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            |txn| state.mutation_queue.get_highest_unacknowledged_batch_id(txn),
        )
    }

    pub fn get_last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let state = self.lock()?;
        run_transaction(
            self.persistence.as_ref(),
            "Get last stream token",
            TransactionMode::ReadOnly,
            |txn| state.mutation_queue.get_last_stream_token(txn),
        )
    }

    pub fn set_last_stream_token(&self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let state = self.lock()?;
        run_transaction(
            self.persistence.as_ref(),
            "Set last stream token",
            TransactionMode::ReadWritePrimary,
            |txn| state.mutation_queue.set_last_stream_token(txn, stream_token),
        )
    }

    pub fn get_last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        run_transaction(
            self.persistence.as_ref(),
            "Get last remote snapshot version",
            TransactionMode::ReadOnly,
            |txn| {
                self.persistence
                    .get_target_cache()
                    .get_last_remote_snapshot_version(txn)
            },
        )
    }

    /// Merges a consistent watch snapshot into the caches and returns the
    /// new local view of every updated document.
    pub fn apply_remote_event(&self, remote_event: &RemoteEvent) -> FirestoreResult<MaybeDocumentMap> {
        let mut state = self.lock()?;
        let remote_version = remote_event.snapshot_version;
        let target_cache = self.persistence.get_target_cache();
        let delegate = self.persistence.reference_delegate();
        let mut new_target_data = state.target_data_by_target.clone();

        let changed_docs = run_transaction(
            self.persistence.as_ref(),
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let mut buffer = new_change_buffer(self.persistence.get_remote_document_cache(), true);

                for (target_id, change) in &remote_event.target_changes {
                    // Only active targets have their mappings updated.
                    let Some(old_target_data) = new_target_data.get(target_id).cloned() else {
                        continue;
                    };

                    target_cache.remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    for key in &change.removed_documents {
                        delegate.remove_reference(txn, *target_id, key)?;
                    }
                    target_cache.add_matching_keys(txn, &change.added_documents, *target_id)?;
                    for key in &change.added_documents {
                        delegate.add_reference(txn, *target_id, key)?;
                    }

                    if !change.resume_token.is_empty() {
                        let updated = old_target_data
                            .with_resume_token(change.resume_token.clone(), remote_version)
                            .with_sequence_number(txn.current_sequence_number());
                        if self.should_persist_target_data(&old_target_data, &updated, change) {
                            target_cache.update_target_data(txn, &updated)?;
                        }
                        new_target_data.insert(*target_id, updated);
                    }
                }

                let updated_keys = remote_event
                    .document_updates
                    .keys()
                    .fold(document_key_set(), |keys, key| keys.insert(key.clone()));
                let existing_docs = buffer.get_entries(txn, &updated_keys)?;
                let mut changed_docs = crate::model::nullable_maybe_document_map();
                for (key, doc) in remote_event.document_updates.iter() {
                    let existing = existing_docs.get(key).cloned().flatten();
                    // Manufactured deletes at the minimum version stem from
                    // rejected limbo resolutions; they never add documents
                    // to the cache.
                    if doc.is_no_document() && doc.version().is_min() {
                        buffer.remove_entry(key.clone(), remote_version);
                        changed_docs = changed_docs.insert(key.clone(), Some(doc.clone()));
                    } else if existing.as_ref().map_or(true, |existing| {
                        doc.version() > existing.version()
                            || (doc.version() == existing.version() && existing.has_pending_writes())
                    }) {
                        buffer.add_entry(doc.clone(), remote_version);
                        changed_docs = changed_docs.insert(key.clone(), Some(doc.clone()));
                    } else {
                        log::debug!(
                            "ignoring outdated watch update for {key}. current version: {:?}, watch version: {}",
                            existing.as_ref().map(MaybeDocument::version),
                            doc.version()
                        );
                    }

                    if remote_event.resolved_limbo_documents.has(key) {
                        delegate.update_limbo_document(txn, key)?;
                    }
                }

                // Synthesized events for rejected limbo listens carry the
                // minimum version and must not move the global version.
                if !remote_version.is_min() {
                    let last_remote_version = target_cache.get_last_remote_snapshot_version(txn)?;
                    hard_assert(
                        remote_version >= last_remote_version,
                        format!("Watch stream reverted to previous snapshot?? {remote_version} < {last_remote_version}"),
                    );
                    target_cache.set_targets_metadata(
                        txn,
                        txn.current_sequence_number(),
                        Some(remote_version),
                    )?;
                }

                buffer.apply(txn)?;
                state
                    .local_documents
                    .get_local_view_of_documents(txn, &changed_docs)
            },
        )?;

        state.target_data_by_target = new_target_data;
        Ok(changed_docs)
    }

    /// Whether an updated resume token is worth writing. The token is always
    /// written the first time, then only when it aged beyond the configured
    /// window or the target's documents changed.
    fn should_persist_target_data(
        &self,
        old_target_data: &TargetData,
        new_target_data: &TargetData,
        change: &TargetChange,
    ) -> bool {
        hard_assert(
            !new_target_data.resume_token.is_empty(),
            "Attempted to persist target data with no resume token",
        );
        if old_target_data.resume_token.is_empty() {
            return true;
        }
        let time_delta = new_target_data.snapshot_version.to_micros()
            - old_target_data.snapshot_version.to_micros();
        if time_delta >= self.resume_token_max_age.as_micros() as i64 {
            return true;
        }
        change.change_count() > 0
    }

    /// Records which documents the views currently show.
    pub fn notify_local_view_changes(&self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let mut state = self.lock()?;
        let delegate = self.persistence.reference_delegate();
        run_transaction(
            self.persistence.as_ref(),
            "Notify local view changes",
            TransactionMode::ReadWrite,
            |txn| {
                for view_change in view_changes {
                    let target_id = view_change.target_id;
                    self.references()?
                        .add_references(&view_change.added_keys, target_id);
                    for key in &view_change.removed_keys {
                        delegate.remove_reference(txn, target_id, key)?;
                    }
                    self.references()?
                        .remove_references(&view_change.removed_keys, target_id);
                }
                Ok(())
            },
        )?;

        for view_change in view_changes.iter().filter(|change| !change.from_cache) {
            let target_id = view_change.target_id;
            let Some(target_data) = state.target_data_by_target.get(&target_id) else {
                return Err(internal_error(format!(
                    "Can't set limbo-free snapshot version for unknown target: {target_id}"
                )));
            };
            // The view is in sync and free of limbo documents as of the last
            // consistent snapshot.
            let updated =
                target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
            state.target_data_by_target.insert(target_id, updated);
        }
        Ok(())
    }

    fn references(&self) -> FirestoreResult<MutexGuard<'_, ReferenceSet>> {
        self.local_view_references
            .lock()
            .map_err(|_| internal_error("local view references poisoned"))
    }

    /// First batch after `after_batch_id`, or the first batch when `None`.
    pub fn next_mutation_batch(
        &self,
        after_batch_id: Option<BatchId>,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.lock()?;
        run_transaction(
            self.persistence.as_ref(),
            "Get next mutation batch",
            TransactionMode::ReadOnly,
            |txn| {
                state.mutation_queue.get_next_mutation_batch_after_batch_id(
                    txn,
                    after_batch_id.unwrap_or(BATCH_ID_UNKNOWN),
                )
            },
        )
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.lock()?;
        run_transaction(
            self.persistence.as_ref(),
            "Lookup mutation batch",
            TransactionMode::ReadOnly,
            |txn| state.mutation_queue.lookup_mutation_batch(txn, batch_id),
        )
    }

    /// Local view of the documents written by `batch_id`, or `None` once the
    /// batch is gone.
    pub fn lookup_mutation_documents(
        &self,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MaybeDocumentMap>> {
        let state = self.lock()?;
        run_transaction(
            self.persistence.as_ref(),
            "Lookup mutation documents",
            TransactionMode::ReadOnly,
            |txn| match state.mutation_queue.lookup_mutation_keys(txn, batch_id)? {
                Some(keys) => Ok(Some(state.local_documents.get_documents(txn, &keys)?)),
                None => Ok(None),
            },
        )
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Option<MaybeDocument>> {
        let state = self.lock()?;
        run_transaction(
            self.persistence.as_ref(),
            "Read document",
            TransactionMode::ReadOnly,
            |txn| state.local_documents.get_document(txn, key),
        )
    }

    /// Assigns a target id to `target`, reusing the persisted one when the
    /// target was listened to before.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let mut state = self.lock()?;
        let target_cache = self.persistence.get_target_cache();
        let target_data = run_transaction(
            self.persistence.as_ref(),
            "Allocate target",
            TransactionMode::ReadWrite,
            |txn| {
                if let Some(cached) = target_cache.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = target_cache.allocate_target_id(txn)?;
                let data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                target_cache.add_target_data(txn, &data)?;
                Ok(data)
            },
        )?;

        if !state.target_data_by_target.contains_key(&target_data.target_id) {
            log::debug!(
                "allocated target {} for {}",
                target_data.target_id,
                target.canonical_id()
            );
            state
                .target_data_by_target
                .insert(target_data.target_id, target_data.clone());
            state
                .target_id_by_target
                .insert(target.canonical_id(), target_data.target_id);
        }
        Ok(target_data)
    }

    /// Persisted data for `target`, preferring the in-memory copy of an
    /// active target.
    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let state = self.lock()?;
        self.target_data_for(&state, target)
    }

    fn target_data_for(
        &self,
        state: &LocalStoreState,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        if let Some(data) = state
            .target_id_by_target
            .get(&target.canonical_id())
            .and_then(|id| state.target_data_by_target.get(id))
        {
            return Ok(Some(data.clone()));
        }
        run_transaction(
            self.persistence.as_ref(),
            "Get target data",
            TransactionMode::ReadOnly,
            |txn| self.persistence.get_target_cache().get_target_data(txn, target),
        )
    }

    /// Target of `target_id`, for secondary tabs that learn about targets by
    /// id only.
    pub fn get_target(&self, target_id: TargetId) -> FirestoreResult<Option<Target>> {
        let state = self.lock()?;
        if let Some(data) = state.target_data_by_target.get(&target_id) {
            return Ok(Some(data.target.clone()));
        }
        run_transaction(
            self.persistence.as_ref(),
            "Get target",
            TransactionMode::ReadOnly,
            |txn| {
                Ok(self
                    .persistence
                    .get_target_cache()
                    .get_target_data_for_target_id(txn, target_id)?
                    .map(|data| data.target))
            },
        )
    }

    /// Stops tracking `target_id`. Unless `keep_persisted_target_data` is
    /// set, the target becomes eligible for garbage collection.
    pub fn release_target(
        &self,
        target_id: TargetId,
        keep_persisted_target_data: bool,
    ) -> FirestoreResult<()> {
        let mut state = self.lock()?;
        let Some(target_data) = state.target_data_by_target.get(&target_id).cloned() else {
            return Err(internal_error(format!("Tried to release nonexistent target: {target_id}")));
        };
        let mode = if keep_persisted_target_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };
        let delegate = self.persistence.reference_delegate();
        run_transaction(self.persistence.as_ref(), "Release target", mode, |txn| {
            // Watch references go away with the target; view references for
            // locally mutated documents have to be dropped explicitly.
            let removed = self.references()?.remove_references_for_id(target_id);
            for key in &removed {
                delegate.remove_reference(txn, target_id, key)?;
            }
            if !keep_persisted_target_data {
                delegate.remove_target(txn, &target_data)?;
            }
            Ok(())
        })?;

        log::debug!("released target {target_id}");
        state.target_data_by_target.remove(&target_id);
        state
            .target_id_by_target
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results`,
    /// the last limbo-free result of the query's target bounds the scan.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let state = self.lock()?;
        let target_data = self.target_data_for(&state, &query.to_target())?;
        let target_cache = self.persistence.get_target_cache();
        run_transaction(
            self.persistence.as_ref(),
            "Execute query",
            TransactionMode::ReadOnly,
            |txn| {
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(data) => (
                        data.last_limbo_free_snapshot_version,
                        target_cache.get_matching_keys_for_target_id(txn, data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), document_key_set()),
                };
                let (since, keys) = if use_previous_results {
                    (last_limbo_free, remote_keys.clone())
                } else {
                    (SnapshotVersion::min(), document_key_set())
                };
                let documents = self.query_engine.get_documents_matching_query(
                    txn,
                    &state.local_documents,
                    query,
                    since,
                    &keys,
                )?;
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            },
        )
    }

    pub fn get_remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        run_transaction(
            self.persistence.as_ref(),
            "Remote document keys",
            TransactionMode::ReadOnly,
            |txn| {
                self.persistence
                    .get_target_cache()
                    .get_matching_keys_for_target_id(txn, target_id)
            },
        )
    }

    /// Documents the remote document cache received since the previous
    /// call, as seen by a secondary tab.
    pub fn get_new_document_changes(&self) -> FirestoreResult<MaybeDocumentMap> {
        let mut state = self.lock()?;
        let since = state.last_document_change_read_time;
        let (changes, read_time) = run_transaction(
            self.persistence.as_ref(),
            "Get new document changes",
            TransactionMode::ReadOnly,
            |txn| {
                self.persistence
                    .get_remote_document_cache()
                    .get_new_document_changes(txn, since)
            },
        )?;
        state.last_document_change_read_time = read_time;
        Ok(changes)
    }

    /// Skips document changes that happened before this client started.
    pub fn synchronize_last_document_change_read_time(&self) -> FirestoreResult<()> {
        let mut state = self.lock()?;
        state.last_document_change_read_time = run_transaction(
            self.persistence.as_ref(),
            "Synchronize last document change read time",
            TransactionMode::ReadOnly,
            |txn| {
                self.persistence
                    .get_remote_document_cache()
                    .get_last_read_time(txn)
            },
        )?;
        Ok(())
    }

    pub fn get_active_targets(&self) -> FirestoreResult<ActiveTargets> {
        Ok(self.lock()?.target_data_by_target.keys().copied().collect())
    }

    pub fn collect_garbage(&self, collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        let active_targets = self.get_active_targets()?;
        run_transaction(
            self.persistence.as_ref(),
            "Collect garbage",
            TransactionMode::ReadWritePrimary,
            |txn| collector.collect(txn, &active_targets),
        )
    }
}
