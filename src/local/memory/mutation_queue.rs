use std::collections::BTreeSet;
use std::ops::Bound::{Included, Unbounded};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::query::Query;
use crate::error::{internal_error, FirestoreResult};
use crate::local::persistence::{IndexManager, MutationQueue, PersistenceTransaction};
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, ResourcePath,
    Timestamp, BATCH_ID_UNKNOWN,
};
use crate::util::assert::hard_assert;

struct QueueState {
    /// Ordered by batch id; acknowledged batches leave from the front.
    batches: Vec<MutationBatch>,
    next_batch_id: BatchId,
    last_stream_token: Vec<u8>,
    batches_by_document_key: BTreeSet<(DocumentKey, BatchId)>,
}

pub struct MemoryMutationQueue {
    index_manager: Arc<dyn IndexManager>,
    state: Mutex<QueueState>,
}

impl MemoryMutationQueue {
    pub fn new(index_manager: Arc<dyn IndexManager>) -> Self {
        Self {
            index_manager,
            state: Mutex::new(QueueState {
                batches: Vec::new(),
                next_batch_id: 1,
                last_stream_token: Vec::new(),
                batches_by_document_key: BTreeSet::new(),
            }),
        }
    }

    fn lock(&self) -> FirestoreResult<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| internal_error("mutation queue lock poisoned"))
    }
}

/// First key of the document range under `path`.
pub(crate) fn range_start(path: &ResourcePath) -> DocumentKey {
    let start = if DocumentKey::is_document_key(path) {
        path.clone()
    } else {
        path.child([""])
    };
    DocumentKey::from_path(start).unwrap_or_else(|_| DocumentKey::empty())
}

impl QueueState {
    fn index_of_batch(&self, batch_id: BatchId) -> Option<usize> {
        self.batches
            .binary_search_by_key(&batch_id, |batch| batch.batch_id)
            .ok()
    }

    fn batches_for_ids(&self, ids: BTreeSet<BatchId>) -> Vec<MutationBatch> {
        ids.into_iter()
            .filter_map(|id| self.index_of_batch(id).map(|index| self.batches[index].clone()))
            .collect()
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> impl Iterator<Item = BatchId> + '_ {
        let key = key.clone();
        self.batches_by_document_key
            .range((Included((key.clone(), BatchId::MIN)), Unbounded))
            .take_while(move |(candidate, _)| *candidate == key)
            .map(|(_, id)| *id)
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn check_empty(&self, _txn: &PersistenceTransaction) -> FirestoreResult<bool> {
        Ok(self.lock()?.batches.is_empty())
    }

    fn acknowledge_batch(
        &self,
        _txn: &PersistenceTransaction,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut state = self.lock()?;
        let index = state.index_of_batch(batch.batch_id);
        hard_assert(
            index == Some(0),
            "Can only acknowledge the first batch in the mutation queue",
        );
        state.last_stream_token = stream_token;
        Ok(())
    }

    fn get_last_stream_token(&self, _txn: &PersistenceTransaction) -> FirestoreResult<Vec<u8>> {
        Ok(self.lock()?.last_stream_token.clone())
    }

    fn set_last_stream_token(
        &self,
        _txn: &PersistenceTransaction,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        self.lock()?.last_stream_token = stream_token;
        Ok(())
    }

    fn add_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        hard_assert(!mutations.is_empty(), "Mutation batches should not be empty");
        let batch = {
            let mut state = self.lock()?;
            let batch_id = state.next_batch_id;
            state.next_batch_id += 1;
            if let Some(previous) = state.batches.last() {
                hard_assert(
                    previous.batch_id < batch_id,
                    "Mutation batchIDs must be monotonically increasing order",
                );
            }
            let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
            for mutation in &batch.mutations {
                state
                    .batches_by_document_key
                    .insert((mutation.key().clone(), batch_id));
            }
            state.batches.push(batch.clone());
            batch
        };
        for mutation in &batch.mutations {
            self.index_manager
                .add_to_collection_parent_index(txn, &mutation.key().collection_path())?;
        }
        Ok(batch)
    }

    fn lookup_mutation_batch(
        &self,
        _txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.lock()?;
        Ok(state
            .index_of_batch(batch_id)
            .map(|index| state.batches[index].clone()))
    }

    fn lookup_mutation_keys(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<DocumentKeySet>> {
        Ok(self
            .lookup_mutation_batch(txn, batch_id)?
            .map(|batch| batch.keys()))
    }

    fn get_next_mutation_batch_after_batch_id(
        &self,
        _txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let state = self.lock()?;
        let index = state
            .batches
            .partition_point(|batch| batch.batch_id <= batch_id);
        Ok(state.batches.get(index).cloned())
    }

    fn get_highest_unacknowledged_batch_id(
        &self,
        _txn: &PersistenceTransaction,
    ) -> FirestoreResult<BatchId> {
        let state = self.lock()?;
        Ok(if state.batches.is_empty() {
            BATCH_ID_UNKNOWN
        } else {
            state.next_batch_id - 1
        })
    }

    fn get_all_mutation_batches(
        &self,
        _txn: &PersistenceTransaction,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(self.lock()?.batches.clone())
    }

    fn get_all_mutation_batches_affecting_document_key(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let state = self.lock()?;
        let ids = state.batch_ids_for_key(key).collect();
        Ok(state.batches_for_ids(ids))
    }

    fn get_all_mutation_batches_affecting_document_keys(
        &self,
        _txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let state = self.lock()?;
        let ids = keys
            .iter()
            .flat_map(|key| state.batch_ids_for_key(key).collect::<Vec<_>>())
            .collect();
        Ok(state.batches_for_ids(ids))
    }

    fn get_all_mutation_batches_affecting_query(
        &self,
        _txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        hard_assert(
            !query.is_collection_group_query(),
            "CollectionGroup queries should be handled in LocalDocumentsView",
        );
        let prefix = &query.path;
        let immediate_children_len = prefix.len() + 1;
        let state = self.lock()?;
        let ids = state
            .batches_by_document_key
            .range((Included((range_start(prefix), BatchId::MIN)), Unbounded))
            .take_while(|(key, _)| prefix.is_prefix_of(key.path()))
            .filter(|(key, _)| key.path().len() == immediate_children_len)
            .map(|(_, id)| *id)
            .collect();
        Ok(state.batches_for_ids(ids))
    }

    fn remove_mutation_batch(
        &self,
        _txn: &PersistenceTransaction,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let mut state = self.lock()?;
        let index = state.index_of_batch(batch.batch_id);
        hard_assert(
            index == Some(0),
            "Can only remove the first entry of the mutation queue",
        );
        state.batches.remove(0);
        for mutation in &batch.mutations {
            state
                .batches_by_document_key
                .remove(&(mutation.key().clone(), batch.batch_id));
        }
        Ok(())
    }

    fn perform_consistency_check(&self, _txn: &PersistenceTransaction) -> FirestoreResult<()> {
        let state = self.lock()?;
        if state.batches.is_empty() {
            hard_assert(
                state.batches_by_document_key.is_empty(),
                "Document leak -- detected dangling mutation references when queue is empty.",
            );
        }
        Ok(())
    }

    fn contains_key(&self, _txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(self.lock()?.batch_ids_for_key(key).next().is_some())
    }
}
