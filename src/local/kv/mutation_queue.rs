use std::collections::BTreeSet;
use std::sync::Arc;

use crate::core::query::Query;
use crate::error::FirestoreResult;
use crate::local::kv::key_builder::prefix_range;
use crate::local::kv::local_serializer::LocalSerializer;
use crate::local::kv::schema::{
    collect_records, document_mutation_key, document_mutation_prefix, mutation_key,
    mutation_queue_key, mutations_prefix, parse_path, read_record, scan_records, write_record,
    DocumentMutationRecord, MutationBatchRecord, MutationQueueRecord,
};
use crate::local::kv::{IterControl, KvTransaction};
use crate::local::persistence::{IndexManager, MutationQueue, PersistenceTransaction};
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::util::assert::hard_assert;

/// Mutation queue of one user in the durable store.
pub struct KvMutationQueue {
    user_id: String,
    serializer: LocalSerializer,
    index_manager: Arc<dyn IndexManager>,
}

impl KvMutationQueue {
    pub fn new(
        user_id: impl Into<String>,
        serializer: LocalSerializer,
        index_manager: Arc<dyn IndexManager>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            serializer,
            index_manager,
        }
    }

    fn queue_record(&self, store: &dyn KvTransaction) -> FirestoreResult<MutationQueueRecord> {
        Ok(read_record(store, &mutation_queue_key(&self.user_id))?.unwrap_or_else(|| {
            MutationQueueRecord {
                user_id: self.user_id.clone(),
                last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
                highest_batch_id: BATCH_ID_UNKNOWN,
                last_stream_token: String::new(),
            }
        }))
    }

    fn first_batch_id(&self, store: &dyn KvTransaction) -> FirestoreResult<Option<BatchId>> {
        let mut first = None;
        scan_records(
            store,
            &prefix_range(mutations_prefix(&self.user_id)),
            &mut |record: MutationBatchRecord| {
                first = Some(record.batch_id);
                Ok(IterControl::Stop)
            },
        )?;
        Ok(first)
    }

    fn batches_for_ids(
        &self,
        store: &dyn KvTransaction,
        ids: BTreeSet<BatchId>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(ids.len());
        for id in ids {
            let record: Option<MutationBatchRecord> =
                read_record(store, &mutation_key(&self.user_id, id))?;
            match record {
                Some(record) => batches.push(self.serializer.from_mutation_batch(&record)?),
                None => log::warn!("dangling document-mutation reference to batch {id}"),
            }
        }
        Ok(batches)
    }

    fn batch_ids_for_key(
        &self,
        store: &dyn KvTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<BTreeSet<BatchId>> {
        let range = prefix_range(document_mutation_prefix(&self.user_id).path(key.path()));
        Ok(collect_records::<DocumentMutationRecord>(store, &range)?
            .into_iter()
            .map(|record| record.batch_id)
            .collect())
    }
}

impl MutationQueue for KvMutationQueue {
    fn check_empty(&self, txn: &PersistenceTransaction) -> FirestoreResult<bool> {
        Ok(self.first_batch_id(txn.store()?)?.is_none())
    }

    fn acknowledge_batch(
        &self,
        txn: &PersistenceTransaction,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let store = txn.store()?;
        let mut record = self.queue_record(store)?;
        hard_assert(
            batch.batch_id > record.last_acknowledged_batch_id,
            "Mutation batchIDs must be acknowledged in order",
        );
        record.last_acknowledged_batch_id = batch.batch_id;
        record.last_stream_token = crate::util::base64::encode(&stream_token);
        write_record(store, &mutation_queue_key(&self.user_id), &record)
    }

    fn get_last_stream_token(&self, txn: &PersistenceTransaction) -> FirestoreResult<Vec<u8>> {
        let record = self.queue_record(txn.store()?)?;
        crate::util::base64::decode(&record.last_stream_token)
    }

    fn set_last_stream_token(
        &self,
        txn: &PersistenceTransaction,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let store = txn.store()?;
        let mut record = self.queue_record(store)?;
        record.last_stream_token = crate::util::base64::encode(&stream_token);
        write_record(store, &mutation_queue_key(&self.user_id), &record)
    }

    fn add_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        hard_assert(!mutations.is_empty(), "Mutation batches should not be empty");
        let store = txn.store()?;
        let mut queue = self.queue_record(store)?;
        let batch_id = queue.highest_batch_id.max(queue.last_acknowledged_batch_id).max(0) + 1;
        queue.highest_batch_id = batch_id;
        write_record(store, &mutation_queue_key(&self.user_id), &queue)?;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        let record = self.serializer.to_mutation_batch(&self.user_id, &batch);
        write_record(store, &mutation_key(&self.user_id, batch_id), &record)?;
        for mutation in &batch.mutations {
            let path = mutation.key().path();
            write_record(
                store,
                &document_mutation_key(&self.user_id, path, batch_id),
                &DocumentMutationRecord {
                    path: path.canonical_string(),
                    batch_id,
                },
            )?;
            self.index_manager
                .add_to_collection_parent_index(txn, &mutation.key().collection_path())?;
        }
        Ok(batch)
    }

    fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let record: Option<MutationBatchRecord> =
            read_record(txn.store()?, &mutation_key(&self.user_id, batch_id))?;
        record
            .map(|record| self.serializer.from_mutation_batch(&record))
            .transpose()
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
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let store = txn.store()?;
        let queue = self.queue_record(store)?;
        let next_batch_id = batch_id.max(queue.last_acknowledged_batch_id) + 1;
        let (_, end) = prefix_range(mutations_prefix(&self.user_id));
        let start = mutation_key(&self.user_id, next_batch_id);
        let mut found = None;
        scan_records(store, &(start, end), &mut |record: MutationBatchRecord| {
            found = Some(record);
            Ok(IterControl::Stop)
        })?;
        found
            .map(|record| self.serializer.from_mutation_batch(&record))
            .transpose()
    }

    fn get_highest_unacknowledged_batch_id(
        &self,
        txn: &PersistenceTransaction,
    ) -> FirestoreResult<BatchId> {
        let (start, end) = prefix_range(mutations_prefix(&self.user_id));
        let mut highest = BATCH_ID_UNKNOWN;
        txn.store()?.scan_reverse(&start, &end, &mut |_, value| {
            let record: MutationBatchRecord = crate::local::kv::schema::decode_record(value)?;
            highest = record.batch_id;
            Ok(IterControl::Stop)
        })?;
        Ok(highest)
    }

    fn get_all_mutation_batches(
        &self,
        txn: &PersistenceTransaction,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        collect_records::<MutationBatchRecord>(
            txn.store()?,
            &prefix_range(mutations_prefix(&self.user_id)),
        )?
        .iter()
        .map(|record| self.serializer.from_mutation_batch(record))
        .collect()
    }

    fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let store = txn.store()?;
        let ids = self.batch_ids_for_key(store, key)?;
        self.batches_for_ids(store, ids)
    }

    fn get_all_mutation_batches_affecting_document_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let store = txn.store()?;
        let mut ids = BTreeSet::new();
        for key in keys {
            ids.extend(self.batch_ids_for_key(store, key)?);
        }
        self.batches_for_ids(store, ids)
    }

    fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        hard_assert(
            !query.is_collection_group_query(),
            "CollectionGroup queries should be handled in LocalDocumentsView",
        );
        let store = txn.store()?;
        let immediate_children_len = query.path.len() + 1;
        let range = prefix_range(document_mutation_prefix(&self.user_id).path_prefix(&query.path));
        let mut ids = BTreeSet::new();
        scan_records(store, &range, &mut |record: DocumentMutationRecord| {
            if parse_path(&record.path)?.len() == immediate_children_len {
                ids.insert(record.batch_id);
            }
            Ok(IterControl::Continue)
        })?;
        self.batches_for_ids(store, ids)
    }

    fn remove_mutation_batch(
        &self,
        txn: &PersistenceTransaction,
        batch: &MutationBatch,
    ) -> FirestoreResult<()> {
        let store = txn.store()?;
        let key = mutation_key(&self.user_id, batch.batch_id);
        hard_assert(
            store.get(&key)?.is_some(),
            format!("Dangling mutation batch {}", batch.batch_id),
        );
        store.delete(&key)?;
        for mutation in &batch.mutations {
            store.delete(&document_mutation_key(
                &self.user_id,
                mutation.key().path(),
                batch.batch_id,
            ))?;
        }
        Ok(())
    }

    fn perform_consistency_check(&self, txn: &PersistenceTransaction) -> FirestoreResult<()> {
        let store = txn.store()?;
        if self.first_batch_id(store)?.is_some() {
            return Ok(());
        }
        let dangling = collect_records::<DocumentMutationRecord>(
            store,
            &prefix_range(document_mutation_prefix(&self.user_id)),
        )?;
        hard_assert(
            dangling.is_empty(),
            format!(
                "Document leak -- detected dangling mutation references when queue is empty. \
                 Dangling keys: {:?}",
                dangling.iter().map(|record| &record.path).collect::<Vec<_>>()
            ),
        );
        Ok(())
    }

    fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(!self.batch_ids_for_key(txn.store()?, key)?.is_empty())
    }
}
