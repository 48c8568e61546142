use std::sync::{Arc, Mutex};

use crate::error::{internal_error, FirestoreResult};
use crate::local::kv::key_builder::{prefix_range, table_range, KeyBuilder};
use crate::local::kv::schema::{
    collect_records, parse_path, scan_records, MutationQueueRecord, TargetDocumentRecord,
    DOCUMENT_MUTATIONS, DOCUMENT_TARGETS, MUTATION_QUEUES, SENTINEL_TARGET_ID,
};
use crate::local::kv::target_cache::KvTargetCache;
use crate::local::kv::{IterControl, KvRemoteDocumentCache};
use crate::local::lru::LruDelegate;
use crate::local::persistence::{
    new_change_buffer, ActiveTargets, PersistenceTransaction, ReferenceDelegate,
    RemoteDocumentCache, TargetCache,
};
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Reference tracking of the durable persistence.
///
/// Instead of counting references, every touch of a document records the
/// current sequence number in the document's sentinel row. Collection later
/// removes documents whose sentinel is the only association left.
pub struct KvLruDelegate {
    target_cache: Arc<KvTargetCache>,
    remote_document_cache: Arc<KvRemoteDocumentCache>,
    in_memory_pins: Mutex<Option<Arc<Mutex<ReferenceSet>>>>,
}

/// A document and the association rows found for it during a scan.
struct DocumentAssociations {
    key: DocumentKey,
    sentinel_sequence_number: Option<ListenSequenceNumber>,
    in_target: bool,
}

impl KvLruDelegate {
    pub fn new(
        target_cache: Arc<KvTargetCache>,
        remote_document_cache: Arc<KvRemoteDocumentCache>,
    ) -> Self {
        Self {
            target_cache,
            remote_document_cache,
            in_memory_pins: Mutex::new(None),
        }
    }

    fn write_sentinel(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<()> {
        self.target_cache.write_association(
            txn.store()?,
            SENTINEL_TARGET_ID,
            key,
            Some(txn.current_sequence_number()),
        )
    }

    /// Groups the `documentTargets` rows by document, in key order.
    fn for_each_document(
        &self,
        txn: &PersistenceTransaction,
        visitor: &mut dyn FnMut(DocumentAssociations) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        let mut current: Option<DocumentAssociations> = None;
        let mut rows: Vec<TargetDocumentRecord> = Vec::new();
        scan_records(
            txn.store()?,
            &table_range(DOCUMENT_TARGETS),
            &mut |record: TargetDocumentRecord| {
                rows.push(record);
                Ok(IterControl::Continue)
            },
        )?;
        for row in rows {
            let key = DocumentKey::from_path(parse_path(&row.path)?)?;
            if current.as_ref().is_some_and(|group| group.key != key) {
                if let Some(group) = current.take() {
                    visitor(group)?;
                }
            }
            let group = current.get_or_insert_with(|| DocumentAssociations {
                key,
                sentinel_sequence_number: None,
                in_target: false,
            });
            if row.target_id == SENTINEL_TARGET_ID {
                group.sentinel_sequence_number = row.sequence_number;
            } else {
                group.in_target = true;
            }
        }
        if let Some(group) = current {
            visitor(group)?;
        }
        Ok(())
    }

    fn is_pinned(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
        let pins = self
            .in_memory_pins
            .lock()
            .map_err(|_| internal_error("in-memory pins lock poisoned"))?
            .clone();
        if let Some(pins) = pins {
            if pins
                .lock()
                .map_err(|_| internal_error("in-memory pins lock poisoned"))?
                .contains_key(key)
            {
                return Ok(true);
            }
        }
        self.mutation_queues_contain_key(txn, key)
    }

    /// Whether any user's mutation queue still writes `key`.
    fn mutation_queues_contain_key(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<bool> {
        let store = txn.store()?;
        let queues: Vec<MutationQueueRecord> =
            collect_records(store, &table_range(MUTATION_QUEUES))?;
        for queue in queues {
            let range = prefix_range(
                KeyBuilder::new(DOCUMENT_MUTATIONS)
                    .string(&queue.user_id)
                    .path(key.path()),
            );
            let mut found = false;
            store.scan(&range.0, &range.1, &mut |_, _| {
                found = true;
                Ok(IterControl::Stop)
            })?;
            if found {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl ReferenceDelegate for KvLruDelegate {
    fn set_in_memory_pins(&self, pins: Arc<Mutex<ReferenceSet>>) {
        if let Ok(mut slot) = self.in_memory_pins.lock() {
            *slot = Some(pins);
        }
    }

    fn add_reference(
        &self,
        txn: &PersistenceTransaction,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.write_sentinel(txn, key)
    }

    fn remove_reference(
        &self,
        txn: &PersistenceTransaction,
        _target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.write_sentinel(txn, key)
    }

    /// Released targets stay cached until collected; only their last use is
    /// recorded.
    fn remove_target(&self, txn: &PersistenceTransaction, data: &TargetData) -> FirestoreResult<()> {
        let updated = data.with_sequence_number(txn.current_sequence_number());
        self.target_cache.update_target_data(txn, &updated)
    }

    fn mark_potentially_orphaned(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.write_sentinel(txn, key)
    }

    fn update_limbo_document(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        self.write_sentinel(txn, key)
    }
}

impl LruDelegate for KvLruDelegate {
    fn get_sequence_number_count(&self, txn: &PersistenceTransaction) -> FirestoreResult<usize> {
        let targets = self.target_cache.get_target_count(txn)?;
        let mut orphaned = 0usize;
        self.for_each_orphaned_document(txn, &mut |_| orphaned += 1)?;
        Ok(targets + orphaned)
    }

    fn for_each_target(
        &self,
        txn: &PersistenceTransaction,
        visitor: &mut dyn FnMut(&TargetData),
    ) -> FirestoreResult<()> {
        self.target_cache.for_each_target(txn, visitor)
    }

    fn for_each_orphaned_document(
        &self,
        txn: &PersistenceTransaction,
        visitor: &mut dyn FnMut(ListenSequenceNumber),
    ) -> FirestoreResult<()> {
        self.for_each_document(txn, &mut |group| {
            if !group.in_target {
                if let Some(sequence_number) = group.sentinel_sequence_number {
                    visitor(sequence_number);
                }
            }
            Ok(())
        })
    }

    fn remove_targets(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_targets: &ActiveTargets,
    ) -> FirestoreResult<usize> {
        let mut doomed = Vec::new();
        self.target_cache.for_each_target(txn, &mut |data| {
            if data.sequence_number <= upper_bound && !active_targets.contains(&data.target_id) {
                doomed.push(data.clone());
            }
        })?;
        for data in &doomed {
            for key in &self
                .target_cache
                .get_matching_keys_for_target_id(txn, data.target_id)?
            {
                self.write_sentinel(txn, key)?;
            }
            self.target_cache.remove_target_data(txn, data)?;
        }
        Ok(doomed.len())
    }

    fn remove_orphaned_documents(
        &self,
        txn: &PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
    ) -> FirestoreResult<usize> {
        let mut candidates = Vec::new();
        self.for_each_document(txn, &mut |group| {
            let expired = group
                .sentinel_sequence_number
                .is_some_and(|sequence_number| sequence_number <= upper_bound);
            if !group.in_target && expired {
                candidates.push(group.key);
            }
            Ok(())
        })?;

        let cache: Arc<dyn RemoteDocumentCache> = self.remote_document_cache.clone();
        let mut buffer = new_change_buffer(cache, false);
        let mut removed = 0;
        for key in candidates {
            if self.is_pinned(txn, &key)? {
                continue;
            }
            buffer.get_entry(txn, &key)?;
            buffer.remove_entry(key.clone(), SnapshotVersion::min());
            self.target_cache
                .delete_association(txn.store()?, SENTINEL_TARGET_ID, &key)?;
            removed += 1;
        }
        buffer.apply(txn)?;
        Ok(removed)
    }

    fn get_cache_size(&self, txn: &PersistenceTransaction) -> FirestoreResult<i64> {
        self.remote_document_cache.get_size(txn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::local::kv::{KvIndexManager, KvStore, LocalSerializer, MemoryKvStore};
    use crate::local::persistence::TransactionMode;
    use crate::local::target_data::TargetPurpose;
    use crate::model::{
        document_key_set, DatabaseId, Document, MaybeDocument, ObjectValue, ResourcePath,
    };
    use crate::remote::serializer::JsonProtoSerializer;
    use std::collections::HashSet;

    struct Fixture {
        store: MemoryKvStore,
        delegate: KvLruDelegate,
        targets: Arc<KvTargetCache>,
        documents: Arc<KvRemoteDocumentCache>,
    }

    fn fixture() -> Fixture {
        let serializer = LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("p")));
        let targets = Arc::new(KvTargetCache::new(serializer.clone()));
        let documents = Arc::new(KvRemoteDocumentCache::new(
            serializer,
            Arc::new(KvIndexManager::new()),
        ));
        Fixture {
            store: MemoryKvStore::new(),
            delegate: KvLruDelegate::new(targets.clone(), documents.clone()),
            targets,
            documents,
        }
    }

    fn txn(store: &MemoryKvStore, sequence_number: ListenSequenceNumber) -> PersistenceTransaction {
        PersistenceTransaction::new(
            "lru",
            TransactionMode::ReadWritePrimary,
            sequence_number,
            Some(store.begin(false).unwrap()),
        )
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn cache_document(fixture: &Fixture, txn: &PersistenceTransaction, path: &str) {
        let cache: Arc<dyn RemoteDocumentCache> = fixture.documents.clone();
        let mut buffer = new_change_buffer(cache, false);
        buffer.get_entry(txn, &key(path)).unwrap();
        let version = SnapshotVersion::from_micros(1_000);
        buffer.add_entry(
            MaybeDocument::from(Document::synced(key(path), version, ObjectValue::empty())),
            version,
        );
        buffer.apply(txn).unwrap();
    }

    #[test]
    fn orphaned_documents_at_or_below_bound_are_removed() {
        let fixture = fixture();
        let txn = txn(&fixture.store, 5);
        cache_document(&fixture, &txn, "rooms/old");
        cache_document(&fixture, &txn, "rooms/kept");
        fixture
            .delegate
            .mark_potentially_orphaned(&txn, &key("rooms/old"))
            .unwrap();
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        fixture
            .targets
            .add_target_data(&txn, &TargetData::new(target, 2, TargetPurpose::Listen, 5))
            .unwrap();
        fixture
            .targets
            .add_matching_keys(&txn, &document_key_set().insert(key("rooms/kept")), 2)
            .unwrap();
        fixture.delegate.add_reference(&txn, 2, &key("rooms/kept")).unwrap();

        assert_eq!(fixture.delegate.get_sequence_number_count(&txn).unwrap(), 2);
        assert_eq!(fixture.delegate.remove_orphaned_documents(&txn, 5).unwrap(), 1);
        assert!(fixture.documents.get_entry(&txn, &key("rooms/old")).unwrap().is_none());
        assert!(fixture.documents.get_entry(&txn, &key("rooms/kept")).unwrap().is_some());
    }

    #[test]
    fn active_and_recent_targets_survive() {
        let fixture = fixture();
        let txn = txn(&fixture.store, 1);
        let rooms = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let users = Query::new(ResourcePath::from_string("users").unwrap()).to_target();
        let halls = Query::new(ResourcePath::from_string("halls").unwrap()).to_target();
        for (target, id, sequence_number) in [(rooms, 2, 1), (users, 4, 1), (halls, 6, 9)] {
            fixture
                .targets
                .add_target_data(&txn, &TargetData::new(target, id, TargetPurpose::Listen, sequence_number))
                .unwrap();
        }
        let active: HashSet<TargetId> = [4].into_iter().collect();
        assert_eq!(fixture.delegate.remove_targets(&txn, 1, &active).unwrap(), 1);
        assert_eq!(fixture.targets.get_target_count(&txn).unwrap(), 2);
        assert!(fixture.targets.get_target_data_for_target_id(&txn, 2).unwrap().is_none());
    }

    #[test]
    fn pinned_documents_are_not_removed() {
        let fixture = fixture();
        let pins = Arc::new(Mutex::new(ReferenceSet::new()));
        pins.lock().unwrap().add_reference(key("rooms/a"), 2);
        fixture.delegate.set_in_memory_pins(pins);
        let txn = txn(&fixture.store, 3);
        cache_document(&fixture, &txn, "rooms/a");
        fixture.delegate.remove_reference(&txn, 2, &key("rooms/a")).unwrap();
        assert_eq!(fixture.delegate.remove_orphaned_documents(&txn, 10).unwrap(), 0);
        assert!(fixture.documents.get_entry(&txn, &key("rooms/a")).unwrap().is_some());
    }
}
