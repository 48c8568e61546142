use crate::core::target::Target;
use crate::core::target_id_generator::TargetIdGenerator;
use crate::error::FirestoreResult;
use crate::local::kv::key_builder::{prefix_range, table_range, KeyBuilder};
use crate::local::kv::local_serializer::LocalSerializer;
use crate::local::kv::schema::{
    collect_records, document_target_key, parse_path, read_record, scan_records,
    target_canonical_id_key, target_document_key, target_global_key, target_key, write_record,
    TargetDocumentRecord, TargetGlobalRecord, TargetRecord, DOCUMENT_TARGETS, SENTINEL_TARGET_ID,
    TARGETS, TARGET_CANONICAL_IDS, TARGET_DOCUMENTS,
};
use crate::local::kv::{IterControl, KvTransaction};
use crate::local::persistence::{PersistenceTransaction, TargetCache};
use crate::local::target_data::TargetData;
use crate::model::{
    document_key_set, DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, TargetId,
};
use crate::util::assert::hard_assert;

/// Targets, their document associations and the global target counters.
///
/// Association rows exist in both directions: `targetDocuments` is keyed by
/// (target id, path) and `documentTargets` by (path, target id). Rows with
/// target id 0 are LRU sentinels and never count as a target membership.
pub struct KvTargetCache {
    serializer: LocalSerializer,
}

impl KvTargetCache {
    pub fn new(serializer: LocalSerializer) -> Self {
        Self { serializer }
    }

    pub(crate) fn global(&self, store: &dyn KvTransaction) -> FirestoreResult<TargetGlobalRecord> {
        Ok(read_record(store, &target_global_key())?.unwrap_or_default())
    }

    fn save_global(&self, store: &dyn KvTransaction, global: &TargetGlobalRecord) -> FirestoreResult<()> {
        write_record(store, &target_global_key(), global)
    }

    fn save_target_data(&self, store: &dyn KvTransaction, data: &TargetData) -> FirestoreResult<()> {
        let record = self.serializer.to_target(data);
        write_record(store, &target_key(data.target_id), &record)?;
        write_record(
            store,
            &target_canonical_id_key(&record.canonical_id, data.target_id),
            &data.target_id,
        )
    }

    /// Raises the global counters to cover `data`. Returns whether anything
    /// changed.
    fn update_metadata_from_target_data(
        &self,
        global: &mut TargetGlobalRecord,
        data: &TargetData,
    ) -> bool {
        let mut updated = false;
        if data.target_id > global.highest_target_id {
            global.highest_target_id = data.target_id;
            updated = true;
        }
        if data.sequence_number > global.highest_listen_sequence_number {
            global.highest_listen_sequence_number = data.sequence_number;
            updated = true;
        }
        updated
    }

    pub(crate) fn write_association(
        &self,
        store: &dyn KvTransaction,
        target_id: TargetId,
        key: &DocumentKey,
        sequence_number: Option<ListenSequenceNumber>,
    ) -> FirestoreResult<()> {
        let record = TargetDocumentRecord {
            target_id,
            path: key.path().canonical_string(),
            sequence_number,
        };
        write_record(store, &target_document_key(target_id, key.path()), &record)?;
        write_record(store, &document_target_key(key.path(), target_id), &record)
    }

    pub(crate) fn delete_association(
        &self,
        store: &dyn KvTransaction,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> FirestoreResult<()> {
        store.delete(&target_document_key(target_id, key.path()))?;
        store.delete(&document_target_key(key.path(), target_id))
    }

    /// Every association row of `key`, sentinel first.
    pub(crate) fn associations_for_document(
        &self,
        store: &dyn KvTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<TargetDocumentRecord>> {
        collect_records(
            store,
            &prefix_range(KeyBuilder::new(DOCUMENT_TARGETS).path(key.path())),
        )
    }
}

impl TargetCache for KvTargetCache {
    fn get_last_remote_snapshot_version(
        &self,
        txn: &PersistenceTransaction,
    ) -> FirestoreResult<SnapshotVersion> {
        Ok(SnapshotVersion::from_micros(
            self.global(txn.store()?)?.last_remote_snapshot_version_micros,
        ))
    }

    fn get_highest_sequence_number(
        &self,
        txn: &PersistenceTransaction,
    ) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.global(txn.store()?)?.highest_listen_sequence_number)
    }

    fn allocate_target_id(&self, txn: &PersistenceTransaction) -> FirestoreResult<TargetId> {
        let store = txn.store()?;
        let mut global = self.global(store)?;
        let target_id = TargetIdGenerator::for_target_cache(global.highest_target_id).next_id();
        global.highest_target_id = target_id;
        self.save_global(store, &global)?;
        Ok(target_id)
    }

    fn set_targets_metadata(
        &self,
        txn: &PersistenceTransaction,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        let store = txn.store()?;
        let mut global = self.global(store)?;
        if highest_listen_sequence_number > global.highest_listen_sequence_number {
            global.highest_listen_sequence_number = highest_listen_sequence_number;
        }
        if let Some(version) = last_remote_snapshot_version {
            global.last_remote_snapshot_version_micros = version.to_micros();
        }
        self.save_global(store, &global)
    }

    fn add_target_data(&self, txn: &PersistenceTransaction, data: &TargetData) -> FirestoreResult<()> {
        let store = txn.store()?;
        hard_assert(
            store.get(&target_key(data.target_id))?.is_none(),
            format!("Adding a target that already exists: {}", data.target_id),
        );
        self.save_target_data(store, data)?;
        let mut global = self.global(store)?;
        global.target_count += 1;
        self.update_metadata_from_target_data(&mut global, data);
        self.save_global(store, &global)
    }

    fn update_target_data(
        &self,
        txn: &PersistenceTransaction,
        data: &TargetData,
    ) -> FirestoreResult<()> {
        let store = txn.store()?;
        self.save_target_data(store, data)?;
        let mut global = self.global(store)?;
        if self.update_metadata_from_target_data(&mut global, data) {
            self.save_global(store, &global)?;
        }
        Ok(())
    }

    fn remove_target_data(
        &self,
        txn: &PersistenceTransaction,
        data: &TargetData,
    ) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target_id(txn, data.target_id)?;
        let store = txn.store()?;
        store.delete(&target_key(data.target_id))?;
        store.delete(&target_canonical_id_key(
            &data.target.canonical_id(),
            data.target_id,
        ))?;
        let mut global = self.global(store)?;
        hard_assert(global.target_count > 0, "Removing from an empty target cache");
        global.target_count -= 1;
        self.save_global(store, &global)
    }

    fn get_target_count(&self, txn: &PersistenceTransaction) -> FirestoreResult<usize> {
        Ok(self.global(txn.store()?)?.target_count)
    }

    fn get_target_data(
        &self,
        txn: &PersistenceTransaction,
        target: &Target,
    ) -> FirestoreResult<Option<TargetData>> {
        let store = txn.store()?;
        let range = prefix_range(KeyBuilder::new(TARGET_CANONICAL_IDS).string(&target.canonical_id()));
        let candidates: Vec<TargetId> = collect_records(store, &range)?;
        for target_id in candidates {
            let record: Option<TargetRecord> = read_record(store, &target_key(target_id))?;
            if let Some(record) = record {
                let data = self.serializer.from_target(&record)?;
                if &data.target == target {
                    return Ok(Some(data));
                }
            }
        }
        Ok(None)
    }

    fn get_target_data_for_target_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        let record: Option<TargetRecord> = read_record(txn.store()?, &target_key(target_id))?;
        record
            .map(|record| self.serializer.from_target(&record))
            .transpose()
    }

    fn for_each_target(
        &self,
        txn: &PersistenceTransaction,
        visitor: &mut dyn FnMut(&TargetData),
    ) -> FirestoreResult<()> {
        scan_records(
            txn.store()?,
            &table_range(TARGETS),
            &mut |record: TargetRecord| {
                visitor(&self.serializer.from_target(&record)?);
                Ok(IterControl::Continue)
            },
        )
    }

    fn add_matching_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let store = txn.store()?;
        for key in keys {
            self.write_association(store, target_id, key, None)?;
        }
        Ok(())
    }

    fn remove_matching_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let store = txn.store()?;
        for key in keys {
            self.delete_association(store, target_id, key)?;
        }
        Ok(())
    }

    fn remove_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        let store = txn.store()?;
        for key in &self.get_matching_keys_for_target_id(txn, target_id)? {
            self.delete_association(store, target_id, key)?;
        }
        Ok(())
    }

    fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<DocumentKeySet> {
        let range = prefix_range(KeyBuilder::new(TARGET_DOCUMENTS).number(target_id as i64));
        let mut keys = document_key_set();
        scan_records(txn.store()?, &range, &mut |record: TargetDocumentRecord| {
            keys = keys.insert(DocumentKey::from_path(parse_path(&record.path)?)?);
            Ok(IterControl::Continue)
        })?;
        Ok(keys)
    }

    fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(self
            .associations_for_document(txn.store()?, key)?
            .iter()
            .any(|record| record.target_id != SENTINEL_TARGET_ID))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::local::kv::{KvStore, MemoryKvStore};
    use crate::local::persistence::TransactionMode;
    use crate::local::target_data::TargetPurpose;
    use crate::model::{DatabaseId, ResourcePath};
    use crate::remote::serializer::JsonProtoSerializer;

    fn cache() -> KvTargetCache {
        KvTargetCache::new(LocalSerializer::new(JsonProtoSerializer::new(
            DatabaseId::default("p"),
        )))
    }

    fn txn(store: &MemoryKvStore) -> PersistenceTransaction {
        PersistenceTransaction::new(
            "test",
            TransactionMode::ReadWrite,
            1,
            Some(store.begin(false).unwrap()),
        )
    }

    fn target_data(path: &str, target_id: TargetId, sequence_number: i64) -> TargetData {
        let target = Query::new(ResourcePath::from_string(path).unwrap()).to_target();
        TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number)
    }

    fn keys(paths: &[&str]) -> DocumentKeySet {
        paths.iter().fold(document_key_set(), |set, path| {
            set.insert(DocumentKey::from_string(path).unwrap())
        })
    }

    #[test]
    fn targets_are_found_by_target_and_id() {
        let store = MemoryKvStore::new();
        let cache = cache();
        let txn = txn(&store);
        let rooms = target_data("rooms", 2, 10);
        cache.add_target_data(&txn, &rooms).unwrap();

        assert_eq!(cache.get_target_data(&txn, &rooms.target).unwrap(), Some(rooms.clone()));
        assert_eq!(cache.get_target_data_for_target_id(&txn, 2).unwrap(), Some(rooms.clone()));
        assert_eq!(cache.get_target_count(&txn).unwrap(), 1);
        assert_eq!(cache.get_highest_sequence_number(&txn).unwrap(), 10);

        cache.remove_target_data(&txn, &rooms).unwrap();
        assert!(cache.get_target_data(&txn, &rooms.target).unwrap().is_none());
        assert_eq!(cache.get_target_count(&txn).unwrap(), 0);
    }

    #[test]
    fn allocated_ids_stay_even_and_above_existing_targets() {
        let store = MemoryKvStore::new();
        let cache = cache();
        let txn = txn(&store);
        cache.add_target_data(&txn, &target_data("rooms", 6, 1)).unwrap();
        assert_eq!(cache.allocate_target_id(&txn).unwrap(), 8);
        assert_eq!(cache.allocate_target_id(&txn).unwrap(), 10);
    }

    #[test]
    fn matching_keys_ignore_sentinel_rows() {
        let store = MemoryKvStore::new();
        let cache = cache();
        let txn = txn(&store);
        let doc = DocumentKey::from_string("rooms/a").unwrap();
        cache
            .write_association(txn.store().unwrap(), SENTINEL_TARGET_ID, &doc, Some(3))
            .unwrap();
        assert!(!cache.contains_key(&txn, &doc).unwrap());

        cache.add_matching_keys(&txn, &keys(&["rooms/a", "rooms/b"]), 4).unwrap();
        assert!(cache.contains_key(&txn, &doc).unwrap());
        assert_eq!(cache.get_matching_keys_for_target_id(&txn, 4).unwrap().len(), 2);

        cache.remove_matching_keys_for_target_id(&txn, 4).unwrap();
        assert!(!cache.contains_key(&txn, &doc).unwrap());
        assert_eq!(
            cache.associations_for_document(txn.store().unwrap(), &doc).unwrap().len(),
            1
        );
    }

    #[test]
    fn metadata_tracks_remote_snapshot_version() {
        let store = MemoryKvStore::new();
        let cache = cache();
        let txn = txn(&store);
        let version = SnapshotVersion::from_micros(42_000_000);
        cache.set_targets_metadata(&txn, 7, Some(version)).unwrap();
        assert_eq!(cache.get_last_remote_snapshot_version(&txn).unwrap(), version);
        assert_eq!(cache.get_highest_sequence_number(&txn).unwrap(), 7);
    }
}
