use std::sync::Arc;

use crate::error::FirestoreResult;
use crate::local::kv::key_builder::{prefix_range, KeyBuilder};
use crate::local::kv::schema::{
    collect_records, collection_parent_key, parse_path, write_record, CollectionParentRecord,
    COLLECTION_PARENTS,
};
use crate::local::memory::MemoryIndexManager;
use crate::local::persistence::{IndexManager, PersistenceTransaction};
use crate::model::ResourcePath;

/// Collection parent index stored in the durable store, fronted by an
/// in-memory cache of the entries known to be written.
#[derive(Default)]
pub struct KvIndexManager {
    written: Arc<MemoryIndexManager>,
}

impl KvIndexManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IndexManager for KvIndexManager {
    fn add_to_collection_parent_index(
        &self,
        txn: &PersistenceTransaction,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(());
        };
        let parent = collection_path.without_last();
        if self.written.parents(collection_id)?.contains(&parent) {
            return Ok(());
        }
        write_record(
            txn.store()?,
            &collection_parent_key(collection_id, &parent),
            &CollectionParentRecord {
                collection_id: collection_id.to_string(),
                parent: parent.canonical_string(),
            },
        )?;
        let written = Arc::clone(&self.written);
        let collection_path = collection_path.clone();
        txn.add_on_committed_listener(move || {
            if let Err(err) = written.add_entry(&collection_path) {
                log::warn!("failed to cache collection parent: {err}");
            }
        });
        Ok(())
    }

    fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        let range = prefix_range(KeyBuilder::new(COLLECTION_PARENTS).string(collection_id));
        collect_records::<CollectionParentRecord>(txn.store()?, &range)?
            .into_iter()
            .map(|record| {
                if record.parent.is_empty() {
                    Ok(ResourcePath::root())
                } else {
                    parse_path(&record.parent)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::kv::{KvStore, MemoryKvStore};
    use crate::local::persistence::TransactionMode;

    fn path(value: &str) -> ResourcePath {
        ResourcePath::from_string(value).unwrap()
    }

    #[test]
    fn parents_are_persisted_per_collection_id() {
        let store = MemoryKvStore::new();
        let index = KvIndexManager::new();
        let txn = PersistenceTransaction::new(
            "index",
            TransactionMode::ReadWrite,
            1,
            Some(store.begin(false).unwrap()),
        );
        index.add_to_collection_parent_index(&txn, &path("rooms")).unwrap();
        index
            .add_to_collection_parent_index(&txn, &path("rooms/a/messages"))
            .unwrap();
        index
            .add_to_collection_parent_index(&txn, &path("rooms/b/messages"))
            .unwrap();
        txn.commit().unwrap();

        let reader = KvIndexManager::new();
        let txn = PersistenceTransaction::new(
            "read",
            TransactionMode::ReadOnly,
            1,
            Some(store.begin(true).unwrap()),
        );
        assert_eq!(
            reader.get_collection_parents(&txn, "messages").unwrap(),
            vec![path("rooms/a"), path("rooms/b")]
        );
        assert_eq!(
            reader.get_collection_parents(&txn, "rooms").unwrap(),
            vec![ResourcePath::root()]
        );
    }
}
