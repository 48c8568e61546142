use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::error::{internal_error, FirestoreResult};
use crate::local::persistence::{IndexManager, PersistenceTransaction};
use crate::model::ResourcePath;

/// Collection parent index kept in process memory.
#[derive(Default)]
pub struct MemoryIndexManager {
    parents_by_collection_id: Mutex<BTreeMap<String, BTreeSet<ResourcePath>>>,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `collection_path` and reports whether it was new.
    pub(crate) fn add_entry(&self, collection_path: &ResourcePath) -> FirestoreResult<bool> {
        let Some(collection_id) = collection_path.last_segment() else {
            return Ok(false);
        };
        let parent = collection_path.without_last();
        let mut index = self
            .parents_by_collection_id
            .lock()
            .map_err(|_| internal_error("index manager lock poisoned"))?;
        Ok(index
            .entry(collection_id.to_string())
            .or_default()
            .insert(parent))
    }

    pub(crate) fn parents(&self, collection_id: &str) -> FirestoreResult<Vec<ResourcePath>> {
        let index = self
            .parents_by_collection_id
            .lock()
            .map_err(|_| internal_error("index manager lock poisoned"))?;
        Ok(index
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default())
    }
}

impl IndexManager for MemoryIndexManager {
    fn add_to_collection_parent_index(
        &self,
        _txn: &PersistenceTransaction,
        collection_path: &ResourcePath,
    ) -> FirestoreResult<()> {
        self.add_entry(collection_path).map(|_| ())
    }

    fn get_collection_parents(
        &self,
        _txn: &PersistenceTransaction,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        self.parents(collection_id)
    }
}
