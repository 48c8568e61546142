use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::query::Query;
use crate::error::{internal_error, FirestoreResult};
use crate::local::memory::mutation_queue::range_start;
use crate::local::persistence::{IndexManager, PersistenceTransaction, RemoteDocumentCache};
use crate::model::{
    document_map, maybe_document_map, DocumentKey, DocumentMap, MaybeDocument, MaybeDocumentMap,
    NoDocument, SnapshotVersion,
};

/// Estimates the stored size of a document.
pub type DocumentSizer = Arc<dyn Fn(&MaybeDocument) -> i64 + Send + Sync>;

#[derive(Clone, Debug)]
struct CacheEntry {
    /// `None` for removals that are kept as tombstones.
    doc: Option<MaybeDocument>,
    size: i64,
    read_time: SnapshotVersion,
}

#[derive(Default)]
struct CacheState {
    docs: BTreeMap<DocumentKey, CacheEntry>,
    size: i64,
}

pub struct MemoryRemoteDocumentCache {
    index_manager: Arc<dyn IndexManager>,
    sizer: DocumentSizer,
    state: Mutex<CacheState>,
}

impl MemoryRemoteDocumentCache {
    pub fn new(index_manager: Arc<dyn IndexManager>, sizer: DocumentSizer) -> Self {
        Self {
            index_manager,
            sizer,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn lock(&self) -> FirestoreResult<MutexGuard<'_, CacheState>> {
        self.state
            .lock()
            .map_err(|_| internal_error("remote document cache lock poisoned"))
    }

    /// Every live key, for garbage collection bookkeeping.
    pub fn keys(&self) -> FirestoreResult<Vec<DocumentKey>> {
        Ok(self
            .lock()?
            .docs
            .iter()
            .filter(|(_, entry)| entry.doc.is_some())
            .map(|(key, _)| key.clone())
            .collect())
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn get_sized_entry(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<(MaybeDocument, i64)>> {
        Ok(self
            .lock()?
            .docs
            .get(key)
            .and_then(|entry| entry.doc.clone().map(|doc| (doc, entry.size))))
    }

    fn get_documents_matching_query(
        &self,
        _txn: &PersistenceTransaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let prefix = &query.path;
        let immediate_children_len = prefix.len() + 1;
        let state = self.lock()?;
        let mut results = document_map();
        for (key, entry) in state.docs.range(range_start(prefix)..) {
            if !prefix.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() != immediate_children_len || entry.read_time <= since_read_time {
                continue;
            }
            if let Some(MaybeDocument::Document(doc)) = &entry.doc {
                results = results.insert(key.clone(), doc.clone());
            }
        }
        Ok(results)
    }

    fn get_new_document_changes(
        &self,
        _txn: &PersistenceTransaction,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<(MaybeDocumentMap, SnapshotVersion)> {
        let state = self.lock()?;
        let mut changes = maybe_document_map();
        let mut latest = since_read_time;
        for (key, entry) in &state.docs {
            if entry.read_time <= since_read_time {
                continue;
            }
            let doc = entry.doc.clone().unwrap_or_else(|| {
                NoDocument::new(key.clone(), SnapshotVersion::min(), false).into()
            });
            changes = changes.insert(key.clone(), doc);
            latest = latest.max(entry.read_time);
        }
        Ok((changes, latest))
    }

    fn get_last_read_time(&self, _txn: &PersistenceTransaction) -> FirestoreResult<SnapshotVersion> {
        Ok(self
            .lock()?
            .docs
            .values()
            .map(|entry| entry.read_time)
            .max()
            .unwrap_or_else(SnapshotVersion::min))
    }

    fn get_size(&self, _txn: &PersistenceTransaction) -> FirestoreResult<i64> {
        Ok(self.lock()?.size)
    }

    fn put_entry(
        &self,
        txn: &PersistenceTransaction,
        doc: &MaybeDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<i64> {
        let size = (self.sizer)(doc);
        self.lock()?.docs.insert(
            doc.key().clone(),
            CacheEntry {
                doc: Some(doc.clone()),
                size,
                read_time,
            },
        );
        self.index_manager
            .add_to_collection_parent_index(txn, &doc.key().collection_path())?;
        Ok(size)
    }

    fn put_removal(
        &self,
        _txn: &PersistenceTransaction,
        key: &DocumentKey,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<i64> {
        self.lock()?.docs.insert(
            key.clone(),
            CacheEntry {
                doc: None,
                size: 0,
                read_time,
            },
        );
        Ok(0)
    }

    fn delete_entry(&self, _txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<()> {
        self.lock()?.docs.remove(key);
        Ok(())
    }

    fn update_size(&self, _txn: &PersistenceTransaction, delta: i64) -> FirestoreResult<()> {
        self.lock()?.size += delta;
        Ok(())
    }
}
