use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::error::FirestoreResult;
use crate::local::persistence::{PersistenceTransaction, RemoteDocumentCache};
use crate::model::{
    nullable_maybe_document_map, DocumentKey, DocumentKeySet, MaybeDocument,
    NullableMaybeDocumentMap, SnapshotVersion,
};
use crate::util::assert::{fail, hard_assert};

#[derive(Clone, Debug)]
enum BufferedChange {
    Put(MaybeDocument, SnapshotVersion),
    Remove(SnapshotVersion),
}

/// Collects remote document writes of one transaction and applies them in
/// a single step, keeping the cache's byte size in sync.
///
/// Every entry must be read through the buffer before it is changed so that
/// its previous size is known.
pub struct RemoteDocumentChangeBuffer {
    cache: Arc<dyn RemoteDocumentCache>,
    track_removals: bool,
    changes: BTreeMap<DocumentKey, BufferedChange>,
    document_sizes: HashMap<DocumentKey, i64>,
    applied: bool,
}

impl RemoteDocumentChangeBuffer {
    pub fn new(cache: Arc<dyn RemoteDocumentCache>, track_removals: bool) -> Self {
        Self {
            cache,
            track_removals,
            changes: BTreeMap::new(),
            document_sizes: HashMap::new(),
            applied: false,
        }
    }

    pub fn add_entry(&mut self, doc: MaybeDocument, read_time: SnapshotVersion) {
        self.assert_not_applied();
        self.changes
            .insert(doc.key().clone(), BufferedChange::Put(doc, read_time));
    }

    pub fn remove_entry(&mut self, key: DocumentKey, read_time: SnapshotVersion) {
        self.assert_not_applied();
        self.changes.insert(key, BufferedChange::Remove(read_time));
    }

    /// Buffered state of `key` if changed, otherwise the cached entry.
    pub fn get_entry(
        &mut self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        self.assert_not_applied();
        if let Some(change) = self.changes.get(key) {
            return Ok(match change {
                BufferedChange::Put(doc, _) => Some(doc.clone()),
                BufferedChange::Remove(_) => None,
            });
        }
        let entry = self.cache.get_sized_entry(txn, key)?;
        let (doc, size) = match entry {
            Some((doc, size)) => (Some(doc), size),
            None => (None, 0),
        };
        self.document_sizes.insert(key.clone(), size);
        Ok(doc)
    }

    pub fn get_entries(
        &mut self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<NullableMaybeDocumentMap> {
        let mut results = nullable_maybe_document_map();
        for key in keys {
            let doc = self.get_entry(txn, key)?;
            results = results.insert(key.clone(), doc);
        }
        Ok(results)
    }

    /// Writes every buffered change and adjusts the cache size.
    pub fn apply(&mut self, txn: &PersistenceTransaction) -> FirestoreResult<()> {
        self.assert_not_applied();
        self.applied = true;
        let mut size_delta = 0i64;
        for (key, change) in std::mem::take(&mut self.changes) {
            let Some(previous_size) = self.document_sizes.get(&key).copied() else {
                fail(format!("Cannot modify a document that wasn't read (for {key})"));
            };
            let new_size = match change {
                BufferedChange::Put(doc, read_time) => {
                    hard_assert(
                        !read_time.is_min(),
                        "Cannot add a document with a read time of zero",
                    );
                    self.cache.put_entry(txn, &doc, read_time)?
                }
                BufferedChange::Remove(read_time) => {
                    if self.track_removals {
                        self.cache.put_removal(txn, &key, read_time)?
                    } else {
                        self.cache.delete_entry(txn, &key)?;
                        0
                    }
                }
            };
            size_delta += new_size - previous_size;
        }
        if size_delta != 0 {
            self.cache.update_size(txn, size_delta)?;
        }
        Ok(())
    }

    fn assert_not_applied(&self) {
        hard_assert(!self.applied, "Changes have already been applied.");
    }
}
