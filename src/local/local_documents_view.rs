use std::sync::Arc;

use crate::core::query::Query;
use crate::error::FirestoreResult;
use crate::local::persistence::{
    IndexManager, MutationQueue, PersistenceTransaction, RemoteDocumentCache,
};
use crate::model::{
    document_map, maybe_document_map, DocumentKey, DocumentKeySet, DocumentMap, MaybeDocument,
    MaybeDocumentMap, MutationBatch, NoDocument, NullableMaybeDocumentMap, SnapshotVersion,
};

/// Local view of documents: the remote document cache with every pending
/// mutation batch of the current user applied on top.
#[derive(Clone)]
pub struct LocalDocumentsView {
    remote_document_cache: Arc<dyn RemoteDocumentCache>,
    mutation_queue: Arc<dyn MutationQueue>,
    index_manager: Arc<dyn IndexManager>,
}

impl LocalDocumentsView {
    pub fn new(
        remote_document_cache: Arc<dyn RemoteDocumentCache>,
        mutation_queue: Arc<dyn MutationQueue>,
        index_manager: Arc<dyn IndexManager>,
    ) -> Self {
        Self {
            remote_document_cache,
            mutation_queue,
            index_manager,
        }
    }

    /// The local view of `key`, or `None` if the document is unknown both
    /// locally and remotely.
    pub fn get_document(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<MaybeDocument>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_key(txn, key)?;
        self.get_document_internal(txn, key, &batches)
    }

    fn get_document_internal(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
        batches: &[MutationBatch],
    ) -> FirestoreResult<Option<MaybeDocument>> {
        let mut document = self.remote_document_cache.get_entry(txn, key)?;
        for batch in batches {
            document = batch.apply_to_local_view(key, document);
        }
        Ok(document)
    }

    fn apply_local_mutations_to_documents(
        docs: &NullableMaybeDocumentMap,
        batches: &[MutationBatch],
    ) -> NullableMaybeDocumentMap {
        let mut results = docs.clone();
        for (key, base_doc) in docs.iter() {
            let mut local_view = base_doc.clone();
            for batch in batches {
                local_view = batch.apply_to_local_view(key, local_view);
            }
            results = results.insert(key.clone(), local_view);
        }
        results
    }

    /// Local views of `keys`. Keys without any document map to a
    /// `NoDocument` at the minimum version.
    pub fn get_documents(
        &self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let base_docs = self.remote_document_cache.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, &base_docs)
    }

    /// Like [`get_documents`](Self::get_documents) for documents already read
    /// from the remote document cache.
    pub fn get_local_view_of_documents(
        &self,
        txn: &PersistenceTransaction,
        base_docs: &NullableMaybeDocumentMap,
    ) -> FirestoreResult<MaybeDocumentMap> {
        let keys: DocumentKeySet = base_docs
            .keys()
            .fold(crate::model::document_key_set(), |keys, key| keys.insert(key.clone()));
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, &keys)?;
        let docs = Self::apply_local_mutations_to_documents(base_docs, &batches);
        Ok(docs.iter().fold(maybe_document_map(), |results, (key, doc)| {
            let doc = doc
                .clone()
                .unwrap_or_else(|| NoDocument::new(key.clone(), SnapshotVersion::min(), false).into());
            results.insert(key.clone(), doc)
        }))
    }

    /// Documents matching `query` in the local view, considering remote
    /// documents read after `since_read_time` only.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_document_query() {
            self.get_documents_matching_document_query(txn, query)
        } else if query.is_collection_group_query() {
            self.get_documents_matching_collection_group_query(txn, query, since_read_time)
        } else {
            self.get_documents_matching_collection_query(txn, query, since_read_time)
        }
    }

    fn get_documents_matching_document_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<DocumentMap> {
        let key = DocumentKey::from_path(query.path.clone())?;
        let mut results = document_map();
        if let Some(MaybeDocument::Document(doc)) = self.get_document(txn, &key)? {
            results = results.insert(key, doc);
        }
        Ok(results)
    }

    fn get_documents_matching_collection_group_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let Some(collection_id) = query.collection_group.as_deref() else {
            return Ok(document_map());
        };
        let mut results = document_map();
        for parent in self.index_manager.get_collection_parents(txn, collection_id)? {
            let collection_query = query.as_collection_query_at_path(parent.child([collection_id]));
            let docs =
                self.get_documents_matching_collection_query(txn, &collection_query, since_read_time)?;
            for (key, doc) in docs.iter() {
                results = results.insert(key.clone(), doc.clone());
            }
        }
        Ok(results)
    }

    fn get_documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let mut results = self
            .remote_document_cache
            .get_documents_matching_query(txn, query, since_read_time)?;
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_query(txn, query)?;
        for batch in &batches {
            for mutation in &batch.mutations {
                let key = mutation.key();
                if !query.path.is_immediate_parent_of(key.path()) {
                    continue;
                }
                let base_doc = results.get(key).cloned().map(MaybeDocument::from);
                let mutated = mutation.apply_to_local_view(
                    base_doc.as_ref(),
                    base_doc.as_ref(),
                    batch.local_write_time,
                );
                results = match mutated {
                    Some(MaybeDocument::Document(doc)) => results.insert(key.clone(), doc),
                    _ => results.remove(key),
                };
            }
        }
        Ok(results
            .iter()
            .filter(|(_, doc)| query.matches(doc))
            .fold(document_map(), |matching, (key, doc)| {
                matching.insert(key.clone(), doc.clone())
            }))
    }
}
