use crate::core::query::Query;
use crate::model::{ChangeType, DocumentKeySet, DocumentSet, DocumentViewChange};

/// The results of a query at one point in time together with what changed
/// since the previous snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    /// Removals first, then additions and modifications in query order.
    pub doc_changes: Vec<DocumentViewChange>,
    /// Documents with local writes the backend has not acknowledged.
    pub mutated_keys: DocumentKeySet,
    /// Whether the results are not yet confirmed by the backend.
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    /// A first snapshot in which every document counts as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|doc| DocumentViewChange::new(ChangeType::Added, doc.clone()))
            .collect();
        Self {
            old_docs: documents.cleared(),
            query,
            docs: documents,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}
