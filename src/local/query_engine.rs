//! Query execution against the local cache without secondary indexes.
//!
//! A query that was last synced with the backend while free of limbo
//! documents only needs to look at the documents it matched back then plus
//! whatever changed since. Limit queries whose boundary document may have
//! moved fall back to a full collection scan.

use crate::core::query::{LimitType, Query};
use crate::error::FirestoreResult;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{DocumentKeySet, DocumentMap, DocumentSet, MaybeDocumentMap, SnapshotVersion};

#[derive(Clone, Copy, Debug, Default)]
pub struct IndexFreeQueryEngine;

impl IndexFreeQueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        view: &LocalDocumentsView,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return self.execute_full_collection_scan(txn, view, query);
        }

        let documents = view.get_documents(txn, remote_keys)?;
        let previous_results = Self::apply_query(query, &documents);

        if (query.has_limit_to_first() || query.has_limit_to_last())
            && Self::needs_refill(
                query.limit_type,
                &previous_results,
                remote_keys,
                last_limbo_free_snapshot_version,
            )
        {
            return self.execute_full_collection_scan(txn, view, query);
        }

        log::debug!(
            "re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        );

        let mut updated_results =
            view.get_documents_matching_query(txn, query, last_limbo_free_snapshot_version)?;
        // Documents that matched before but were not updated since are not
        // returned by the incremental read.
        for doc in previous_results.iter() {
            updated_results = updated_results.insert(doc.key().clone(), doc.clone());
        }
        Ok(updated_results)
    }

    fn apply_query(query: &Query, documents: &MaybeDocumentMap) -> DocumentSet {
        documents
            .values()
            .filter_map(|maybe_doc| maybe_doc.as_document())
            .filter(|doc| query.matches(doc))
            .fold(DocumentSet::new(query.doc_comparator()), |set, doc| {
                set.add(doc.clone())
            })
    }

    /// Whether a limit query may now include documents it did not match
    /// before, which only a full scan can find.
    fn needs_refill(
        limit_type: LimitType,
        sorted_previous_results: &DocumentSet,
        remote_keys: &DocumentKeySet,
        limbo_free_snapshot_version: SnapshotVersion,
    ) -> bool {
        // A previously matching document no longer matches, so the result
        // has room for another one.
        if remote_keys.len() != sorted_previous_results.len() {
            return true;
        }
        let edge = match limit_type {
            LimitType::First => sorted_previous_results.last(),
            LimitType::Last => sorted_previous_results.first(),
        };
        match edge {
            None => false,
            Some(doc) => doc.has_pending_writes() || doc.version() > limbo_free_snapshot_version,
        }
    }

    fn execute_full_collection_scan(
        &self,
        txn: &PersistenceTransaction,
        view: &LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<DocumentMap> {
        log::debug!("using full collection scan to execute query: {}", query.canonical_id());
        view.get_documents_matching_query(txn, query, SnapshotVersion::min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::{Direction, OrderBy};
    use crate::model::{document_key_set, Document, DocumentKey, FieldPath, ObjectValue, Timestamp};
    use crate::value::FirestoreValue;
    use std::collections::BTreeMap;

    fn doc(path: &str, order: i64, seconds: i64, pending: bool) -> Document {
        let mut fields = BTreeMap::new();
        fields.insert("order".to_string(), FirestoreValue::from_integer(order));
        let version = SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0));
        let state = if pending {
            crate::model::DocumentState::LocalMutations
        } else {
            crate::model::DocumentState::Synced
        };
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            version,
            ObjectValue::from_map(fields),
            state,
        )
    }

    fn query() -> Query {
        Query::new(crate::model::ResourcePath::from_string("c").unwrap())
            .with_order_by(OrderBy::new(
                FieldPath::from_dot_separated("order").unwrap(),
                Direction::Ascending,
            ))
            .with_limit_to_first(2)
    }

    fn previous(docs: &[Document]) -> (DocumentSet, DocumentKeySet) {
        let query = query();
        docs.iter().fold(
            (DocumentSet::new(query.doc_comparator()), document_key_set()),
            |(set, keys), doc| (set.add(doc.clone()), keys.insert(doc.key().clone())),
        )
    }

    #[test]
    fn refill_when_a_previous_match_dropped_out() {
        let (set, _) = previous(&[doc("c/a", 1, 1, false)]);
        let keys = document_key_set()
            .insert(DocumentKey::from_string("c/a").unwrap())
            .insert(DocumentKey::from_string("c/b").unwrap());
        let limbo_free = SnapshotVersion::from_timestamp(Timestamp::new(5, 0));
        assert!(IndexFreeQueryEngine::needs_refill(LimitType::First, &set, &keys, limbo_free));
    }

    #[test]
    fn refill_when_the_limit_edge_changed() {
        let limbo_free = SnapshotVersion::from_timestamp(Timestamp::new(5, 0));
        let (set, keys) = previous(&[doc("c/a", 1, 1, false), doc("c/b", 2, 1, false)]);
        assert!(!IndexFreeQueryEngine::needs_refill(LimitType::First, &set, &keys, limbo_free));

        let (set, keys) = previous(&[doc("c/a", 1, 1, false), doc("c/b", 2, 9, false)]);
        assert!(IndexFreeQueryEngine::needs_refill(LimitType::First, &set, &keys, limbo_free));
        assert!(!IndexFreeQueryEngine::needs_refill(LimitType::Last, &set, &keys, limbo_free));

        let (set, keys) = previous(&[doc("c/a", 1, 1, true), doc("c/b", 2, 1, false)]);
        assert!(IndexFreeQueryEngine::needs_refill(LimitType::Last, &set, &keys, limbo_free));
    }
}
