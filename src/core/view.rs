use crate::core::query::Query;
use crate::core::types::OnlineState;
use crate::core::view_snapshot::ViewSnapshot;
use crate::local::QueryResult;
use crate::model::{
    document_key_set, maybe_document_map, ChangeType, Document, DocumentChangeSet, DocumentKey,
    DocumentKeySet, DocumentMap, DocumentSet, DocumentViewChange, MaybeDocumentMap,
};
use crate::remote::TargetChange;
use crate::util::assert::hard_assert;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    /// Some results come from the local cache only.
    Local,
    Synced,
}

/// A key that entered or left the set of documents the view considers in
/// limbo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// The candidate state of a view after a batch of document changes, not yet
/// applied.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// Set when a document left a full limit window and the window must be
    /// filled again from the local cache.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Client-side view of one query: the documents currently matching it and
/// the bookkeeping needed to compute snapshots and limbo documents.
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    /// Whether the backend reported the target as in sync.
    current: bool,
    document_set: DocumentSet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
    /// Keys the backend has confirmed as members of the target.
    synced_documents: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let document_set = DocumentSet::new(query.doc_comparator());
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            limbo_documents: document_key_set(),
            mutated_keys: document_key_set(),
            synced_documents,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    /// Computes the new document set for `docs` on top of the current state,
    /// or on top of `previous` when refilling after an earlier computation.
    pub fn compute_doc_changes(
        &self,
        docs: &MaybeDocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let refilling = previous.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit.map(|limit| limit as usize);
        let window_full = limit == Some(old_document_set.len());
        let last_doc_in_limit = if self.query.has_limit_to_first() && window_full {
            old_document_set.last().cloned()
        } else {
            None
        };
        let first_doc_in_limit = if self.query.has_limit_to_last() && window_full {
            old_document_set.first().cloned()
        } else {
            None
        };

        for (key, maybe_doc) in docs.iter() {
            let old_doc = old_document_set.get(key);
            let new_doc = maybe_doc
                .as_document()
                .filter(|doc| self.query.matches(doc));

            let old_doc_had_pending_mutations =
                old_doc.map_or(false, |doc| self.mutated_keys.has(doc.key()));
            let new_doc_has_pending_mutations = new_doc.map_or(false, |doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.has(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange::new(
                                ChangeType::Modified,
                                new_doc.clone(),
                            ));
                            change_applied = true;
                            let past_last = last_doc_in_limit.as_ref().map_or(false, |last| {
                                old_document_set.compare(new_doc, last).is_gt()
                            });
                            let before_first = first_doc_in_limit.as_ref().map_or(false, |first| {
                                old_document_set.compare(new_doc, first).is_lt()
                            });
                            if past_last || before_first {
                                // The modified document may now sort outside
                                // the window while a cached one belongs in it.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange::new(
                            ChangeType::Metadata,
                            new_doc.clone(),
                        ));
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new_doc.clone()));
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old_doc.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_document_set = new_document_set.add(new_doc.clone());
                        new_mutated_keys = if new_doc_has_pending_mutations {
                            new_mutated_keys.insert(key.clone())
                        } else {
                            new_mutated_keys.remove(key)
                        };
                    }
                    None => {
                        new_document_set = new_document_set.delete(key);
                        new_mutated_keys = new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let evicted = if self.query.has_limit_to_first() {
                    new_document_set.last()
                } else {
                    new_document_set.first()
                };
                let Some(evicted) = evicted.cloned() else {
                    break;
                };
                new_document_set = new_document_set.delete(evicted.key());
                new_mutated_keys = new_mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        hard_assert(
            !needs_refill || !refilling,
            "View was refilled using docs that themselves needed refilling",
        );
        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            needs_refill,
            mutated_keys: new_mutated_keys,
        }
    }

    /// Same as [`View::compute_doc_changes`] for documents read from the
    /// local cache.
    pub fn compute_doc_changes_from_cache(
        &self,
        docs: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let docs = docs.iter().fold(maybe_document_map(), |map, (key, doc)| {
            map.insert(key.clone(), doc.clone().into())
        });
        self.compute_doc_changes(&docs, previous)
    }

    /// Commits `doc_changes` to the view and returns the snapshot to raise,
    /// if any, together with the limbo changes.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        hard_assert(
            !doc_changes.needs_refill,
            "Cannot apply changes that need a refill",
        );
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .rank()
                .cmp(&right.change_type.rank())
                .then_with(|| self.document_set.compare(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: self.document_set.clone(),
                old_docs,
                doc_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
            }),
            limbo_changes,
        }
    }

    /// Going offline drops the view out of sync so listeners see
    /// `from_cache` results.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None);
        }
        ViewChange::default()
    }

    /// Resets the view to the persisted results of its query, as done by a
    /// tab that becomes primary or receives new results from another tab.
    pub fn synchronize_with_persisted_state(&mut self, query_result: &QueryResult) -> ViewChange {
        self.synced_documents = query_result.remote_keys.clone();
        self.limbo_documents = document_key_set();
        let doc_changes = self.compute_doc_changes_from_cache(&query_result.documents, None);
        self.apply_changes(doc_changes, true, None)
    }

    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == Some(SyncState::Local),
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(target_change) = target_change else {
            return;
        };
        for key in target_change.added_documents.iter() {
            self.synced_documents = self.synced_documents.insert(key.clone());
        }
        for key in target_change.modified_documents.iter() {
            hard_assert(
                self.synced_documents.has(key),
                format!("Modified document {key} not found in view"),
            );
        }
        for key in target_change.removed_documents.iter() {
            self.synced_documents = self.synced_documents.remove(key);
        }
        self.current = target_change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.has(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Local writes keep a document visible until the backend decides.
            Some(doc) => !doc.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo_documents = std::mem::replace(&mut self.limbo_documents, document_key_set());
        let mut limbo_documents = document_key_set();
        for doc in self.document_set.iter() {
            if self.should_be_in_limbo(doc.key()) {
                limbo_documents = limbo_documents.insert(doc.key().clone());
            }
        }
        self.limbo_documents = limbo_documents;

        let mut changes = Vec::new();
        for key in old_limbo_documents.iter() {
            if !self.limbo_documents.has(key) {
                changes.push(LimboDocumentChange::Removed(key.clone()));
            }
        }
        for key in self.limbo_documents.iter() {
            if !old_limbo_documents.has(key) {
                changes.push(LimboDocumentChange::Added(key.clone()));
            }
        }
        changes
    }
}

/// A document acknowledged by the backend but not yet seen through watch
/// would flicker back to its pre-write state if applied.
fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::{Direction, OrderBy};
    use crate::model::{
        DocumentState, FieldPath, MaybeDocument, NoDocument, ObjectValue, ResourcePath,
        SnapshotVersion,
    };
    use crate::value::FirestoreValue;

    fn doc_with_state(path: &str, x: i64, state: DocumentState) -> Document {
        let data = ObjectValue::empty().set(
            &FieldPath::from_dot_separated("x").unwrap(),
            FirestoreValue::from_integer(x),
        );
        Document::new(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            data,
            state,
        )
    }

    fn doc(path: &str, x: i64) -> Document {
        doc_with_state(path, x, DocumentState::Synced)
    }

    fn updates(docs: Vec<MaybeDocument>) -> MaybeDocumentMap {
        docs.into_iter().fold(maybe_document_map(), |map, doc| {
            map.insert(doc.key().clone(), doc)
        })
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn query() -> Query {
        Query::new(ResourcePath::from_string("c").unwrap()).with_order_by(OrderBy::new(
            FieldPath::from_dot_separated("x").unwrap(),
            Direction::Ascending,
        ))
    }

    fn keys(docs: &DocumentSet) -> Vec<String> {
        docs.iter().map(|doc| doc.key().to_string()).collect()
    }

    fn apply(view: &mut View, docs: Vec<MaybeDocument>) -> ViewChange {
        let changes = view.compute_doc_changes(&updates(docs), None);
        view.apply_changes(changes, true, None)
    }

    #[test]
    fn first_changes_produce_a_from_cache_snapshot() {
        let mut view = View::new(query(), document_key_set());
        let change = apply(&mut view, vec![doc("c/b", 2).into(), doc("c/a", 1).into()]);
        let snapshot = change.snapshot.unwrap();
        assert_eq!(keys(&snapshot.docs), vec!["c/a", "c/b"]);
        assert!(snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
        assert!(snapshot
            .doc_changes
            .iter()
            .all(|change| change.change_type == ChangeType::Added));
    }

    #[test]
    fn full_limit_window_evicts_the_last_document() {
        let mut view = View::new(query().with_limit_to_first(2), document_key_set());
        let initial = apply(
            &mut view,
            vec![doc("c/a", 1).into(), doc("c/b", 2).into(), doc("c/c", 3).into()],
        )
        .snapshot
        .unwrap();
        assert_eq!(keys(&initial.docs), vec!["c/a", "c/b"]);

        let snapshot = apply(&mut view, vec![doc("c/d", 0).into()]).snapshot.unwrap();
        let changes: Vec<(ChangeType, String)> = snapshot
            .doc_changes
            .iter()
            .map(|change| (change.change_type, change.doc.key().to_string()))
            .collect();
        assert_eq!(
            changes,
            vec![
                (ChangeType::Removed, "c/b".to_string()),
                (ChangeType::Added, "c/d".to_string()),
            ]
        );
        assert_eq!(keys(&snapshot.docs), vec!["c/d", "c/a"]);
    }

    #[test]
    fn removal_from_a_full_window_requests_a_refill() {
        let mut view = View::new(query().with_limit_to_first(2), document_key_set());
        apply(&mut view, vec![doc("c/a", 1).into(), doc("c/b", 2).into()]);
        let deleted = NoDocument::new(key("c/a"), SnapshotVersion::min(), false);
        let changes = view.compute_doc_changes(&updates(vec![deleted.into()]), None);
        assert!(changes.needs_refill);

        let refill = changes.document_set.iter().fold(maybe_document_map(), |map, doc| {
            map.insert(doc.key().clone(), doc.clone().into())
        });
        let refill = refill.insert(key("c/c"), doc("c/c", 3).into());
        let refilled = view.compute_doc_changes(&refill, Some(changes));
        assert!(!refilled.needs_refill);
        let snapshot = view.apply_changes(refilled, true, None).snapshot.unwrap();
        assert_eq!(keys(&snapshot.docs), vec!["c/b", "c/c"]);
    }

    #[test]
    fn unchanged_results_raise_no_snapshot() {
        let mut view = View::new(query(), document_key_set());
        apply(&mut view, vec![doc("c/a", 1).into()]);
        assert!(apply(&mut view, vec![doc("c/a", 1).into()]).snapshot.is_none());
    }

    #[test]
    fn pending_write_flag_changes_emit_metadata_changes() {
        let mut view = View::new(query(), document_key_set());
        apply(
            &mut view,
            vec![doc_with_state("c/a", 1, DocumentState::LocalMutations).into()],
        );
        let snapshot = apply(&mut view, vec![doc("c/a", 1).into()]).snapshot.unwrap();
        assert_eq!(snapshot.doc_changes[0].change_type, ChangeType::Metadata);
        assert!(!snapshot.has_pending_writes());
    }

    #[test]
    fn acknowledged_writes_wait_for_the_watch_version() {
        let mut view = View::new(query(), document_key_set());
        apply(
            &mut view,
            vec![doc_with_state("c/a", 1, DocumentState::LocalMutations).into()],
        );
        let acknowledged = doc_with_state("c/a", 5, DocumentState::CommittedMutations);
        let change = apply(&mut view, vec![acknowledged.into()]);
        assert!(change.snapshot.is_none());
    }

    #[test]
    fn current_target_tracks_limbo_documents() {
        let mut view = View::new(query(), document_key_set());
        apply(&mut view, vec![doc("c/a", 1).into(), doc("c/b", 2).into()]);

        let mut target_change = TargetChange::new(vec![1], true);
        target_change.added_documents = target_change.added_documents.insert(key("c/a"));
        let changes = view.compute_doc_changes(&maybe_document_map(), None);
        let change = view.apply_changes(changes, true, Some(&target_change));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Added(key("c/b"))]);
        // Still out of sync, nothing new to report.
        assert!(change.snapshot.is_none());

        let mut target_change = TargetChange::new(vec![2], true);
        target_change.added_documents = target_change.added_documents.insert(key("c/b"));
        let changes = view.compute_doc_changes(&maybe_document_map(), None);
        let change = view.apply_changes(changes, true, Some(&target_change));
        assert_eq!(change.limbo_changes, vec![LimboDocumentChange::Removed(key("c/b"))]);
        let snapshot = change.snapshot.unwrap();
        assert!(!snapshot.from_cache);
        assert!(snapshot.sync_state_changed);
    }

    #[test]
    fn going_offline_marks_a_current_view_as_from_cache() {
        let mut view = View::new(query(), document_key_set());
        let mut target_change = TargetChange::new(Vec::new(), true);
        target_change.added_documents = target_change.added_documents.insert(key("c/a"));
        let changes = view.compute_doc_changes(&updates(vec![doc("c/a", 1).into()]), None);
        let online = view.apply_changes(changes, true, Some(&target_change));
        assert!(!online.snapshot.unwrap().from_cache);

        let offline = view.apply_online_state_change(OnlineState::Offline);
        let snapshot = offline.snapshot.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.doc_changes.is_empty());
        assert!(view
            .apply_online_state_change(OnlineState::Offline)
            .snapshot
            .is_none());
    }
}
