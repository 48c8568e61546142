use std::collections::{BTreeMap, BTreeSet};

use crate::model::{
    document_key_set, maybe_document_map, DocumentKeySet, MaybeDocumentMap, SnapshotVersion,
    TargetId,
};

/// Changes to one target between two consistent snapshots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the backend did not send a new token.
    pub resume_token: Vec<u8>,
    /// Whether the target is now in sync with the backend.
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn new(resume_token: Vec<u8>, current: bool) -> Self {
        Self {
            resume_token,
            current,
            added_documents: document_key_set(),
            modified_documents: document_key_set(),
            removed_documents: document_key_set(),
        }
    }

    /// A change that only flips the `current` state, as produced when a
    /// secondary tab or a rejected limbo resolution updates a target without
    /// a watch message.
    pub fn synthesized_for_current_change(current: bool) -> Self {
        Self::new(Vec::new(), current)
    }

    pub fn change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}

/// Everything the watch stream delivered up to one consistent snapshot
/// version.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter disagreed with the local state. Their
    /// mapping was reset and needs a fresh listen.
    pub target_mismatches: BTreeSet<TargetId>,
    pub document_updates: MaybeDocumentMap,
    /// Updated documents that only belong to limbo resolution targets.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn new(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeSet::new(),
            document_updates: maybe_document_map(),
            resolved_limbo_documents: document_key_set(),
        }
    }

    /// An event at the minimum version carrying a single current-state
    /// change for `target_id`.
    pub fn synthesized_for_current_change(target_id: TargetId, current: bool) -> Self {
        let mut event = Self::new(SnapshotVersion::min());
        event.target_changes.insert(
            target_id,
            TargetChange::synthesized_for_current_change(current),
        );
        event
    }
}
