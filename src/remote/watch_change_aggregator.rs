use std::collections::{BTreeMap, BTreeSet};

use crate::local::{TargetData, TargetPurpose};
use crate::model::{
    document_key_set, maybe_document_map, ChangeType, DocumentKey, DocumentKeySet, MaybeDocument,
    MaybeDocumentMap, NoDocument, SnapshotVersion, TargetId,
};
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use crate::util::assert::hard_assert;

/// What the aggregator needs to know about the client's targets.
pub trait TargetMetadataProvider {
    /// Keys the backend reported for the target as of the last snapshot.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Metadata of a target the client is listening to, or `None` if it is
    /// no longer listened to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

/// Changes to one target accumulated since the last snapshot.
#[derive(Debug)]
struct TargetState {
    /// Listen or unlisten requests still awaiting their ADD/REMOVE.
    pending_responses: usize,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    /// Whether the next snapshot needs a change for this target. Starts true
    /// so that a freshly added target is always reported.
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::new(self.resume_token.clone(), self.current);
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => {
                    change.added_documents = change.added_documents.insert(key.clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {
                    change.modified_documents = change.modified_documents.insert(key.clone());
                }
                ChangeType::Removed => {
                    change.removed_documents = change.removed_documents.insert(key.clone());
                }
            }
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_target_response(&mut self) {
        self.pending_responses = self.pending_responses.saturating_sub(1);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds watch changes into [`RemoteEvent`]s at each consistent snapshot.
///
/// Changes for a target are dropped while a listen or unlisten request for
/// it is unacknowledged, so that a quick remove-and-re-add does not mix
/// state from both listens.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: MaybeDocumentMap,
    /// Targets each updated document was reported for.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeSet<TargetId>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self {
            target_states: BTreeMap::new(),
            pending_document_updates: maybe_document_map(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeSet::new(),
        }
    }

    pub fn handle_document_change(
        &mut self,
        change: &DocumentWatchChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for &target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(doc @ MaybeDocument::Document(_)) => {
                    self.add_document_to_target(target_id, doc.clone(), metadata)
                }
                other => self.remove_document_from_target(
                    target_id,
                    change.key.clone(),
                    other.clone(),
                    metadata,
                ),
            }
        }
        for &target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                target_id,
                change.key.clone(),
                change.new_doc.clone(),
                metadata,
            );
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        for target_id in self.affected_targets(change, metadata) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A fresh listen starts from a clean slate, even if
                        // an older listen of the same target left changes.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert(
                        change.cause.is_none(),
                        "the watch change aggregator does not handle errored targets",
                    );
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        // The backend re-adds the documents that still
                        // match before its next snapshot.
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(
        &self,
        change: &WatchTargetChange,
        metadata: &dyn TargetMetadataProvider,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|&target_id| self.is_active_target(target_id, metadata))
            .collect()
    }

    /// Compares the backend's document count for a target with the local
    /// one and resets the target on disagreement.
    pub fn handle_existence_filter(
        &mut self,
        filter: &ExistenceFilterChange,
        metadata: &dyn TargetMetadataProvider,
    ) {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };
        let target = &target_data.target;
        if target.is_document_target() {
            if filter.count == 0 {
                // Without the synthesized delete another query could keep
                // showing the document until the next snapshot.
                if let Ok(key) = DocumentKey::from_path(target.path.clone()) {
                    let deleted = NoDocument::new(key.clone(), SnapshotVersion::min(), false);
                    self.remove_document_from_target(target_id, key, Some(deleted.into()), metadata);
                }
            } else if filter.count != 1 {
                log::warn!(
                    "existence filter for document target {target_id} reported {} documents",
                    filter.count
                );
                self.reset_target(target_id, metadata);
                self.pending_target_resets.insert(target_id);
            }
        } else {
            let current_size = self.current_document_count_for_target(target_id, metadata);
            if current_size != filter.count {
                log::debug!(
                    "existence filter mismatch for target {target_id}: {current_size} local, {} remote",
                    filter.count
                );
                self.reset_target(target_id, metadata);
                self.pending_target_resets.insert(target_id);
            }
        }
    }

    /// Builds the event for everything received up to `snapshot_version`
    /// and clears the pending state.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        metadata: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                // A document target that is current without its document
                // proves that the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path.clone()) {
                    if self.pending_document_updates.get(&key).is_none()
                        && !self.target_contains_document(target_id, &key, metadata)
                    {
                        let deleted = NoDocument::new(key.clone(), snapshot_version, false);
                        self.remove_document_from_target(target_id, key, Some(deleted.into()), metadata);
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        // Documents only reported for limbo resolutions are not part of any
        // query target, which garbage collection needs to know.
        let mut resolved_limbo_documents = document_key_set();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|&target_id| {
                self.target_data_for_active_target(target_id, metadata)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents = resolved_limbo_documents.insert(key.clone());
            }
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::replace(&mut self.pending_document_updates, maybe_document_map()),
            resolved_limbo_documents,
        };
        self.pending_document_target_mapping.clear();
        event
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: MaybeDocument,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates = self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// Records that `key` left the target. `updated_document` is the new
    /// state of the document if it is known.
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: DocumentKey,
        updated_document: Option<MaybeDocument>,
        metadata: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, &key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left again before any snapshot was raised.
            state.remove_document_change(&key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates = self.pending_document_updates.insert(key, document);
        }
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Remote keys plus pending additions minus pending removals.
    fn current_document_count_for_target(
        &mut self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        (metadata.get_remote_keys_for_target(target_id).len() + change.added_documents.len())
            .saturating_sub(change.removed_documents.len())
    }

    /// Notes that a listen or unlisten for `target_id` was sent and its
    /// acknowledgement is outstanding.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) -> bool {
        let active = self.target_data_for_active_target(target_id, metadata).is_some();
        if !active {
            log::debug!("detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        metadata: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }

    /// Forgets all changes of the target and removes every document the
    /// backend had reported for it.
    fn reset_target(&mut self, target_id: TargetId, metadata: &dyn TargetMetadataProvider) {
        hard_assert(
            !self
                .target_states
                .get(&target_id)
                .is_some_and(TargetState::is_pending),
            "should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::new());
        let existing = metadata.get_remote_keys_for_target(target_id);
        for key in existing.iter() {
            self.remove_document_from_target(target_id, key.clone(), None, metadata);
        }
    }

    fn target_contains_document(
        &self,
        target_id: TargetId,
        key: &DocumentKey,
        metadata: &dyn TargetMetadataProvider,
    ) -> bool {
        metadata.get_remote_keys_for_target(target_id).has(key)
    }
}
