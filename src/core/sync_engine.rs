//! Glue between the user-facing listeners, the local store and the remote
//! store: owns the views of all active queries, tracks limbo documents and
//! routes write acknowledgements back to their callers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::channel::oneshot;

use crate::config::SyncSettings;
use crate::core::event_manager::SyncEngineListener;
use crate::core::query::Query;
use crate::core::target::Target;
use crate::core::target_id_generator::TargetIdGenerator;
use crate::core::types::{OnlineState, OnlineStateSource};
use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::ViewSnapshot;
use crate::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::local::persistence::{ignore_if_primary_lease_loss, INVALID_SEQUENCE_NUMBER};
use crate::local::{LocalStore, LocalViewChanges, ReferenceSet, TargetData, TargetPurpose};
use crate::model::{
    document_key_set, BatchId, DocumentKey, DocumentKeySet, MaybeDocumentMap, Mutation,
    MutationBatchResult, NoDocument, SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};
use crate::multi_tab::{
    ClientId, MutationBatchState, QueryTargetState, SharedClientState, SharedClientStateSyncer,
};
use crate::remote::{RemoteEvent, RemoteStore, RemoteSyncer, TargetChange, User};
use crate::util::assert::{fail, hard_assert};
use crate::util::{box_future, BoxedFuture};

/// Resolved once the backend accepted or rejected a write, or once every
/// write pending at registration time did.
pub type WriteCallback = oneshot::Sender<FirestoreResult<()>>;

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Whether the resolution target delivered the document. Until then the
    /// target contributes no remote keys.
    received_document: bool,
}

/// Remote store calls collected while the engine state is locked and run
/// after it is released, in order.
enum RemoteAction {
    Listen(TargetData),
    Unlisten(TargetId),
}

struct SyncEngineState {
    /// Keyed by canonical query id.
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views reference each limbo document.
    limbo_document_refs: ReferenceSet,
    /// Write callbacks per user key and batch.
    mutation_user_callbacks: HashMap<String, BTreeMap<BatchId, WriteCallback>>,
    /// Callbacks waiting for every batch up to and including the key.
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    limbo_target_id_generator: TargetIdGenerator,
    max_concurrent_limbo_resolutions: usize,
    current_user: User,
    online_state: OnlineState,
    /// `None` until the persistence layer reported the lease state.
    is_primary: Option<bool>,
}

impl SyncEngineState {
    fn is_primary(&self) -> bool {
        self.is_primary == Some(true)
    }

    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        changes: Vec<LimboDocumentChange>,
        actions: &mut Vec<RemoteAction>,
    ) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key, actions);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key, actions);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey, actions: &mut Vec<RemoteAction>) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("new document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(actions);
    }

    /// Starts resolution listens for queued limbo documents while fewer than
    /// the configured maximum are active.
    fn pump_enqueued_limbo_resolutions(&mut self, actions: &mut Vec<RemoteAction>) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let limbo_target_id = self.limbo_target_id_generator.next_id();
            self.active_limbo_resolutions_by_target.insert(
                limbo_target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key
                .insert(key.clone(), limbo_target_id);
            actions.push(RemoteAction::Listen(TargetData::new(
                Target::for_document(&key),
                limbo_target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            )));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, actions: &mut Vec<RemoteAction>) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(limbo_target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        actions.push(RemoteAction::Unlisten(limbo_target_id));
        self.active_limbo_resolutions_by_target.remove(&limbo_target_id);
        self.pump_enqueued_limbo_resolutions(actions);
    }

    /// Drops every view of `target_id` and returns their queries.
    fn remove_and_cleanup_target(
        &mut self,
        target_id: TargetId,
        actions: &mut Vec<RemoteAction>,
    ) -> Vec<Query> {
        let queries = self.queries_by_target.remove(&target_id).unwrap_or_default();
        for query in &queries {
            self.query_views.remove(&query.canonical_id());
        }
        if self.is_primary() {
            for key in self.limbo_document_refs.remove_references_for_id(target_id) {
                if !self.limbo_document_refs.contains_key(&key) {
                    self.remove_limbo_target(&key, actions);
                }
            }
        }
        queries
    }

    fn process_user_callback(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        let user_key = self.current_user.to_key();
        let callback = self
            .mutation_user_callbacks
            .get_mut(&user_key)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            // The caller may have stopped waiting.
            let _ = callback.send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        for callback in self.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for (_, callbacks) in std::mem::take(&mut self.pending_writes_callbacks) {
            for callback in callbacks {
                let _ = callback.send(Err(cancelled(message)));
            }
        }
    }
}

pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: Arc<RemoteStore>,
    shared_client_state: Arc<dyn SharedClientState>,
    listener: Mutex<Option<Weak<dyn SyncEngineListener>>>,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: Arc<RemoteStore>,
        shared_client_state: Arc<dyn SharedClientState>,
        current_user: User,
        settings: &SyncSettings,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            local_store,
            remote_store: Arc::clone(&remote_store),
            shared_client_state: Arc::clone(&shared_client_state),
            listener: Mutex::new(None),
            state: Mutex::new(SyncEngineState {
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                mutation_user_callbacks: HashMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                max_concurrent_limbo_resolutions: settings.max_concurrent_limbo_resolutions,
                current_user,
                online_state: OnlineState::Unknown,
                is_primary: None,
            }),
        });
        let syncer: Arc<dyn RemoteSyncer> = engine.clone();
        remote_store.set_syncer(Arc::downgrade(&syncer));
        let shared_syncer: Arc<dyn SharedClientStateSyncer> = engine.clone();
        shared_client_state.set_syncer(Arc::downgrade(&shared_syncer));
        engine
    }

    fn lock(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers the receiver of snapshots, errors and online state changes.
    pub fn subscribe(&self, listener: Weak<dyn SyncEngineListener>) {
        *self.listener.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(listener);
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub fn is_primary_client(&self) -> bool {
        self.lock().is_primary()
    }

    async fn run_remote_actions(&self, actions: Vec<RemoteAction>) -> FirestoreResult<()> {
        for action in actions {
            match action {
                RemoteAction::Listen(target_data) => self.remote_store.listen(target_data).await?,
                RemoteAction::Unlisten(target_id) => self.remote_store.unlisten(target_id).await?,
            }
        }
        Ok(())
    }

    /// Starts listening to `query` and returns its first snapshot, computed
    /// from the local cache.
    pub async fn listen(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        {
            let state = self.lock();
            if let Some(query_view) = state.query_views.get(&canonical_id) {
                // Another listener of this tab already owns the view.
                self.shared_client_state
                    .add_local_query_target(query_view.target_id);
                return Ok(query_view.view.compute_initial_snapshot());
            }
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let status = self
            .shared_client_state
            .add_local_query_target(target_data.target_id);
        let (snapshot, actions) = self.initialize_view_and_compute_snapshot(
            query,
            target_data.target_id,
            status == QueryTargetState::Current,
        )?;
        self.run_remote_actions(actions).await?;
        if self.is_primary_client() {
            self.remote_store.listen(target_data).await?;
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &self,
        query: Query,
        target_id: TargetId,
        current: bool,
    ) -> FirestoreResult<(ViewSnapshot, Vec<RemoteAction>)> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut state = self.lock();
        let mut view = View::new(query.clone(), query_result.remote_keys.clone());
        let doc_changes = view.compute_doc_changes_from_cache(&query_result.documents, None);
        let target_change = TargetChange::synthesized_for_current_change(
            current && state.online_state != OnlineState::Offline,
        );
        let view_change = view.apply_changes(doc_changes, state.is_primary(), Some(&target_change));
        let mut actions = Vec::new();
        state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut actions);
        let snapshot = match view_change.snapshot {
            Some(snapshot) => snapshot,
            None => fail("the first change to a view always produces a snapshot"),
        };

        state
            .queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query,
                target_id,
                view,
            },
        );
        Ok((snapshot, actions))
    }

    /// Stops listening to `query`. The target is released once no view of
    /// any tab uses it.
    pub async fn unlisten(&self, query: Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.lock();
            let Some(target_id) = state.query_views.get(&canonical_id).map(|view| view.target_id) else {
                return Err(internal_error(format!(
                    "Trying to unlisten on query not found: {canonical_id}"
                )));
            };
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|other| other.canonical_id() != canonical_id);
                state.query_views.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };

        if self.is_primary_client() {
            self.shared_client_state.remove_local_query_target(target_id);
            if self.shared_client_state.is_active_query_target(target_id) {
                return Ok(());
            }
            match self.local_store.release_target(target_id, false) {
                Ok(()) => {
                    self.shared_client_state.clear_query_state(target_id);
                    self.remote_store.unlisten(target_id).await?;
                    self.remove_and_cleanup_target(target_id, None).await
                }
                Err(err) => ignore_if_primary_lease_loss(Err(err)),
            }
        } else {
            self.remove_and_cleanup_target(target_id, None).await?;
            self.local_store.release_target(target_id, true)
        }
    }

    async fn remove_and_cleanup_target(
        &self,
        target_id: TargetId,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        self.shared_client_state.remove_local_query_target(target_id);
        let mut actions = Vec::new();
        let queries = self.lock().remove_and_cleanup_target(target_id, &mut actions);
        if let (Some(error), Some(listener)) = (error, self.listener()) {
            for query in &queries {
                listener.on_watch_error(query, error.clone());
            }
        }
        self.run_remote_actions(actions).await
    }

    /// Applies `mutations` locally and queues them for the backend.
    /// `callback` is resolved with the backend's verdict; a local failure is
    /// reported through it as well.
    pub async fn write(&self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let result = match self.local_store.local_write(mutations) {
            Ok(result) => result,
            Err(err) => {
                log::warn!("failed to persist write: {err}");
                let _ = callback.send(Err(err));
                return Ok(());
            }
        };
        self.shared_client_state.add_pending_mutation(result.batch_id);
        {
            let mut state = self.lock();
            let user_key = state.current_user.to_key();
            state
                .mutation_user_callbacks
                .entry(user_key)
                .or_default()
                .insert(result.batch_id, callback);
        }
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)
            .await?;
        self.remote_store.fill_write_pipeline().await
    }

    /// Resolves `callback` once every write pending now has been
    /// acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self, callback: WriteCallback) {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                "the network is disabled; pending writes will not complete until it is enabled"
            );
        }
        match self.local_store.get_highest_unacknowledged_batch_id() {
            Ok(BATCH_ID_UNKNOWN) => {
                let _ = callback.send(Ok(()));
            }
            Ok(batch_id) => {
                self.lock()
                    .pending_writes_callbacks
                    .entry(batch_id)
                    .or_default()
                    .push(callback);
            }
            Err(err) => {
                let _ = callback.send(Err(err));
            }
        }
    }

    /// Applies an online state change reported by the remote store (primary)
    /// or relayed from the primary tab (secondary).
    pub fn apply_online_state_change(&self, online_state: OnlineState, source: OnlineStateSource) {
        let (snapshots, is_primary) = {
            let mut state = self.lock();
            let is_primary = state.is_primary();
            let accepted = match source {
                OnlineStateSource::RemoteStore => is_primary,
                OnlineStateSource::SharedClientState => !is_primary,
            };
            if !accepted {
                return;
            }
            let mut snapshots = Vec::new();
            for query_view in state.query_views.values_mut() {
                let view_change = query_view.view.apply_online_state_change(online_state);
                hard_assert(
                    view_change.limbo_changes.is_empty(),
                    "OnlineState should not affect limbo documents",
                );
                snapshots.extend(view_change.snapshot);
            }
            state.online_state = online_state;
            (snapshots, is_primary)
        };

        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            listener.on_watch_change(snapshots);
        }
        if is_primary {
            self.shared_client_state.set_online_state(online_state);
        }
    }

    /// Computes new view snapshots for `changes`, raises them and reports
    /// the changed view membership to the local store.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: &MaybeDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let (new_snapshots, doc_changes_in_all_views, actions) =
            self.compute_new_snapshots(changes, remote_event)?;
        self.run_remote_actions(actions).await?;
        if let Some(listener) = self.listener() {
            listener.on_watch_change(new_snapshots);
        }
        self.local_store
            .notify_local_view_changes(&doc_changes_in_all_views)
    }

    fn compute_new_snapshots(
        &self,
        changes: &MaybeDocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<(Vec<ViewSnapshot>, Vec<LocalViewChanges>, Vec<RemoteAction>)> {
        let mut new_snapshots = Vec::new();
        let mut doc_changes_in_all_views = Vec::new();
        let mut limbo_changes = Vec::new();

        let mut guard = self.lock();
        let state = &mut *guard;
        let is_primary = state.is_primary();
        for query_view in state.query_views.values_mut() {
            let mut view_doc_changes = query_view.view.compute_doc_changes(changes, None);
            if view_doc_changes.needs_refill {
                // A document left a full limit window; the local cache
                // knows which one takes its place.
                let result = self.local_store.execute_query(&query_view.query, false)?;
                view_doc_changes = query_view
                    .view
                    .compute_doc_changes_from_cache(&result.documents, Some(view_doc_changes));
            }
            let target_change = remote_event
                .and_then(|event| event.target_changes.get(&query_view.target_id));
            let view_change = query_view
                .view
                .apply_changes(view_doc_changes, is_primary, target_change);
            let target_id = query_view.target_id;
            limbo_changes.push((target_id, view_change.limbo_changes));

            if let Some(snapshot) = view_change.snapshot {
                if is_primary {
                    let query_state = if snapshot.from_cache {
                        QueryTargetState::NotCurrent
                    } else {
                        QueryTargetState::Current
                    };
                    self.shared_client_state
                        .update_query_state(target_id, query_state, None);
                }
                doc_changes_in_all_views.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                new_snapshots.push(snapshot);
            }
        }

        let mut actions = Vec::new();
        for (target_id, changes) in limbo_changes {
            state.update_tracked_limbos(target_id, changes, &mut actions);
        }
        Ok((new_snapshots, doc_changes_in_all_views, actions))
    }

    async fn apply_remote_event_internal(&self, event: RemoteEvent) -> FirestoreResult<()> {
        let changes = self.local_store.apply_remote_event(&event)?;
        {
            let mut state = self.lock();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                hard_assert(
                    change.change_count() <= 1,
                    "Limbo resolution for single document contains multiple changes",
                );
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received change for limbo target document without add",
                    );
                } else if !change.removed_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        "Received remove for limbo target document without add",
                    );
                    resolution.received_document = false;
                }
            }
        }
        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
            .await
    }

    async fn reject_listen_internal(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected, Some(&error));

        let limbo_key = {
            let mut state = self.lock();
            let resolution = state.active_limbo_resolutions_by_target.remove(&target_id);
            if let Some(resolution) = &resolution {
                state.active_limbo_targets_by_key.remove(&resolution.key);
            }
            resolution.map(|resolution| resolution.key)
        };

        let Some(limbo_key) = limbo_key else {
            return match self.local_store.release_target(target_id, false) {
                Ok(()) => self.remove_and_cleanup_target(target_id, Some(error)).await,
                Err(err) => ignore_if_primary_lease_loss(Err(err)),
            };
        };

        // The backend refused to resolve the document, most likely because
        // of security rules. Treat it as deleted so it leaves limbo.
        log::debug!("limbo resolution for {limbo_key} was rejected: {error}");
        let mut event = RemoteEvent::new(SnapshotVersion::min());
        event.document_updates = event.document_updates.insert(
            limbo_key.clone(),
            NoDocument::new(limbo_key.clone(), SnapshotVersion::min(), false).into(),
        );
        event.resolved_limbo_documents = event.resolved_limbo_documents.insert(limbo_key);
        ignore_if_primary_lease_loss(self.apply_remote_event_internal(event).await)?;

        let mut actions = Vec::new();
        self.lock().pump_enqueued_limbo_resolutions(&mut actions);
        self.run_remote_actions(actions).await
    }

    async fn apply_successful_write_internal(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        {
            let mut state = self.lock();
            state.process_user_callback(batch_id, Ok(()));
            state.trigger_pending_writes_callbacks(batch_id);
        }
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await
    }

    async fn reject_failed_write_internal(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        {
            let mut state = self.lock();
            state.process_user_callback(batch_id, Err(error.clone()));
            state.trigger_pending_writes_callbacks(batch_id);
        }
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Rejected, Some(&error));
        self.emit_new_snaps_and_notify_local_store(&changes, None)
            .await
    }

    async fn handle_credential_change_internal(&self, user: User) -> FirestoreResult<()> {
        if self.lock().current_user == user {
            return Ok(());
        }
        log::debug!("user change, new user: {user}");
        let result = self.local_store.handle_user_change(&user)?;
        {
            let mut state = self.lock();
            state.current_user = user.clone();
            state.reject_outstanding_pending_writes_callbacks(
                "pending writes callback rejected because of a user change",
            );
        }
        self.shared_client_state.handle_user_change(
            &user,
            &result.removed_batch_ids,
            &result.added_batch_ids,
        );
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
            .await
    }

    /// Switches between running the network (primary) and replaying the
    /// primary's results (secondary).
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let current = self.lock().is_primary;
        if is_primary && current != Some(true) {
            log::debug!("becoming primary");
            let active_targets: Vec<TargetId> = self
                .shared_client_state
                .get_all_active_query_targets()
                .into_iter()
                .collect();
            let active_queries = self
                .synchronize_query_views_and_raise_snapshots(&active_targets)
                .await?;
            self.lock().is_primary = Some(true);
            self.remote_store.apply_primary_state(true).await?;
            for target_data in active_queries {
                self.remote_store.listen(target_data).await?;
            }
        } else if !is_primary && current != Some(false) {
            log::debug!("becoming secondary");
            let was_primary = current == Some(true);
            let target_ids: Vec<TargetId> = self.lock().queries_by_target.keys().copied().collect();
            let mut active_targets = Vec::new();
            for target_id in target_ids {
                if self.shared_client_state.is_local_query_target(target_id) {
                    active_targets.push(target_id);
                } else {
                    self.remove_and_cleanup_target(target_id, None).await?;
                    self.local_store.release_target(target_id, true)?;
                }
                if was_primary {
                    self.remote_store.unlisten(target_id).await?;
                }
            }
            self.synchronize_query_views_and_raise_snapshots(&active_targets)
                .await?;
            self.reset_limbo_documents(was_primary).await?;
            self.lock().is_primary = Some(false);
            self.remote_store.apply_primary_state(false).await?;
        }
        Ok(())
    }

    /// Reconciles the views of `targets` with the persisted state and
    /// returns the target data to listen to.
    async fn synchronize_query_views_and_raise_snapshots(
        &self,
        targets: &[TargetId],
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active_queries = Vec::new();
        let mut new_snapshots = Vec::new();
        let mut actions = Vec::new();

        for &target_id in targets {
            let queries = self
                .lock()
                .queries_by_target
                .get(&target_id)
                .cloned()
                .unwrap_or_default();
            let target_data = if let Some(first) = queries.first() {
                let target_data = self.local_store.allocate_target(first.to_target())?;
                for query in &queries {
                    let query_result = self.local_store.execute_query(query, true)?;
                    let mut state = self.lock();
                    let is_primary = state.is_primary();
                    let Some(query_view) = state.query_views.get_mut(&query.canonical_id()) else {
                        continue;
                    };
                    let view_change = query_view
                        .view
                        .synchronize_with_persisted_state(&query_result);
                    let view_target_id = query_view.target_id;
                    if is_primary {
                        state.update_tracked_limbos(view_target_id, view_change.limbo_changes, &mut actions);
                    }
                    new_snapshots.extend(view_change.snapshot);
                }
                target_data
            } else {
                // A target of another tab that this tab has no view for yet.
                let target = self.local_store.get_target(target_id)?.ok_or_else(|| {
                    internal_error(format!("Missing target data for target {target_id}"))
                })?;
                let target_data = self.local_store.allocate_target(target.clone())?;
                let (_, view_actions) = self.initialize_view_and_compute_snapshot(
                    Query::from_target(&target),
                    target_data.target_id,
                    false,
                )?;
                actions.extend(view_actions);
                target_data
            };
            active_queries.push(target_data);
        }

        self.run_remote_actions(actions).await?;
        if let Some(listener) = self.listener() {
            listener.on_watch_change(new_snapshots);
        }
        Ok(active_queries)
    }

    /// Forgets all limbo resolutions, as a secondary tab does not resolve
    /// limbo documents itself.
    async fn reset_limbo_documents(&self, unlisten: bool) -> FirestoreResult<()> {
        let limbo_targets: Vec<TargetId> = {
            let mut state = self.lock();
            state.limbo_document_refs.remove_all_references();
            state.active_limbo_targets_by_key.clear();
            state.enqueued_limbo_resolutions.clear();
            std::mem::take(&mut state.active_limbo_resolutions_by_target)
                .into_keys()
                .collect()
        };
        if unlisten {
            for target_id in limbo_targets {
                self.remote_store.unlisten(target_id).await?;
            }
        }
        Ok(())
    }

    /// Keys currently being resolved, with their resolution target ids.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.lock().active_limbo_targets_by_key.clone()
    }

    /// Keys waiting for a free resolution slot, in queue order.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.lock().enqueued_limbo_resolutions.iter().cloned().collect()
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> BoxedFuture<'_, FirestoreResult<()>> {
        box_future(async move { ignore_if_primary_lease_loss(self.apply_remote_event_internal(event).await) })
    }

    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> BoxedFuture<'_, FirestoreResult<()>> {
        box_future(async move { self.reject_listen_internal(target_id, error).await })
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> BoxedFuture<'_, FirestoreResult<()>> {
        box_future(async move { ignore_if_primary_lease_loss(self.apply_successful_write_internal(result).await) })
    }

    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> BoxedFuture<'_, FirestoreResult<()>> {
        box_future(async move { ignore_if_primary_lease_loss(self.reject_failed_write_internal(batch_id, error).await) })
    }

    fn handle_credential_change(&self, user: User) -> BoxedFuture<'_, FirestoreResult<()>> {
        box_future(async move { self.handle_credential_change_internal(user).await })
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        let state = self.lock();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return document_key_set().insert(resolution.key.clone());
            }
        }
        let mut keys = document_key_set();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys = keys.union(query_view.view.synced_documents());
            }
        }
        keys
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl SharedClientStateSyncer for SyncEngine {
    async fn apply_batch_state(
        &self,
        batch_id: BatchId,
        batch_state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let Some(documents) = self.local_store.lookup_mutation_documents(batch_id)? else {
            // Already removed by a user change or garbage collection.
            log::debug!("cannot apply mutation batch with id {batch_id}");
            return Ok(());
        };
        match batch_state {
            MutationBatchState::Pending => {
                // The primary sends batches written by secondary tabs.
                self.remote_store.fill_write_pipeline().await?;
            }
            MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                let result = match error {
                    Some(error) => Err(error),
                    None => Ok(()),
                };
                self.lock().process_user_callback(batch_id, result);
            }
        }
        self.emit_new_snaps_and_notify_local_store(&documents, None)
            .await
    }

    async fn apply_target_state(
        &self,
        target_id: TargetId,
        target_state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        if self.is_primary_client() {
            log::debug!("ignoring unexpected query state notification");
            return Ok(());
        }
        if !self.lock().queries_by_target.contains_key(&target_id) {
            return Ok(());
        }
        match target_state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let changes = self.local_store.get_new_document_changes()?;
                let event = RemoteEvent::synthesized_for_current_change(
                    target_id,
                    target_state == QueryTargetState::Current,
                );
                self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
                    .await
            }
            QueryTargetState::Rejected => {
                self.local_store.release_target(target_id, true)?;
                self.remove_and_cleanup_target(target_id, error).await
            }
        }
    }

    async fn apply_active_target_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()> {
        if !self.is_primary_client() {
            return Ok(());
        }
        for target_id in added {
            if self.lock().queries_by_target.contains_key(&target_id) {
                log::debug!("adding an already active target {target_id}");
                continue;
            }
            let target = self.local_store.get_target(target_id)?.ok_or_else(|| {
                internal_error(format!("Missing target data for target {target_id}"))
            })?;
            let target_data = self.local_store.allocate_target(target.clone())?;
            let (_, actions) = self.initialize_view_and_compute_snapshot(
                Query::from_target(&target),
                target_data.target_id,
                false,
            )?;
            self.run_remote_actions(actions).await?;
            self.remote_store.listen(target_data).await?;
        }
        for target_id in removed {
            if !self.lock().queries_by_target.contains_key(&target_id) {
                continue;
            }
            match self.local_store.release_target(target_id, false) {
                Ok(()) => {
                    self.remote_store.unlisten(target_id).await?;
                    self.remove_and_cleanup_target(target_id, None).await?;
                }
                Err(err) => ignore_if_primary_lease_loss(Err(err))?,
            }
        }
        Ok(())
    }

    fn get_active_clients(&self) -> FirestoreResult<Vec<ClientId>> {
        self.local_store.persistence().get_active_clients()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::permission_denied;
    use crate::local::memory::MemoryPersistence;
    use crate::local::IndexFreeQueryEngine;
    use crate::model::{DatabaseId, Document, ObjectValue, ResourcePath, Timestamp};
    use crate::multi_tab::MemorySharedClientState;
    use crate::remote::{Datastore, InMemoryConnection, JsonProtoSerializer, NoopTokenProvider};
    use crate::util::AsyncQueue;

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<(String, FirestoreError)>>,
        online_states: Mutex<Vec<OnlineState>>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push((query.canonical_id(), error));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Harness {
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        sync_engine: Arc<SyncEngine>,
        listener: Arc<RecordingListener>,
    }

    fn harness(max_concurrent_limbo_resolutions: usize) -> Harness {
        let queue = AsyncQueue::new();
        let settings = SyncSettings {
            max_concurrent_limbo_resolutions,
            ..SyncSettings::default()
        };
        let user = User::unauthenticated();
        let local_store = Arc::new(LocalStore::new(
            Arc::new(MemoryPersistence::new("client")),
            IndexFreeQueryEngine::new(),
            &user,
            &settings,
        ));
        local_store.start().unwrap();
        let datastore = Arc::new(Datastore::new(
            Arc::new(InMemoryConnection::new()),
            Arc::new(NoopTokenProvider),
            Arc::new(JsonProtoSerializer::new(DatabaseId::default("p"))),
        ));
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            datastore,
            queue.clone(),
            Arc::new(|_| {}),
            &settings,
        );
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            remote_store,
            Arc::new(MemorySharedClientState::new()),
            user,
            &settings,
        );
        let listener = Arc::new(RecordingListener::default());
        let weak: Weak<dyn SyncEngineListener> =
            Arc::downgrade(&(listener.clone() as Arc<dyn SyncEngineListener>));
        sync_engine.subscribe(weak);
        Harness {
            queue,
            local_store,
            sync_engine,
            listener,
        }
    }

    impl Harness {
        async fn run<F, T>(&self, op: F) -> T
        where
            F: FnOnce(Arc<SyncEngine>) -> BoxedFuture<'static, FirestoreResult<T>> + Send + 'static,
            T: Send + 'static,
        {
            let engine = Arc::clone(&self.sync_engine);
            self.queue.enqueue(async move { op(engine).await }).await.unwrap()
        }

        fn last_snapshot(&self) -> ViewSnapshot {
            self.listener.snapshots.lock().unwrap().last().cloned().unwrap()
        }
    }

    fn query() -> Query {
        Query::new(ResourcePath::from_string("c").unwrap())
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64) -> Document {
        Document::synced(key(path), version(seconds), ObjectValue::empty())
    }

    fn keys(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot.docs.iter().map(|doc| doc.key().to_string()).collect()
    }

    /// Event delivering `docs` to `target_id` and marking it current.
    fn current_event(target_id: TargetId, seconds: i64, docs: &[&str]) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(seconds));
        let mut change = TargetChange::new(vec![seconds as u8], true);
        for path in docs {
            change.added_documents = change.added_documents.insert(key(path));
            event.document_updates = event
                .document_updates
                .insert(key(path), doc(path, seconds).into());
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[tokio::test]
    async fn listen_raises_cached_then_synced_snapshots() {
        let h = harness(100);
        h.run(|engine| box_future(async move { engine.apply_primary_state(true).await }))
            .await;
        let initial = h
            .run(|engine| box_future(async move { engine.listen(query()).await }))
            .await;
        assert!(initial.from_cache);
        assert!(initial.docs.is_empty());

        let target_id = h.sync_engine.lock().queries_by_target.keys().next().copied().unwrap();
        h.run(move |engine| {
            box_future(async move {
                engine
                    .apply_remote_event(current_event(target_id, 1, &["c/a", "c/b"]))
                    .await
            })
        })
        .await;

        let snapshot = h.last_snapshot();
        assert!(!snapshot.from_cache);
        assert_eq!(keys(&snapshot), vec!["c/a", "c/b"]);
        assert_eq!(
            h.sync_engine.get_remote_keys_for_target(target_id).len(),
            2
        );
    }

    #[tokio::test]
    async fn local_writes_show_up_with_pending_writes() {
        let h = harness(100);
        h.run(|engine| box_future(async move { engine.apply_primary_state(true).await }))
            .await;
        h.run(|engine| box_future(async move { engine.listen(query()).await }))
            .await;

        let (sender, _receiver) = oneshot::channel();
        h.run(move |engine| {
            box_future(async move {
                engine
                    .write(vec![Mutation::set(key("c/1"), ObjectValue::empty())], sender)
                    .await
            })
        })
        .await;

        let snapshot = h.last_snapshot();
        assert_eq!(keys(&snapshot), vec!["c/1"]);
        assert!(snapshot.has_pending_writes());
        assert!(snapshot.from_cache);
    }

    #[tokio::test]
    async fn rejected_writes_reach_the_callback_and_roll_back() {
        let h = harness(100);
        h.run(|engine| box_future(async move { engine.apply_primary_state(true).await }))
            .await;
        h.run(|engine| box_future(async move { engine.listen(query()).await }))
            .await;
        let (sender, receiver) = oneshot::channel();
        h.run(move |engine| {
            box_future(async move {
                engine
                    .write(vec![Mutation::set(key("c/1"), ObjectValue::empty())], sender)
                    .await
            })
        })
        .await;
        let (pending_sender, pending_receiver) = oneshot::channel();
        h.run(move |engine| {
            box_future(async move {
                engine.register_pending_writes_callback(pending_sender).await;
                Ok(())
            })
        })
        .await;

        let batch_id = h.local_store.get_highest_unacknowledged_batch_id().unwrap();
        h.run(move |engine| {
            box_future(async move {
                engine
                    .reject_failed_write(batch_id, permission_denied("no"))
                    .await
            })
        })
        .await;

        let error = receiver.await.unwrap().unwrap_err();
        assert_eq!(error.code, crate::error::FirestoreErrorCode::PermissionDenied);
        assert!(pending_receiver.await.unwrap().is_ok());
        assert!(h.last_snapshot().docs.is_empty());
    }

    #[tokio::test]
    async fn limbo_resolutions_are_bounded_and_queued() {
        let h = harness(1);
        h.run(|engine| box_future(async move { engine.apply_primary_state(true).await }))
            .await;
        h.run(|engine| box_future(async move { engine.listen(query()).await }))
            .await;
        let target_id = h.sync_engine.lock().queries_by_target.keys().next().copied().unwrap();
        h.run(move |engine| {
            box_future(async move {
                engine
                    .apply_remote_event(current_event(target_id, 1, &["c/a", "c/b"]))
                    .await
            })
        })
        .await;

        // The backend drops both documents from the target without deleting
        // them, which leaves both cached documents in limbo.
        h.run(move |engine| {
            box_future(async move {
                let mut event = RemoteEvent::new(version(2));
                let mut change = TargetChange::new(vec![2], true);
                change.removed_documents = change.removed_documents.insert(key("c/a"));
                change.removed_documents = change.removed_documents.insert(key("c/b"));
                event.target_changes.insert(target_id, change);
                engine.apply_remote_event(event).await
            })
        })
        .await;

        let active = h.sync_engine.active_limbo_document_resolutions();
        assert_eq!(active.keys().cloned().collect::<Vec<_>>(), vec![key("c/a")]);
        assert_eq!(h.sync_engine.enqueued_limbo_document_resolutions(), vec![key("c/b")]);
        assert!(h.last_snapshot().from_cache);

        // A rejected resolution counts as a delete and frees the slot.
        let limbo_target = active[&key("c/a")];
        h.run(move |engine| {
            box_future(async move {
                engine
                    .reject_listen(limbo_target, permission_denied("rules"))
                    .await
            })
        })
        .await;

        assert_eq!(
            h.sync_engine
                .active_limbo_document_resolutions()
                .keys()
                .cloned()
                .collect::<Vec<_>>(),
            vec![key("c/b")]
        );
        assert!(h.sync_engine.enqueued_limbo_document_resolutions().is_empty());
        assert_eq!(keys(&h.last_snapshot()), vec!["c/b"]);
    }

    #[tokio::test]
    async fn rejected_listens_notify_the_listener() {
        let h = harness(100);
        h.run(|engine| box_future(async move { engine.apply_primary_state(true).await }))
            .await;
        h.run(|engine| box_future(async move { engine.listen(query()).await }))
            .await;
        let target_id = h.sync_engine.lock().queries_by_target.keys().next().copied().unwrap();
        h.run(move |engine| {
            box_future(async move {
                engine
                    .reject_listen(target_id, permission_denied("denied"))
                    .await
            })
        })
        .await;

        let errors = h.listener.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, query().canonical_id());
        assert!(h.sync_engine.lock().query_views.is_empty());
    }

    #[tokio::test]
    async fn online_state_changes_from_the_remote_store_reach_views() {
        let h = harness(100);
        h.run(|engine| box_future(async move { engine.apply_primary_state(true).await }))
            .await;
        h.run(|engine| box_future(async move { engine.listen(query()).await }))
            .await;
        let target_id = h.sync_engine.lock().queries_by_target.keys().next().copied().unwrap();
        h.run(move |engine| {
            box_future(async move {
                engine
                    .apply_remote_event(current_event(target_id, 1, &["c/a"]))
                    .await
            })
        })
        .await;

        h.sync_engine
            .apply_online_state_change(OnlineState::Offline, OnlineStateSource::SharedClientState);
        assert!(h.listener.online_states.lock().unwrap().is_empty());

        h.sync_engine
            .apply_online_state_change(OnlineState::Offline, OnlineStateSource::RemoteStore);
        assert_eq!(*h.listener.online_states.lock().unwrap(), vec![OnlineState::Offline]);
        assert!(h.last_snapshot().from_cache);
    }
}
