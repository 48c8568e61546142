//! Owns the watch and write streams and keeps them in step with the set of
//! listened targets and the local mutation queue.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::{Mutex, MutexGuard};
use async_trait::async_trait;

use crate::config::SyncSettings;
use crate::core::types::OnlineState;
use crate::error::{
    internal_error, is_permanent_error, is_permanent_write_error, FirestoreError, FirestoreResult,
};
use crate::local::persistence::ignore_if_primary_lease_loss;
use crate::local::{LocalStore, TargetData, TargetPurpose};
use crate::model::{
    document_key_set, DocumentKeySet, MutationBatch, MutationBatchResult, MutationResult,
    SnapshotVersion, TargetId,
};
use crate::remote::credentials::User;
use crate::remote::datastore::Datastore;
use crate::remote::online_state_tracker::{OnlineStateCallback, OnlineStateTracker};
use crate::remote::remote_syncer::RemoteSyncer;
use crate::remote::stream::{WatchStream, WatchStreamListener, WriteStream, WriteStreamListener};
use crate::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::util::assert::hard_assert;
use crate::util::async_queue::AsyncQueue;
use crate::util::{box_future, BoxedFuture};

/// Reasons the network is currently not used. The network is used only
/// while there are none.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    /// A storage transaction failed; a retry probe re-enables the network.
    StorageFailed,
    IsSecondary,
    CredentialChange,
    Shutdown,
}

struct RemoteStoreState {
    /// Targets to keep watched, re-sent whenever the watch stream opens.
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Batches sent (or about to be sent) on the write stream, in order.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    /// Present while the watch stream is started.
    watch_change_aggregator: Option<WatchChangeAggregator>,
}

impl RemoteStoreState {
    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }
}

struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: Option<&'a dyn RemoteSyncer>,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_else(document_key_set)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Bridges the sync engine and the backend streams.
///
/// Every method must run on the async queue.
pub struct RemoteStore {
    me: Weak<RemoteStore>,
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    datastore: Arc<Datastore>,
    watch_stream: Arc<WatchStream>,
    write_stream: Arc<WriteStream>,
    online_state_tracker: OnlineStateTracker,
    max_pending_writes: usize,
    syncer: StdMutex<Option<Weak<dyn RemoteSyncer>>>,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    pub fn new(
        local_store: Arc<LocalStore>,
        datastore: Arc<Datastore>,
        queue: AsyncQueue,
        online_state_handler: OnlineStateCallback,
        settings: &SyncSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<RemoteStore>| {
            let watch_listener: Weak<dyn WatchStreamListener> = me.clone();
            let write_listener: Weak<dyn WriteStreamListener> = me.clone();
            Self {
                me: me.clone(),
                queue: queue.clone(),
                local_store,
                watch_stream: WatchStream::new(
                    queue.clone(),
                    Arc::clone(&datastore),
                    settings.backoff,
                    settings.idle_timeout,
                    watch_listener,
                ),
                write_stream: WriteStream::new(
                    queue.clone(),
                    Arc::clone(&datastore),
                    settings.backoff,
                    settings.idle_timeout,
                    write_listener,
                ),
                datastore,
                online_state_tracker: OnlineStateTracker::new(
                    queue,
                    online_state_handler,
                    settings.max_watch_stream_failures,
                    settings.online_state_timeout,
                ),
                max_pending_writes: settings.max_pending_writes,
                syncer: StdMutex::new(None),
                state: Mutex::new(RemoteStoreState {
                    listen_targets: BTreeMap::new(),
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::new(),
                    watch_change_aggregator: None,
                }),
            }
        })
    }

    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        *self.syncer.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(syncer);
    }

    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.syncer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| internal_error("remote store has no syncer"))
    }

    pub fn datastore(&self) -> &Arc<Datastore> {
        &self.datastore
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    async fn lock(&self) -> MutexGuard<'_, RemoteStoreState> {
        self.state.lock().await
    }

    pub async fn start(&self) -> FirestoreResult<()> {
        self.enable_network().await
    }

    /// Re-enables the network after [`disable_network`](Self::disable_network).
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.lock().await.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal().await
    }

    fn enable_network_internal(&self) -> BoxedFuture<'_, FirestoreResult<()>> {
        box_future(async move {
            {
                let mut state = self.lock().await;
                if !state.can_use_network() {
                    return Ok(());
                }
                if self.should_start_watch_stream(&state) {
                    self.start_watch_stream(&mut state);
                } else {
                    self.online_state_tracker.set(OnlineState::Unknown);
                }
            }
            self.fill_write_pipeline().await
        })
    }

    /// Stops both streams. Pending writes stay in the mutation queue and are
    /// sent again once the network is enabled.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.lock().await.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Offline);
        Ok(())
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop().await;
        self.watch_stream.stop().await;

        let mut state = self.lock().await;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.watch_change_aggregator = None;
    }

    pub async fn shutdown(&self) {
        log::debug!("RemoteStore shutting down");
        self.lock().await.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal().await;
        // Listeners should not see an offline event during shutdown.
        self.online_state_tracker.set(OnlineState::Unknown);
    }

    /// Starts watching `target_data`. Listening to an already watched target
    /// is a no-op.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let mut state = self.lock().await;
        if state.listen_targets.contains_key(&target_data.target_id) {
            return Ok(());
        }
        state
            .listen_targets
            .insert(target_data.target_id, target_data.clone());

        if self.should_start_watch_stream(&state) {
            self.start_watch_stream(&mut state);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&mut state, &target_data)?;
        }
        Ok(())
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let mut state = self.lock().await;
        hard_assert(
            state.listen_targets.remove(&target_id).is_some(),
            format!("unlisten called on target {target_id} that is not being watched"),
        );
        if self.watch_stream.is_open() {
            self.send_unwatch_request(&mut state, target_id)?;
        }
        if state.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if state.can_use_network() {
                // Without targets the stream will not be restarted, so the
                // online state would otherwise stay stale.
                self.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    fn send_watch_request(&self, state: &mut RemoteStoreState, target_data: &TargetData) -> FirestoreResult<()> {
        if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        self.watch_stream.watch(target_data)
    }

    fn send_unwatch_request(&self, state: &mut RemoteStoreState, target_id: TargetId) -> FirestoreResult<()> {
        if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.unwatch(target_id)
    }

    fn should_start_watch_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && !self.watch_stream.is_started() && !state.listen_targets.is_empty()
    }

    fn start_watch_stream(&self, state: &mut RemoteStoreState) {
        hard_assert(
            self.should_start_watch_stream(state),
            "start_watch_stream called when the stream should not start",
        );
        state.watch_change_aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    /// Takes the network offline after a storage failure and schedules a
    /// probe that re-enables it once storage works again. Other errors are
    /// returned unchanged.
    async fn disable_network_until_recovery(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !error.is_storage_failure() {
            return Err(error);
        }
        log::debug!("disabling network until storage recovers: {error}");
        self.lock().await.offline_causes.insert(OfflineCause::StorageFailed);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Offline);

        let me = self.me.clone();
        self.queue.enqueue_retryable(move || {
            let me = me.clone();
            box_future(async move {
                let Some(store) = me.upgrade() else {
                    return Ok(());
                };
                log::debug!("retrying storage access before re-enabling the network");
                store.local_store.get_last_remote_snapshot_version()?;
                store
                    .lock()
                    .await
                    .offline_causes
                    .remove(&OfflineCause::StorageFailed);
                store.enable_network_internal().await
            })
        });
        Ok(())
    }

    /// Builds a remote event from the aggregated changes and hands it to
    /// the syncer, updating resume tokens and re-listening mismatched
    /// targets first.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        hard_assert(
            !snapshot_version.is_min(),
            "cannot raise a snapshot at the minimum version",
        );
        let syncer = self.syncer()?;
        let event = {
            let mut guard = self.lock().await;
            let state = &mut *guard;
            let Some(aggregator) = state.watch_change_aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenTargetMetadata {
                listen_targets: &state.listen_targets,
                syncer: Some(syncer.as_ref()),
            };
            let event = aggregator.create_remote_event(snapshot_version, &metadata);

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = state.listen_targets.get(target_id) {
                    let updated = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                    state.listen_targets.insert(*target_id, updated);
                }
            }

            for &target_id in &event.target_mismatches {
                let Some(target_data) = state.listen_targets.get(&target_id).cloned() else {
                    continue;
                };
                // A fresh listen without a resume token lets the backend
                // resend the whole result set.
                state.listen_targets.insert(
                    target_id,
                    target_data.with_resume_token(Vec::new(), target_data.snapshot_version),
                );
                self.send_unwatch_request(state, target_id)?;
                let request = TargetData::new(
                    target_data.target.clone(),
                    target_id,
                    TargetPurpose::ExistenceFilterMismatch,
                    target_data.sequence_number,
                );
                self.send_watch_request(state, &request)?;
            }
            event
        };
        syncer.apply_remote_event(event).await
    }

    async fn handle_target_error(&self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let Some(error) = change.cause.clone() else {
            return Ok(());
        };
        let syncer = self.syncer()?;
        for &target_id in &change.target_ids {
            let removed = {
                let mut state = self.lock().await;
                let removed = state.listen_targets.remove(&target_id).is_some();
                if removed {
                    if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                        aggregator.remove_target(target_id);
                    }
                }
                removed
            };
            if removed {
                log::debug!("target {target_id} removed by the backend: {error}");
                syncer.reject_listen(target_id, error.clone()).await?;
            }
        }
        Ok(())
    }

    /// Moves batches from the mutation queue into the write pipeline until
    /// it is full, starting the write stream when needed.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut state = self.lock().await;
        let mut last_batch_id = state.write_pipeline.back().map(|batch| batch.batch_id);
        while state.can_use_network() && state.write_pipeline.len() < self.max_pending_writes {
            match self.local_store.next_mutation_batch(last_batch_id) {
                Ok(Some(batch)) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(&mut state, batch)?;
                }
                Ok(None) => {
                    if state.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
                Err(err) => {
                    drop(state);
                    return self.disable_network_until_recovery(err).await;
                }
            }
        }

        if self.should_start_write_stream(&state) {
            self.write_stream.start();
        }
        Ok(())
    }

    fn add_to_write_pipeline(&self, state: &mut RemoteStoreState, batch: MutationBatch) -> FirestoreResult<()> {
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&batch.mutations)?;
        }
        state.write_pipeline.push_back(batch);
        Ok(())
    }

    fn should_start_write_stream(&self, state: &RemoteStoreState) -> bool {
        state.can_use_network() && !self.write_stream.is_started() && !state.write_pipeline.is_empty()
    }

    fn handle_handshake_error(&self, error: &FirestoreError) -> FirestoreResult<()> {
        if is_permanent_error(error.code) {
            // The stream token may be what the backend rejected.
            log::debug!("write stream handshake failed permanently, resetting stream token: {error}");
            self.write_stream.set_last_stream_token(Vec::new());
            ignore_if_primary_lease_loss(self.local_store.set_last_stream_token(Vec::new()))?;
        }
        Ok(())
    }

    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        // The rejected batch is always at the head of the pipeline.
        let batch = self.lock().await.write_pipeline.pop_front();
        self.write_stream.inhibit_backoff();
        if let Some(batch) = batch {
            log::debug!("batch {} rejected by the backend: {error}", batch.batch_id);
            self.syncer()?.reject_failed_write(batch.batch_id, error).await?;
        }
        self.fill_write_pipeline().await
    }

    /// Restarts the streams under the new credentials after the syncer has
    /// switched to `user`.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.queue.verify_operation_in_progress();
        log::debug!("RemoteStore received new credentials");
        let uses_network = {
            let mut state = self.lock().await;
            let uses_network = state.can_use_network();
            state.offline_causes.insert(OfflineCause::CredentialChange);
            uses_network
        };
        self.disable_network_internal().await;
        if uses_network {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        self.syncer()?.handle_credential_change(user).await?;
        self.lock()
            .await
            .offline_causes
            .remove(&OfflineCause::CredentialChange);
        self.enable_network_internal().await
    }

    /// Secondary clients do not use the network.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary {
            self.lock().await.offline_causes.remove(&OfflineCause::IsSecondary);
            self.enable_network_internal().await
        } else {
            self.lock().await.offline_causes.insert(OfflineCause::IsSecondary);
            self.disable_network_internal().await;
            self.online_state_tracker.set(OnlineState::Unknown);
            Ok(())
        }
    }

    /// Whether the network is enabled and this client may use it.
    pub async fn can_use_network(&self) -> bool {
        self.lock().await.can_use_network()
    }

    pub async fn write_pipeline_len(&self) -> usize {
        self.lock().await.write_pipeline.len()
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WatchStreamListener for RemoteStore {
    async fn on_watch_stream_open(&self) -> FirestoreResult<()> {
        let mut state = self.lock().await;
        let targets: Vec<TargetData> = state.listen_targets.values().cloned().collect();
        for target_data in &targets {
            self.send_watch_request(&mut state, target_data)?;
        }
        Ok(())
    }

    async fn on_watch_stream_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        // Any message means the backend is reachable.
        self.online_state_tracker.set(OnlineState::Online);

        if let WatchChange::Target(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed && target_change.cause.is_some() {
                return match self.handle_target_error(target_change).await {
                    Ok(()) => Ok(()),
                    Err(err) => self.disable_network_until_recovery(err).await,
                };
            }
        }

        {
            let syncer = self.syncer().ok();
            let mut guard = self.lock().await;
            let state = &mut *guard;
            if let Some(aggregator) = state.watch_change_aggregator.as_mut() {
                let metadata = ListenTargetMetadata {
                    listen_targets: &state.listen_targets,
                    syncer: syncer.as_deref(),
                };
                match &change {
                    WatchChange::Document(doc_change) => {
                        aggregator.handle_document_change(doc_change, &metadata)
                    }
                    WatchChange::ExistenceFilter(filter) => {
                        aggregator.handle_existence_filter(filter, &metadata)
                    }
                    WatchChange::Target(target_change) => {
                        aggregator.handle_target_change(target_change, &metadata)
                    }
                }
            }
        }

        if snapshot_version.is_min() {
            return Ok(());
        }
        let last_remote_version = match self.local_store.get_last_remote_snapshot_version() {
            Ok(version) => version,
            Err(err) => return self.disable_network_until_recovery(err).await,
        };
        // Older versions can arrive right after a restart, before the
        // backend caught up with what was persisted.
        if snapshot_version >= last_remote_version {
            if let Err(err) = self.raise_watch_snapshot(snapshot_version).await {
                return self.disable_network_until_recovery(err).await;
            }
        }
        Ok(())
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let mut state = self.lock().await;
        if error.is_none() {
            hard_assert(
                !self.should_start_watch_stream(&state),
                "watch stream closed without error while it should be running",
            );
        }
        state.watch_change_aggregator = None;

        if self.should_start_watch_stream(&state) {
            if let Some(err) = &error {
                self.online_state_tracker.handle_watch_stream_failure(err);
            }
            self.start_watch_stream(&mut state);
        } else {
            // No targets are left, so the client can no longer tell whether
            // it is online.
            self.online_state_tracker.set(OnlineState::Unknown);
        }
        Ok(())
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamListener for RemoteStore {
    async fn on_write_stream_open(&self) -> FirestoreResult<()> {
        self.write_stream.write_handshake()
    }

    async fn on_write_handshake_complete(&self) -> FirestoreResult<()> {
        ignore_if_primary_lease_loss(
            self.local_store
                .set_last_stream_token(self.write_stream.last_stream_token()),
        )?;
        let state = self.lock().await;
        for batch in &state.write_pipeline {
            self.write_stream.write_mutations(&batch.mutations)?;
        }
        Ok(())
    }

    async fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let batch = self
            .lock()
            .await
            .write_pipeline
            .pop_front()
            .ok_or_else(|| internal_error("received a write result with an empty write pipeline"))?;
        let result = MutationBatchResult::from(
            batch,
            commit_version,
            results,
            self.write_stream.last_stream_token(),
        );
        self.syncer()?.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn on_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        if error.is_none() {
            let state = self.lock().await;
            hard_assert(
                !self.should_start_write_stream(&state),
                "write stream closed without error while it should be running",
            );
        }

        if let Some(err) = error {
            let has_pending = !self.lock().await.write_pipeline.is_empty();
            if has_pending {
                if self.write_stream.handshake_complete() {
                    self.handle_write_error(err).await?;
                } else {
                    self.handle_handshake_error(&err)?;
                }
            }
        }

        let state = self.lock().await;
        if self.should_start_write_stream(&state) {
            self.write_stream.start();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::error::{FirestoreErrorCode, permission_denied};
    use crate::local::memory::MemoryPersistence;
    use crate::local::IndexFreeQueryEngine;
    use crate::model::{BatchId, DatabaseId, DocumentKey, Mutation, ObjectValue, ResourcePath};
    use crate::remote::connection::{InMemoryConnection, ServerStream};
    use crate::remote::credentials::NoopTokenProvider;
    use crate::remote::remote_event::RemoteEvent;
    use crate::remote::serializer::JsonProtoSerializer;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSyncer {
        events: StdMutex<Vec<RemoteEvent>>,
        acknowledged: StdMutex<Vec<BatchId>>,
        rejected_writes: StdMutex<Vec<(BatchId, FirestoreErrorCode)>>,
        rejected_listens: StdMutex<Vec<TargetId>>,
    }

    impl RemoteSyncer for RecordingSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> BoxedFuture<'_, FirestoreResult<()>> {
            self.events.lock().unwrap().push(event);
            box_future(async { Ok(()) })
        }

        fn reject_listen(&self, target_id: TargetId, _error: FirestoreError) -> BoxedFuture<'_, FirestoreResult<()>> {
            self.rejected_listens.lock().unwrap().push(target_id);
            box_future(async { Ok(()) })
        }

        fn apply_successful_write(&self, result: MutationBatchResult) -> BoxedFuture<'_, FirestoreResult<()>> {
            self.acknowledged.lock().unwrap().push(result.batch.batch_id);
            box_future(async { Ok(()) })
        }

        fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> BoxedFuture<'_, FirestoreResult<()>> {
            self.rejected_writes.lock().unwrap().push((batch_id, error.code));
            box_future(async { Ok(()) })
        }

        fn handle_credential_change(&self, _user: User) -> BoxedFuture<'_, FirestoreResult<()>> {
            box_future(async { Ok(()) })
        }

        fn get_remote_keys_for_target(&self, _target_id: TargetId) -> DocumentKeySet {
            document_key_set()
        }
    }

    struct Harness {
        queue: AsyncQueue,
        connection: InMemoryConnection,
        local_store: Arc<LocalStore>,
        syncer: Arc<RecordingSyncer>,
        remote_store: Arc<RemoteStore>,
        online_states: Arc<StdMutex<Vec<OnlineState>>>,
    }

    fn harness() -> Harness {
        let queue = AsyncQueue::new();
        let connection = InMemoryConnection::new();
        let settings = SyncSettings::default();
        let local_store = Arc::new(LocalStore::new(
            Arc::new(MemoryPersistence::new("client")),
            IndexFreeQueryEngine::new(),
            &User::unauthenticated(),
            &settings,
        ));
        local_store.start().unwrap();
        let datastore = Arc::new(Datastore::new(
            Arc::new(connection.clone()),
            Arc::new(NoopTokenProvider),
            Arc::new(JsonProtoSerializer::new(DatabaseId::default("p"))),
        ));
        let online_states = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&online_states);
        let remote_store = RemoteStore::new(
            Arc::clone(&local_store),
            datastore,
            queue.clone(),
            Arc::new(move |state| sink.lock().unwrap().push(state)),
            &settings,
        );
        let syncer = Arc::new(RecordingSyncer::default());
        let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&(syncer.clone() as Arc<dyn RemoteSyncer>));
        remote_store.set_syncer(weak);
        Harness {
            queue,
            connection,
            local_store,
            syncer,
            remote_store,
            online_states,
        }
    }

    impl Harness {
        async fn run<F>(&self, op: F)
        where
            F: FnOnce(Arc<RemoteStore>) -> BoxedFuture<'static, FirestoreResult<()>> + Send + 'static,
        {
            let store = Arc::clone(&self.remote_store);
            self.queue.enqueue(async move { op(store).await }).await.unwrap();
            self.settle().await;
        }

        async fn settle(&self) {
            for _ in 0..5 {
                tokio::task::yield_now().await;
                self.queue.drain().await.unwrap();
            }
        }

        async fn open_write_stream(&self) -> ServerStream {
            let server = self.connection.accept("Write").await;
            self.settle().await;
            let handshake = server.receive().await.unwrap();
            assert!(handshake.get("writes").is_none());
            server.send(json!({ "streamToken": "AQ==" })).unwrap();
            self.settle().await;
            server
        }
    }

    fn write(store: &LocalStore, path: &str) -> BatchId {
        let key = DocumentKey::from_string(path).unwrap();
        store
            .local_write(vec![Mutation::set(key, ObjectValue::empty())])
            .unwrap()
            .batch_id
    }

    #[tokio::test]
    async fn pending_writes_flow_through_the_write_stream() {
        let h = harness();
        let batch_id = write(&h.local_store, "rooms/a");
        h.run(|store| box_future(async move { store.start().await })).await;

        let server = h.open_write_stream().await;
        let request = server.receive().await.unwrap();
        assert_eq!(request["streamToken"], json!("AQ=="));
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));

        server
            .send(json!({
                "streamToken": "Ag==",
                "commitTime": "2024-01-01T00:00:01Z",
                "writeResults": [{ "updateTime": "2024-01-01T00:00:01Z" }]
            }))
            .unwrap();
        h.settle().await;
        assert_eq!(*h.syncer.acknowledged.lock().unwrap(), vec![batch_id]);
        assert_eq!(h.remote_store.write_pipeline_len().await, 0);
    }

    #[tokio::test]
    async fn permanent_write_errors_reject_the_head_batch() {
        let h = harness();
        let first = write(&h.local_store, "rooms/a");
        h.run(|store| box_future(async move { store.start().await })).await;
        let server = h.open_write_stream().await;
        let _ = server.receive().await.unwrap();

        server.fail(permission_denied("no"));
        h.settle().await;
        assert_eq!(
            *h.syncer.rejected_writes.lock().unwrap(),
            vec![(first, FirestoreErrorCode::PermissionDenied)]
        );
    }

    #[tokio::test]
    async fn existence_filter_mismatch_relistens_without_a_resume_token() {
        let h = harness();
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, 2, TargetPurpose::Listen, 1)
            .with_resume_token(vec![9], SnapshotVersion::min());
        h.run(move |store| box_future(async move { store.listen(data).await })).await;

        let server = h.connection.accept("Listen").await;
        h.settle().await;
        let request = server.receive().await.unwrap();
        assert_eq!(request["addTarget"]["targetId"], json!(2));
        assert_eq!(request["addTarget"]["resumeToken"], json!("CQ=="));

        server
            .send(json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }))
            .unwrap();
        server.send(json!({ "filter": { "targetId": 2, "count": 1 } })).unwrap();
        server
            .send(json!({ "targetChange": { "readTime": "2024-01-01T00:00:01Z" } }))
            .unwrap();
        h.settle().await;

        assert_eq!(server.receive().await.unwrap()["removeTarget"], json!(2));
        let relisten = server.receive().await.unwrap();
        assert_eq!(relisten["addTarget"]["targetId"], json!(2));
        assert!(relisten["addTarget"].get("resumeToken").is_none());
        assert_eq!(relisten["labels"]["goog-listen-tags"], json!("existence-filter-mismatch"));

        let events = h.syncer.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].target_mismatches.contains(&2));
        assert_eq!(h.online_states.lock().unwrap().last(), Some(&OnlineState::Online));
    }

    #[tokio::test]
    async fn target_removal_with_a_cause_rejects_the_listen() {
        let h = harness();
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, 2, TargetPurpose::Listen, 1);
        h.run(move |store| box_future(async move { store.listen(data).await })).await;
        let server = h.connection.accept("Listen").await;
        h.settle().await;

        server
            .send(json!({ "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": { "code": 7, "message": "denied" }
            } }))
            .unwrap();
        h.settle().await;
        assert_eq!(*h.syncer.rejected_listens.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn disabling_the_network_reports_offline() {
        let h = harness();
        h.run(|store| box_future(async move { store.start().await })).await;
        h.run(|store| box_future(async move { store.disable_network().await })).await;
        assert_eq!(h.online_states.lock().unwrap().last(), Some(&OnlineState::Offline));
        assert!(!h.remote_store.can_use_network().await);
    }
}
