//! State that tabs share through the broadcast storage: each tab's active
//! targets, the outcome of mutation batches and query targets, the primary
//! tab's online state and the last used sequence number.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::types::OnlineState;
use crate::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::model::{BatchId, ListenSequenceNumber, TargetId};
use crate::multi_tab::broadcast::{BroadcastChannel, BroadcastSubscription, StorageEvent};
use crate::platform::runtime::now_millis;
use crate::remote::credentials::User;
use crate::util::AsyncQueue;

pub type ClientId = String;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

/// Callbacks through which the shared state drives the local sync engine.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait SharedClientStateSyncer: Send + Sync {
    /// Another tab changed the state of a batch of the current user.
    async fn apply_batch_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    /// The primary tab reported new results or a failure for a target.
    async fn apply_target_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()>;

    /// The union of all tabs' targets changed. Only acted upon by the primary.
    async fn apply_active_target_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> FirestoreResult<()>;

    /// Ids of tabs whose metadata is recent.
    fn get_active_clients(&self) -> FirestoreResult<Vec<ClientId>>;
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;
pub type SequenceNumberHandler = Arc<dyn Fn(ListenSequenceNumber) + Send + Sync>;

pub trait SharedClientState: Send + Sync {
    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>);

    fn set_online_state_handler(&self, handler: OnlineStateHandler);

    fn set_sequence_number_handler(&self, handler: SequenceNumberHandler);

    fn start(&self) -> FirestoreResult<()>;

    fn shutdown(&self);

    fn add_pending_mutation(&self, batch_id: BatchId);

    fn update_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<&FirestoreError>,
    );

    /// Registers a target of this tab and returns its last known state.
    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState;

    fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<&FirestoreError>,
    );

    fn remove_local_query_target(&self, target_id: TargetId);

    fn is_local_query_target(&self, target_id: TargetId) -> bool;

    /// Whether any tab listens to `target_id`.
    fn is_active_query_target(&self, target_id: TargetId) -> bool;

    fn clear_query_state(&self, target_id: TargetId);

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId>;

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]);

    fn set_online_state(&self, state: OnlineState);

    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber);
}

#[derive(Default)]
struct MemoryState {
    local_targets: BTreeSet<TargetId>,
    query_states: BTreeMap<TargetId, QueryTargetState>,
    online_state_handler: Option<OnlineStateHandler>,
}

/// Shared state of a client that has only one tab.
#[derive(Default)]
pub struct MemorySharedClientState {
    state: Mutex<MemoryState>,
}

impl MemorySharedClientState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SharedClientState for MemorySharedClientState {
    fn set_syncer(&self, _syncer: Weak<dyn SharedClientStateSyncer>) {}

    fn set_online_state_handler(&self, handler: OnlineStateHandler) {
        self.lock().online_state_handler = Some(handler);
    }

    fn set_sequence_number_handler(&self, _handler: SequenceNumberHandler) {}

    fn start(&self) -> FirestoreResult<()> {
        Ok(())
    }

    fn shutdown(&self) {}

    fn add_pending_mutation(&self, _batch_id: BatchId) {}

    fn update_mutation_state(
        &self,
        _batch_id: BatchId,
        _state: MutationBatchState,
        _error: Option<&FirestoreError>,
    ) {
    }

    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState {
        let mut state = self.lock();
        state.local_targets.insert(target_id);
        *state
            .query_states
            .entry(target_id)
            .or_insert(QueryTargetState::NotCurrent)
    }

    fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        _error: Option<&FirestoreError>,
    ) {
        self.lock().query_states.insert(target_id, state);
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        self.lock().local_targets.remove(&target_id);
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.lock().local_targets.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.is_local_query_target(target_id)
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.lock().query_states.remove(&target_id);
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        self.lock().local_targets.clone()
    }

    fn handle_user_change(&self, _user: &User, _removed: &[BatchId], _added: &[BatchId]) {}

    fn set_online_state(&self, state: OnlineState) {
        let handler = self.lock().online_state_handler.clone();
        if let Some(handler) = handler {
            handler(state);
        }
    }

    fn write_sequence_number(&self, _sequence_number: ListenSequenceNumber) {}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClientStateRecord {
    active_target_ids: Vec<TargetId>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ErrorRecord {
    code: i32,
    message: String,
}

impl ErrorRecord {
    fn from_error(error: &FirestoreError) -> Self {
        Self {
            code: error.code.grpc_code(),
            message: error.message().to_string(),
        }
    }

    fn into_error(self) -> FirestoreError {
        FirestoreError::new(FirestoreErrorCode::from_grpc_code(self.code), self.message)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MutationStateRecord {
    state: MutationBatchState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryTargetStateRecord {
    state: QueryTargetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorRecord>,
    update_time_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnlineStateRecord {
    client_id: ClientId,
    online_state: OnlineState,
}

/// A broadcast entry written by another tab, decoded.
#[derive(Debug)]
enum SharedEvent {
    /// `None` when the tab went away.
    ClientState {
        client_id: ClientId,
        targets: Option<BTreeSet<TargetId>>,
    },
    Mutation {
        batch_id: BatchId,
        uid: Option<String>,
        record: MutationStateRecord,
    },
    QueryTarget {
        target_id: TargetId,
        record: QueryTargetStateRecord,
    },
    OnlineState(OnlineStateRecord),
    SequenceNumber(ListenSequenceNumber),
}

struct Keys {
    client_prefix: String,
    mutation_prefix: String,
    target_prefix: String,
    online_state: String,
    sequence_number: String,
}

impl Keys {
    fn new(persistence_key: &str) -> Self {
        Self {
            client_prefix: format!("firestore_clients_{persistence_key}_"),
            mutation_prefix: format!("firestore_mutations_{persistence_key}_"),
            target_prefix: format!("firestore_targets_{persistence_key}_"),
            online_state: format!("firestore_online_state_{persistence_key}"),
            sequence_number: format!("firestore_sequence_number_{persistence_key}"),
        }
    }

    fn client(&self, client_id: &str) -> String {
        format!("{}{client_id}", self.client_prefix)
    }

    fn mutation(&self, user: &User, batch_id: BatchId) -> String {
        match user.uid() {
            Some(uid) => format!("{}{batch_id}_{uid}", self.mutation_prefix),
            None => format!("{}{batch_id}", self.mutation_prefix),
        }
    }

    fn target(&self, target_id: TargetId) -> String {
        format!("{}{target_id}", self.target_prefix)
    }

    fn parse(&self, event: &StorageEvent) -> Option<SharedEvent> {
        let key = event.key.as_str();
        let value = event.new_value.as_deref();
        if let Some(client_id) = key.strip_prefix(&self.client_prefix) {
            let targets = match value {
                Some(value) => Some(
                    decode::<ClientStateRecord>(key, value)?
                        .active_target_ids
                        .into_iter()
                        .collect(),
                ),
                None => None,
            };
            return Some(SharedEvent::ClientState {
                client_id: client_id.to_string(),
                targets,
            });
        }
        let value = value?;
        if let Some(rest) = key.strip_prefix(&self.mutation_prefix) {
            let (batch_id, uid) = match rest.split_once('_') {
                Some((batch_id, uid)) => (batch_id, Some(uid.to_string())),
                None => (rest, None),
            };
            return Some(SharedEvent::Mutation {
                batch_id: batch_id.parse().ok()?,
                uid,
                record: decode(key, value)?,
            });
        }
        if let Some(target_id) = key.strip_prefix(&self.target_prefix) {
            return Some(SharedEvent::QueryTarget {
                target_id: target_id.parse().ok()?,
                record: decode(key, value)?,
            });
        }
        if key == self.online_state {
            return decode(key, value).map(SharedEvent::OnlineState);
        }
        if key == self.sequence_number {
            return value.parse().ok().map(SharedEvent::SequenceNumber);
        }
        None
    }
}

fn decode<T: for<'de> Deserialize<'de>>(key: &str, value: &str) -> Option<T> {
    match serde_json::from_str(value) {
        Ok(record) => Some(record),
        Err(err) => {
            log::error!("failed to parse shared client state entry {key}: {err}");
            None
        }
    }
}

struct BroadcastState {
    started: bool,
    user: User,
    local_targets: BTreeSet<TargetId>,
    remote_clients: BTreeMap<ClientId, BTreeSet<TargetId>>,
    syncer: Option<Weak<dyn SharedClientStateSyncer>>,
    online_state_handler: Option<OnlineStateHandler>,
    sequence_number_handler: Option<SequenceNumberHandler>,
    subscription: Option<BroadcastSubscription>,
}

impl BroadcastState {
    fn all_targets(&self) -> BTreeSet<TargetId> {
        let mut targets = self.local_targets.clone();
        for remote in self.remote_clients.values() {
            targets.extend(remote.iter().copied());
        }
        targets
    }
}

struct BroadcastInner {
    client_id: ClientId,
    keys: Keys,
    channel: Arc<dyn BroadcastChannel>,
    queue: AsyncQueue,
    state: Mutex<BroadcastState>,
}

/// Shares client state with other tabs through a [`BroadcastChannel`].
///
/// Entries written by other tabs are decoded on arrival and handed to the
/// syncer from this tab's queue.
pub struct BroadcastSharedClientState {
    inner: Arc<BroadcastInner>,
}

impl BroadcastSharedClientState {
    pub fn new(
        persistence_key: &str,
        client_id: impl Into<ClientId>,
        channel: Arc<dyn BroadcastChannel>,
        queue: AsyncQueue,
        user: User,
    ) -> Self {
        Self {
            inner: Arc::new(BroadcastInner {
                client_id: client_id.into(),
                keys: Keys::new(persistence_key),
                channel,
                queue,
                state: Mutex::new(BroadcastState {
                    started: false,
                    user,
                    local_targets: BTreeSet::new(),
                    remote_clients: BTreeMap::new(),
                    syncer: None,
                    online_state_handler: None,
                    sequence_number_handler: None,
                    subscription: None,
                }),
            }),
        }
    }
}

impl BroadcastInner {
    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write<T: Serialize>(&self, key: &str, record: &T) {
        let result = serde_json::to_string(record)
            .map_err(FirestoreError::from)
            .and_then(|value| self.channel.set(key, &value));
        if let Err(err) = result {
            log::warn!("failed to write shared client state {key}: {err}");
        }
    }

    fn persist_client_state(&self) {
        let targets: Vec<TargetId> = self.lock().local_targets.iter().copied().collect();
        self.write(
            &self.keys.client(&self.client_id),
            &ClientStateRecord {
                active_target_ids: targets,
                update_time_ms: now_millis(),
            },
        );
    }

    fn persist_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<&FirestoreError>,
    ) {
        let user = self.lock().user.clone();
        self.write(
            &self.keys.mutation(&user, batch_id),
            &MutationStateRecord {
                state,
                error: error.map(ErrorRecord::from_error),
                update_time_ms: now_millis(),
            },
        );
    }

    fn remove_mutation_state(&self, batch_id: BatchId) {
        let user = self.lock().user.clone();
        self.channel.remove(&self.keys.mutation(&user, batch_id));
    }

    fn syncer(&self) -> Option<Arc<dyn SharedClientStateSyncer>> {
        self.lock().syncer.as_ref().and_then(Weak::upgrade)
    }

    fn on_storage_event(self: &Arc<Self>, event: &StorageEvent) {
        if !self.lock().started {
            return;
        }
        let Some(parsed) = self.keys.parse(event) else {
            return;
        };
        let inner = Arc::downgrade(self);
        self.queue.enqueue_and_forget(async move {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if let Err(err) = inner.dispatch(parsed).await {
                log::warn!("failed to apply shared client state change: {err}");
            }
        });
    }

    async fn dispatch(&self, event: SharedEvent) -> FirestoreResult<()> {
        match event {
            SharedEvent::ClientState { client_id, targets } => {
                if client_id == self.client_id {
                    return Ok(());
                }
                let (added, removed) = {
                    let mut state = self.lock();
                    let before = state.all_targets();
                    let previous = match targets {
                        Some(targets) => state.remote_clients.insert(client_id, targets),
                        None => state.remote_clients.remove(&client_id),
                    };
                    let after = state.all_targets();
                    let added: Vec<TargetId> = after.difference(&before).copied().collect();
                    let removed: Vec<TargetId> = previous
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|target_id| !after.contains(target_id))
                        .collect();
                    (added, removed)
                };
                if added.is_empty() && removed.is_empty() {
                    return Ok(());
                }
                match self.syncer() {
                    Some(syncer) => syncer.apply_active_target_change(added, removed).await,
                    None => Ok(()),
                }
            }
            SharedEvent::Mutation {
                batch_id,
                uid,
                record,
            } => {
                if self.lock().user.uid() != uid.as_deref() {
                    log::debug!("ignoring mutation state of batch {batch_id} for another user");
                    return Ok(());
                }
                match self.syncer() {
                    Some(syncer) => {
                        syncer
                            .apply_batch_state(
                                batch_id,
                                record.state,
                                record.error.map(ErrorRecord::into_error),
                            )
                            .await
                    }
                    None => Ok(()),
                }
            }
            SharedEvent::QueryTarget { target_id, record } => match self.syncer() {
                Some(syncer) => {
                    syncer
                        .apply_target_state(
                            target_id,
                            record.state,
                            record.error.map(ErrorRecord::into_error),
                        )
                        .await
                }
                None => Ok(()),
            },
            SharedEvent::OnlineState(record) => {
                let handler = {
                    let state = self.lock();
                    if !state.remote_clients.contains_key(&record.client_id) {
                        return Ok(());
                    }
                    state.online_state_handler.clone()
                };
                if let Some(handler) = handler {
                    handler(record.online_state);
                }
                Ok(())
            }
            SharedEvent::SequenceNumber(sequence_number) => {
                let handler = self.lock().sequence_number_handler.clone();
                if let Some(handler) = handler {
                    handler(sequence_number);
                }
                Ok(())
            }
        }
    }
}

impl SharedClientState for BroadcastSharedClientState {
    fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>) {
        self.inner.lock().syncer = Some(syncer);
    }

    fn set_online_state_handler(&self, handler: OnlineStateHandler) {
        self.inner.lock().online_state_handler = Some(handler);
    }

    fn set_sequence_number_handler(&self, handler: SequenceNumberHandler) {
        self.inner.lock().sequence_number_handler = Some(handler);
    }

    fn start(&self) -> FirestoreResult<()> {
        let active_clients = match self.inner.syncer() {
            Some(syncer) => syncer.get_active_clients()?,
            None => Vec::new(),
        };
        let mut remote_clients = BTreeMap::new();
        for client_id in active_clients {
            if client_id == self.inner.client_id {
                continue;
            }
            let key = self.inner.keys.client(&client_id);
            let Some(value) = self.inner.channel.get(&key) else {
                continue;
            };
            if let Some(record) = decode::<ClientStateRecord>(&key, &value) {
                remote_clients.insert(client_id, record.active_target_ids.into_iter().collect());
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let subscription = self.inner.channel.subscribe(Arc::new(move |event: &StorageEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.on_storage_event(event);
            }
        }))?;

        let online_state = self
            .inner
            .channel
            .get(&self.inner.keys.online_state)
            .and_then(|value| decode::<OnlineStateRecord>(&self.inner.keys.online_state, &value));
        let handler = {
            let mut state = self.inner.lock();
            state.remote_clients = remote_clients;
            state.subscription = Some(subscription);
            state.started = true;
            online_state
                .filter(|record| state.remote_clients.contains_key(&record.client_id))
                .and_then(|record| {
                    state
                        .online_state_handler
                        .clone()
                        .map(|handler| (handler, record.online_state))
                })
        };
        self.inner.persist_client_state();
        if let Some((handler, online_state)) = handler {
            handler(online_state);
        }
        Ok(())
    }

    fn shutdown(&self) {
        let subscription = {
            let mut state = self.inner.lock();
            if !state.started {
                return;
            }
            state.started = false;
            state.subscription.take()
        };
        drop(subscription);
        self.inner
            .channel
            .remove(&self.inner.keys.client(&self.inner.client_id));
    }

    fn add_pending_mutation(&self, batch_id: BatchId) {
        self.inner
            .persist_mutation_state(batch_id, MutationBatchState::Pending, None);
    }

    fn update_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<&FirestoreError>,
    ) {
        self.inner.persist_mutation_state(batch_id, state, error);
        // Final states are consumed on arrival; the entry is not read later.
        self.inner.remove_mutation_state(batch_id);
    }

    fn add_local_query_target(&self, target_id: TargetId) -> QueryTargetState {
        let mut query_state = QueryTargetState::NotCurrent;
        if self.is_active_query_target(target_id) {
            let key = self.inner.keys.target(target_id);
            if let Some(record) = self
                .inner
                .channel
                .get(&key)
                .and_then(|value| decode::<QueryTargetStateRecord>(&key, &value))
            {
                query_state = record.state;
            }
        }
        self.inner.lock().local_targets.insert(target_id);
        self.inner.persist_client_state();
        query_state
    }

    fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<&FirestoreError>,
    ) {
        self.inner.write(
            &self.inner.keys.target(target_id),
            &QueryTargetStateRecord {
                state,
                error: error.map(ErrorRecord::from_error),
                update_time_ms: now_millis(),
            },
        );
    }

    fn remove_local_query_target(&self, target_id: TargetId) {
        self.inner.lock().local_targets.remove(&target_id);
        self.inner.persist_client_state();
    }

    fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.inner.lock().local_targets.contains(&target_id)
    }

    fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.inner.lock().all_targets().contains(&target_id)
    }

    fn clear_query_state(&self, target_id: TargetId) {
        self.inner.channel.remove(&self.inner.keys.target(target_id));
    }

    fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        self.inner.lock().all_targets()
    }

    fn handle_user_change(&self, user: &User, removed_batch_ids: &[BatchId], added_batch_ids: &[BatchId]) {
        for batch_id in removed_batch_ids {
            self.inner.remove_mutation_state(*batch_id);
        }
        self.inner.lock().user = user.clone();
        for batch_id in added_batch_ids {
            self.add_pending_mutation(*batch_id);
        }
    }

    fn set_online_state(&self, state: OnlineState) {
        self.inner.write(
            &self.inner.keys.online_state,
            &OnlineStateRecord {
                client_id: self.inner.client_id.clone(),
                online_state: state,
            },
        );
    }

    fn write_sequence_number(&self, sequence_number: ListenSequenceNumber) {
        if let Err(err) = self
            .inner
            .channel
            .set(&self.inner.keys.sequence_number, &sequence_number.to_string())
        {
            log::warn!("failed to share sequence number: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::aborted;
    use crate::multi_tab::InMemoryBroadcastHub;

    #[derive(Default)]
    struct RecordingSyncer {
        clients: Vec<ClientId>,
        batches: Mutex<Vec<(BatchId, MutationBatchState, Option<FirestoreErrorCode>)>>,
        targets: Mutex<Vec<(TargetId, QueryTargetState)>>,
        active_changes: Mutex<Vec<(Vec<TargetId>, Vec<TargetId>)>>,
    }

    #[async_trait]
    impl SharedClientStateSyncer for RecordingSyncer {
        async fn apply_batch_state(
            &self,
            batch_id: BatchId,
            state: MutationBatchState,
            error: Option<FirestoreError>,
        ) -> FirestoreResult<()> {
            self.batches
                .lock()
                .unwrap()
                .push((batch_id, state, error.map(|err| err.code)));
            Ok(())
        }

        async fn apply_target_state(
            &self,
            target_id: TargetId,
            state: QueryTargetState,
            _error: Option<FirestoreError>,
        ) -> FirestoreResult<()> {
            self.targets.lock().unwrap().push((target_id, state));
            Ok(())
        }

        async fn apply_active_target_change(
            &self,
            added: Vec<TargetId>,
            removed: Vec<TargetId>,
        ) -> FirestoreResult<()> {
            self.active_changes.lock().unwrap().push((added, removed));
            Ok(())
        }

        fn get_active_clients(&self) -> FirestoreResult<Vec<ClientId>> {
            Ok(self.clients.clone())
        }
    }

    struct Tab {
        state: BroadcastSharedClientState,
        syncer: Arc<RecordingSyncer>,
        queue: AsyncQueue,
    }

    fn tab(hub: &InMemoryBroadcastHub, client_id: &str, user: User) -> Tab {
        let queue = AsyncQueue::new();
        let syncer = Arc::new(RecordingSyncer {
            clients: vec!["a".into(), "b".into()],
            ..Default::default()
        });
        let state = BroadcastSharedClientState::new("app", client_id, hub.channel(), queue.clone(), user);
        let weak: Weak<dyn SharedClientStateSyncer> = Arc::downgrade(&syncer) as Weak<dyn SharedClientStateSyncer>;
        state.set_syncer(weak);
        state.start().unwrap();
        Tab { state, syncer, queue }
    }

    #[tokio::test]
    async fn mutation_results_reach_other_tabs_of_the_same_user() {
        let hub = InMemoryBroadcastHub::new();
        let primary = tab(&hub, "a", User::new("alice"));
        let secondary = tab(&hub, "b", User::new("alice"));
        let stranger = tab(&hub, "c", User::new("bob"));

        secondary.state.add_pending_mutation(1);
        primary
            .state
            .update_mutation_state(1, MutationBatchState::Rejected, Some(&aborted("conflict")));
        primary.queue.drain().await.unwrap();
        secondary.queue.drain().await.unwrap();
        stranger.queue.drain().await.unwrap();

        assert_eq!(
            *primary.syncer.batches.lock().unwrap(),
            vec![(1, MutationBatchState::Pending, None)]
        );
        assert_eq!(
            *secondary.syncer.batches.lock().unwrap(),
            vec![(1, MutationBatchState::Rejected, Some(FirestoreErrorCode::Aborted))]
        );
        assert!(stranger.syncer.batches.lock().unwrap().is_empty());
        assert!(hub.channel().get("firestore_mutations_app_1_alice").is_none());
    }

    #[tokio::test]
    async fn target_registrations_drive_active_target_changes() {
        let hub = InMemoryBroadcastHub::new();
        let primary = tab(&hub, "a", User::unauthenticated());
        let secondary = tab(&hub, "b", User::unauthenticated());

        assert_eq!(
            secondary.state.add_local_query_target(2),
            QueryTargetState::NotCurrent
        );
        primary.queue.drain().await.unwrap();
        assert!(primary.state.is_active_query_target(2));
        assert!(!primary.state.is_local_query_target(2));

        primary.state.update_query_state(2, QueryTargetState::Current, None);
        secondary.queue.drain().await.unwrap();
        assert_eq!(
            *secondary.syncer.targets.lock().unwrap(),
            vec![(2, QueryTargetState::Current)]
        );

        secondary.state.remove_local_query_target(2);
        primary.queue.drain().await.unwrap();
        assert_eq!(
            *primary.syncer.active_changes.lock().unwrap(),
            vec![(vec![2], vec![]), (vec![], vec![2])]
        );
        assert!(primary.state.get_all_active_query_targets().is_empty());
    }

    #[tokio::test]
    async fn online_state_and_sequence_numbers_are_relayed() {
        let hub = InMemoryBroadcastHub::new();
        let secondary_queue = AsyncQueue::new();
        let seen_states = Arc::new(Mutex::new(Vec::new()));
        let seen_sequence = Arc::new(Mutex::new(Vec::new()));

        let primary = tab(&hub, "a", User::unauthenticated());
        let secondary = BroadcastSharedClientState::new(
            "app",
            "b",
            hub.channel(),
            secondary_queue.clone(),
            User::unauthenticated(),
        );
        let syncer = Arc::new(RecordingSyncer {
            clients: vec!["a".into(), "b".into()],
            ..Default::default()
        });
        secondary.set_syncer(Arc::downgrade(&syncer) as Weak<dyn SharedClientStateSyncer>);
        let sink = Arc::clone(&seen_states);
        secondary.set_online_state_handler(Arc::new(move |state| sink.lock().unwrap().push(state)));
        let sink = Arc::clone(&seen_sequence);
        secondary.set_sequence_number_handler(Arc::new(move |value| sink.lock().unwrap().push(value)));
        secondary.start().unwrap();

        primary.state.set_online_state(OnlineState::Online);
        primary.state.write_sequence_number(42);
        secondary_queue.drain().await.unwrap();

        assert_eq!(*seen_states.lock().unwrap(), vec![OnlineState::Online]);
        assert_eq!(*seen_sequence.lock().unwrap(), vec![42]);
    }

    #[test]
    fn memory_state_tracks_local_targets() {
        let state = MemorySharedClientState::new();
        assert_eq!(state.add_local_query_target(4), QueryTargetState::NotCurrent);
        state.update_query_state(4, QueryTargetState::Current, None);
        assert_eq!(state.add_local_query_target(4), QueryTargetState::Current);
        assert!(state.is_active_query_target(4));
        state.remove_local_query_target(4);
        assert!(state.get_all_active_query_targets().is_empty());
    }
}
