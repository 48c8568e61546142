//! Fans out view snapshots from the sync engine to the user's query
//! listeners.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::query::Query;
use crate::core::sync_engine::SyncEngine;
use crate::core::types::OnlineState;
use crate::core::view_snapshot::ViewSnapshot;
use crate::error::{FirestoreError, FirestoreResult};
use crate::model::ChangeType;

/// Receives snapshots and errors for one listener.
pub type ViewSnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

/// Called whenever all listeners raised events for a consistent state.
pub type SnapshotsInSyncCallback = Arc<dyn Fn() + Send + Sync>;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// What the [`SyncEngine`] reports to the layer holding user listeners.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The query failed and was removed.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots that only change pending-write or from-cache state.
    pub include_metadata_changes: bool,
    /// Hold back cached results while the client may still be online.
    pub wait_for_sync_when_online: bool,
}

#[derive(Default)]
struct QueryListenerState {
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

/// One user listener on a query. Decides which view snapshots are raised.
pub struct QueryListener {
    id: u64,
    query: Query,
    options: ListenOptions,
    observer: ViewSnapshotObserver,
    state: Mutex<QueryListenerState>,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: ViewSnapshotObserver) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            query,
            options,
            observer,
            state: Mutex::new(QueryListenerState::default()),
        })
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    fn lock(&self) -> MutexGuard<'_, QueryListenerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns whether an event was raised.
    pub fn on_view_snapshot(&self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            ViewSnapshot {
                doc_changes: snapshot
                    .doc_changes
                    .into_iter()
                    .filter(|change| change.change_type != ChangeType::Metadata)
                    .collect(),
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        let event = {
            let mut state = self.lock();
            let event = if !state.raised_initial_event {
                if self.should_raise_initial_event(&snapshot, state.online_state) {
                    state.raised_initial_event = true;
                    Some(initial_event(&snapshot))
                } else {
                    None
                }
            } else if self.should_raise_event(&snapshot, state.snapshot.as_ref()) {
                Some(snapshot.clone())
            } else {
                None
            };
            state.snapshot = Some(snapshot);
            event
        };

        match event {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    /// Returns whether a held back initial event was raised.
    pub fn apply_online_state_change(&self, online_state: OnlineState) -> bool {
        let event = {
            let mut state = self.lock();
            state.online_state = online_state;
            match &state.snapshot {
                Some(snapshot)
                    if !state.raised_initial_event
                        && self.should_raise_initial_event(snapshot, online_state) =>
                {
                    let event = initial_event(snapshot);
                    state.raised_initial_event = true;
                    Some(event)
                }
                _ => None,
            }
        };
        match event {
            Some(event) => {
                (self.observer)(Ok(event));
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is only shown once the client knows it is
        // offline.
        !snapshot.docs.is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot, previous: Option<&ViewSnapshot>) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = previous
            .map_or(false, |previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }
}

fn initial_event(snapshot: &ViewSnapshot) -> ViewSnapshot {
    ViewSnapshot::from_initial_documents(
        snapshot.query.clone(),
        snapshot.docs.clone(),
        snapshot.mutated_keys.clone(),
        snapshot.from_cache,
    )
}

struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<Arc<QueryListener>>,
}

#[derive(Default)]
struct EventManagerState {
    /// Keyed by canonical query id.
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
    snapshots_in_sync_listeners: Vec<(u64, SnapshotsInSyncCallback)>,
}

/// Multiplexes any number of listeners per query onto a single listen in
/// the [`SyncEngine`].
pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: Mutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine: Arc::clone(&sync_engine),
            state: Mutex::new(EventManagerState::default()),
        });
        let listener: Arc<dyn SyncEngineListener> = manager.clone();
        sync_engine.subscribe(Arc::downgrade(&listener));
        manager
    }

    fn lock(&self) -> MutexGuard<'_, EventManagerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds `listener`, starting a listen in the sync engine for the first
    /// listener of its query. Initialization failures go to the listener.
    pub async fn listen(&self, listener: Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query.canonical_id();
        let first_listen = !self.lock().queries.contains_key(&canonical_id);

        let mut initial_snapshot = None;
        if first_listen {
            match self.sync_engine.listen(listener.query.clone()).await {
                Ok(snapshot) => initial_snapshot = Some(snapshot),
                Err(err) => {
                    if err.is_storage_failure() {
                        log::warn!("initialization of query {canonical_id} failed: {err}");
                    }
                    listener.on_error(err);
                    return Ok(());
                }
            }
        }

        let (online_state, view_snapshot) = {
            let mut state = self.lock();
            let online_state = state.online_state;
            let info = state
                .queries
                .entry(canonical_id)
                .or_insert_with(|| QueryListenersInfo {
                    view_snapshot: None,
                    listeners: Vec::new(),
                });
            if initial_snapshot.is_some() {
                info.view_snapshot = initial_snapshot;
            }
            info.listeners.push(Arc::clone(&listener));
            (online_state, info.view_snapshot.clone())
        };

        listener.apply_online_state_change(online_state);
        if let Some(snapshot) = view_snapshot {
            if listener.on_view_snapshot(snapshot) {
                self.raise_snapshots_in_sync_event();
            }
        }
        Ok(())
    }

    /// Removes `listener`, stopping the sync engine listen when it was the
    /// last one on its query.
    pub async fn unlisten(&self, listener: &Arc<QueryListener>) -> FirestoreResult<()> {
        let canonical_id = listener.query.canonical_id();
        let last_listen = {
            let mut state = self.lock();
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            let before = info.listeners.len();
            info.listeners.retain(|entry| entry.id != listener.id);
            let last_listen = before != info.listeners.len() && info.listeners.is_empty();
            if last_listen {
                state.queries.remove(&canonical_id);
            }
            last_listen
        };
        if last_listen {
            self.sync_engine.unlisten(listener.query.clone()).await?;
        }
        Ok(())
    }

    pub fn add_snapshots_in_sync_listener(&self, callback: SnapshotsInSyncCallback) -> u64 {
        let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
        self.lock().snapshots_in_sync_listeners.push((id, Arc::clone(&callback)));
        // A new listener is in sync with whatever has been raised so far.
        callback();
        id
    }

    pub fn remove_snapshots_in_sync_listener(&self, id: u64) {
        self.lock()
            .snapshots_in_sync_listeners
            .retain(|(listener_id, _)| *listener_id != id);
    }

    fn raise_snapshots_in_sync_event(&self) {
        let callbacks: Vec<SnapshotsInSyncCallback> = self
            .lock()
            .snapshots_in_sync_listeners
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    fn listeners_for(&self, canonical_id: &str) -> Vec<Arc<QueryListener>> {
        self.lock()
            .queries
            .get(canonical_id)
            .map(|info| info.listeners.clone())
            .unwrap_or_default()
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let mut raised_event = false;
        for snapshot in snapshots {
            let canonical_id = snapshot.query.canonical_id();
            let listeners = {
                let mut state = self.lock();
                let Some(info) = state.queries.get_mut(&canonical_id) else {
                    continue;
                };
                info.view_snapshot = Some(snapshot.clone());
                info.listeners.clone()
            };
            for listener in listeners {
                if listener.on_view_snapshot(snapshot.clone()) {
                    raised_event = true;
                }
            }
        }
        if raised_event {
            self.raise_snapshots_in_sync_event();
        }
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let canonical_id = query.canonical_id();
        let listeners = self.listeners_for(&canonical_id);
        self.lock().queries.remove(&canonical_id);
        for listener in listeners {
            listener.on_error(error.clone());
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let listeners: Vec<Arc<QueryListener>> = {
            let mut state = self.lock();
            state.online_state = online_state;
            state
                .queries
                .values()
                .flat_map(|info| info.listeners.iter().cloned())
                .collect()
        };
        let mut raised_event = false;
        for listener in listeners {
            if listener.apply_online_state_change(online_state) {
                raised_event = true;
            }
        }
        if raised_event {
            self.raise_snapshots_in_sync_event();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        document_key_set, Document, DocumentKey, DocumentSet, DocumentViewChange, ObjectValue,
        ResourcePath, SnapshotVersion,
    };

    type Events = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

    fn recorder() -> (ViewSnapshotObserver, Events) {
        let events: Events = Arc::default();
        let sink = Arc::clone(&events);
        let observer: ViewSnapshotObserver = Arc::new(move |event| sink.lock().unwrap().push(event));
        (observer, events)
    }

    fn query() -> Query {
        Query::new(ResourcePath::from_string("c").unwrap())
    }

    fn doc(path: &str) -> Document {
        Document::synced(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            ObjectValue::empty(),
        )
    }

    fn snapshot(docs: &[&str], from_cache: bool) -> ViewSnapshot {
        let set = docs
            .iter()
            .fold(DocumentSet::new(query().doc_comparator()), |set, path| set.add(doc(path)));
        let mut snapshot =
            ViewSnapshot::from_initial_documents(query(), set, document_key_set(), from_cache);
        snapshot.sync_state_changed = false;
        snapshot
    }

    #[test]
    fn empty_cached_results_wait_until_offline() {
        let (observer, events) = recorder();
        let listener = QueryListener::new(query(), ListenOptions::default(), observer);

        assert!(!listener.on_view_snapshot(snapshot(&[], true)));
        assert!(!listener.apply_online_state_change(OnlineState::Online));
        assert!(listener.apply_online_state_change(OnlineState::Offline));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].as_ref().unwrap().from_cache);
    }

    #[test]
    fn waiting_for_sync_holds_back_cached_results_while_unknown() {
        let (observer, events) = recorder();
        let options = ListenOptions {
            wait_for_sync_when_online: true,
            ..ListenOptions::default()
        };
        let listener = QueryListener::new(query(), options, observer);

        assert!(!listener.on_view_snapshot(snapshot(&["c/a"], true)));
        assert!(listener.on_view_snapshot(snapshot(&["c/a"], false)));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let event = events[0].as_ref().unwrap();
        assert!(!event.from_cache);
        assert_eq!(event.doc_changes.len(), 1);
    }

    #[test]
    fn metadata_only_changes_need_opt_in() {
        let (observer, events) = recorder();
        let listener = QueryListener::new(query(), ListenOptions::default(), observer);
        assert!(listener.on_view_snapshot(snapshot(&["c/a"], false)));

        let mut metadata = snapshot(&["c/a"], false);
        metadata.doc_changes = vec![DocumentViewChange::new(ChangeType::Metadata, doc("c/a"))];
        metadata.sync_state_changed = true;
        assert!(!listener.on_view_snapshot(metadata.clone()));
        assert_eq!(events.lock().unwrap().len(), 1);

        let (observer, events) = recorder();
        let options = ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        };
        let listener = QueryListener::new(query(), options, observer);
        assert!(listener.on_view_snapshot(snapshot(&["c/a"], false)));
        assert!(listener.on_view_snapshot(metadata));
        assert_eq!(events.lock().unwrap().len(), 2);
    }

    #[test]
    fn errors_reach_the_observer() {
        let (observer, events) = recorder();
        let listener = QueryListener::new(query(), ListenOptions::default(), observer);
        listener.on_error(crate::error::permission_denied("denied"));
        assert!(events.lock().unwrap()[0].is_err());
    }
}
