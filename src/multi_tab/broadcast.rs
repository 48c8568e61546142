use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::FirestoreResult;

/// A change made by another tab to the shared broadcast storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

pub type StorageListener = Arc<dyn Fn(&StorageEvent) + Send + Sync>;

/// Removes its listener when dropped.
pub struct BroadcastSubscription {
    cleanup: Option<Box<dyn FnOnce() + Send + 'static>>,
}

impl BroadcastSubscription {
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    pub fn noop() -> Self {
        Self { cleanup: None }
    }
}

impl Default for BroadcastSubscription {
    fn default() -> Self {
        Self::noop()
    }
}

impl Drop for BroadcastSubscription {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Synchronous key-value storage shared by the tabs of one client, which
/// notifies every other tab of each change.
///
/// Writes are visible to `get` immediately. A tab never receives events for
/// its own writes.
pub trait BroadcastChannel: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> FirestoreResult<()>;

    fn remove(&self, key: &str);

    /// Every entry, in key order.
    fn entries(&self) -> Vec<(String, String)>;

    fn subscribe(&self, listener: StorageListener) -> FirestoreResult<BroadcastSubscription>;
}

#[derive(Default)]
struct HubState {
    entries: BTreeMap<String, String>,
    listeners: Vec<(usize, usize, StorageListener)>,
}

/// Process-wide broadcast storage. Each tab gets its own channel from
/// [`InMemoryBroadcastHub::channel`].
#[derive(Clone, Default)]
pub struct InMemoryBroadcastHub {
    state: Arc<Mutex<HubState>>,
    next_id: Arc<AtomicUsize>,
}

impl InMemoryBroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self) -> Arc<InMemoryBroadcastChannel> {
        Arc::new(InMemoryBroadcastChannel {
            hub: self.clone(),
            channel_id: self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, origin: usize, event: StorageEvent) {
        let listeners: Vec<StorageListener> = self
            .lock()
            .listeners
            .iter()
            .filter(|(channel_id, _, _)| *channel_id != origin)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&event);
        }
    }
}

/// One tab's view of an [`InMemoryBroadcastHub`].
pub struct InMemoryBroadcastChannel {
    hub: InMemoryBroadcastHub,
    channel_id: usize,
}

impl BroadcastChannel for InMemoryBroadcastChannel {
    fn get(&self, key: &str) -> Option<String> {
        self.hub.lock().entries.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> FirestoreResult<()> {
        let old_value = self
            .hub
            .lock()
            .entries
            .insert(key.to_string(), value.to_string());
        if old_value.as_deref() != Some(value) {
            self.hub.publish(
                self.channel_id,
                StorageEvent {
                    key: key.to_string(),
                    old_value,
                    new_value: Some(value.to_string()),
                },
            );
        }
        Ok(())
    }

    fn remove(&self, key: &str) {
        let old_value = self.hub.lock().entries.remove(key);
        if old_value.is_some() {
            self.hub.publish(
                self.channel_id,
                StorageEvent {
                    key: key.to_string(),
                    old_value,
                    new_value: None,
                },
            );
        }
    }

    fn entries(&self) -> Vec<(String, String)> {
        self.hub
            .lock()
            .entries
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn subscribe(&self, listener: StorageListener) -> FirestoreResult<BroadcastSubscription> {
        let listener_id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);
        self.hub
            .lock()
            .listeners
            .push((self.channel_id, listener_id, listener));
        let state = Arc::downgrade(&self.hub.state);
        Ok(BroadcastSubscription::new(move || {
            if let Some(state) = state.upgrade() {
                if let Ok(mut guard) = state.lock() {
                    guard.listeners.retain(|(_, id, _)| *id != listener_id);
                }
            }
        }))
    }
}
