//! Coordination between tabs that share one durable store.
//!
//! The primary lease itself lives in the store (see
//! [`KvPersistence`](crate::local::kv::KvPersistence)); this module carries
//! everything tabs exchange through the broadcast storage.

mod broadcast;
mod shared_client_state;

pub use broadcast::{
    BroadcastChannel, BroadcastSubscription, InMemoryBroadcastChannel, InMemoryBroadcastHub,
    StorageEvent, StorageListener,
};
pub use shared_client_state::{
    BroadcastSharedClientState, ClientId, MemorySharedClientState, MutationBatchState,
    OnlineStateHandler, QueryTargetState, SequenceNumberHandler, SharedClientState,
    SharedClientStateSyncer,
};
