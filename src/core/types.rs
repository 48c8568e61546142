use serde::{Deserialize, Serialize};

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OnlineState {
    /// Nothing is known yet. Listeners waiting for sync hold back cached
    /// results in this state.
    Unknown,
    Online,
    Offline,
}

impl Default for OnlineState {
    fn default() -> Self {
        OnlineState::Unknown
    }
}

/// Where an online state change originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStateSource {
    /// The local RemoteStore.
    RemoteStore,
    /// The primary tab, relayed through the shared client state.
    SharedClientState,
}
