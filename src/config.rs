//! Tunables of the sync engine and the persistence mode of a client.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::local::kv::KvStore;
use crate::multi_tab::BroadcastChannel;
use crate::util::backoff::BackoffSettings;

pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub const DEFAULT_RESUME_TOKEN_MAX_AGE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_WATCH_STREAM_FAILURES: usize = 1;
pub const DEFAULT_LRU_INITIAL_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_LRU_REGULAR_DELAY: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CLIENT_METADATA_REFRESH_INTERVAL: Duration = Duration::from_secs(4);
pub const DEFAULT_MAX_PRIMARY_ELIGIBLE_AGE: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CLIENT_AGE: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_TRANSACTION_ATTEMPTS: usize = 5;

/// Parameters of the least-recently-used garbage collector.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LruParams {
    /// Collection runs only once the document cache exceeds this many bytes.
    /// `COLLECTION_DISABLED` turns collection off.
    pub cache_size_collection_threshold: i64,
    /// Share of the sequence numbers in use to collect per run, in percent.
    pub percentile_to_collect: u32,
    /// Upper bound on sequence numbers considered per run.
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub const COLLECTION_DISABLED: i64 = -1;
    pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
    pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;

    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(Self::COLLECTION_DISABLED)
    }

    pub fn is_disabled(&self) -> bool {
        self.cache_size_collection_threshold == Self::COLLECTION_DISABLED
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: Self::DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }
}

/// Every operational threshold of the engine.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncSettings {
    /// Write batches that may be in flight on the write stream.
    pub max_pending_writes: usize,
    pub max_concurrent_limbo_resolutions: usize,
    /// Snapshot-version age after which a target's resume token is persisted
    /// even without document changes.
    pub resume_token_max_age: Duration,
    pub backoff: BackoffSettings,
    /// Streams without outstanding work close after this long.
    pub idle_timeout: Duration,
    /// Time the watch stream may take to connect before the client reports
    /// itself offline.
    pub online_state_timeout: Duration,
    pub max_watch_stream_failures: usize,
    pub lru: LruParams,
    pub lru_initial_delay: Duration,
    pub lru_regular_delay: Duration,
    pub client_metadata_refresh_interval: Duration,
    /// A lease holder or client whose heartbeat is older than this is no
    /// longer eligible for the primary lease.
    pub max_primary_eligible_age: Duration,
    /// Client metadata rows older than this are garbage collected.
    pub max_client_age: Duration,
    pub max_transaction_attempts: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            resume_token_max_age: DEFAULT_RESUME_TOKEN_MAX_AGE,
            backoff: BackoffSettings::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            max_watch_stream_failures: DEFAULT_MAX_WATCH_STREAM_FAILURES,
            lru: LruParams::default(),
            lru_initial_delay: DEFAULT_LRU_INITIAL_DELAY,
            lru_regular_delay: DEFAULT_LRU_REGULAR_DELAY,
            client_metadata_refresh_interval: DEFAULT_CLIENT_METADATA_REFRESH_INTERVAL,
            max_primary_eligible_age: DEFAULT_MAX_PRIMARY_ELIGIBLE_AGE,
            max_client_age: DEFAULT_MAX_CLIENT_AGE,
            max_transaction_attempts: DEFAULT_MAX_TRANSACTION_ATTEMPTS,
        }
    }
}

/// Where a client keeps its local cache.
#[derive(Clone)]
pub enum PersistenceSettings {
    /// Process memory with eager garbage collection. Single tab.
    Memory,
    /// Shared key-value store with LRU garbage collection and primary-lease
    /// coordination between tabs.
    Durable {
        persistence_key: String,
        store: Arc<dyn KvStore>,
        broadcast: Arc<dyn BroadcastChannel>,
        synchronize_tabs: bool,
    },
}

impl Debug for PersistenceSettings {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceSettings::Memory => f.write_str("Memory"),
            PersistenceSettings::Durable {
                persistence_key,
                synchronize_tabs,
                ..
            } => f
                .debug_struct("Durable")
                .field("persistence_key", persistence_key)
                .field("synchronize_tabs", synchronize_tabs)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_thresholds() {
        let settings = SyncSettings::default();
        assert_eq!(settings.max_pending_writes, 10);
        assert_eq!(settings.max_concurrent_limbo_resolutions, 100);
        assert_eq!(settings.resume_token_max_age, Duration::from_secs(300));
        assert_eq!(settings.max_primary_eligible_age, Duration::from_secs(5));
        assert_eq!(settings.client_metadata_refresh_interval, Duration::from_secs(4));
        assert_eq!(settings.backoff.max_delay_ms, 60_000);
    }

    #[test]
    fn lru_can_be_disabled() {
        assert!(LruParams::disabled().is_disabled());
        assert!(!LruParams::default().is_disabled());
        assert_eq!(LruParams::with_cache_size(5).percentile_to_collect, 10);
    }
}
