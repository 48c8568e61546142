//! Durable persistence expressed over an ordered, transactional key-value
//! store.
//!
//! The store is an external collaborator: anything that offers snapshot
//! transactions with ordered range scans can back a [`KvPersistence`].
//! [`MemoryKvStore`] is the in-process implementation used by tests and by
//! tabs sharing one process.

mod index_manager;
pub mod key_builder;
mod local_serializer;
mod lru_delegate;
mod mutation_queue;
mod persistence;
mod remote_document_cache;
pub mod schema;
mod store;
mod target_cache;

pub use index_manager::KvIndexManager;
pub use local_serializer::LocalSerializer;
pub use lru_delegate::KvLruDelegate;
pub use mutation_queue::KvMutationQueue;
pub use persistence::{KvPersistence, KvPersistenceOptions};
pub use remote_document_cache::KvRemoteDocumentCache;
pub use store::MemoryKvStore;
pub use target_cache::KvTargetCache;

use crate::error::FirestoreResult;

/// What a range scan does after visiting an entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IterControl {
    Continue,
    Stop,
    /// Resume the scan at the first key `>=` the given key.
    SkipTo(Vec<u8>),
}

/// Visitor invoked for each entry of a range scan.
pub type ScanVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> FirestoreResult<IterControl> + 'a;

/// A physical store shared by every tab of a client.
pub trait KvStore: Send + Sync {
    fn begin(&self, read_only: bool) -> FirestoreResult<Box<dyn KvTransaction>>;
}

/// One transaction of a [`KvStore`]. Reads observe the transaction's own
/// writes. Nothing is visible to other transactions before `commit`.
pub trait KvTransaction: Send {
    fn get(&self, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> FirestoreResult<()>;

    fn delete(&self, key: &[u8]) -> FirestoreResult<()>;

    /// Visits entries in `[start, end)` in ascending key order. The visitor
    /// may write to the transaction; the scan observes the state at its
    /// start.
    fn scan(&self, start: &[u8], end: &[u8], visitor: &mut ScanVisitor<'_>) -> FirestoreResult<()>;

    /// Visits entries in `[start, end)` in descending key order.
    fn scan_reverse(
        &self,
        start: &[u8],
        end: &[u8],
        visitor: &mut ScanVisitor<'_>,
    ) -> FirestoreResult<()>;

    fn commit(self: Box<Self>) -> FirestoreResult<()>;

    fn abort(self: Box<Self>);
}
