//! Local cache: persistence components, the local store and garbage
//! collection.

pub mod kv;
pub mod local_documents_view;
pub mod local_store;
pub mod lru;
pub mod memory;
pub mod persistence;
pub mod query_engine;
mod reference_set;
pub mod remote_document_change_buffer;
pub mod target_data;

pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
pub use lru::{LruGarbageCollector, LruResults, LruScheduler};
pub use persistence::{Persistence, TransactionMode};
pub use query_engine::IndexFreeQueryEngine;
pub use reference_set::ReferenceSet;
pub use target_data::{TargetData, TargetPurpose};
