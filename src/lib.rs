//! Client-side synchronization engine for a document database.
//!
//! Keeps a local cache of documents consistent with the backend: local
//! writes are applied optimistically and sent over a write stream, query
//! results arrive over a watch stream, and every active query is backed by a
//! view that raises snapshots as either side changes. Several tabs can share
//! one durable cache, with the primary tab owning the network.
//!
//! The layers, bottom up:
//! - [`collections`] and [`model`]: persistent ordered maps, documents and
//!   mutations.
//! - [`local`]: persistence (in memory or on a [`local::kv::KvStore`]), the
//!   [`local::LocalStore`] and LRU garbage collection.
//! - [`remote`]: connection, streams and the [`remote::RemoteStore`].
//! - [`multi_tab`]: state shared between tabs.
//! - [`core`]: views, the [`core::SyncEngine`] and the
//!   [`core::FirestoreClient`] facade.

pub mod collections;
pub mod config;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod multi_tab;
pub mod platform;
pub mod remote;
pub mod util;
pub mod value;
