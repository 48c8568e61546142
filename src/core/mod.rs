//! Query views, the sync engine and the client facade built on top of the
//! local and remote stores.

pub mod event_manager;
pub mod firestore_client;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod transaction;
pub mod transaction_runner;
pub mod types;
pub mod view;
pub mod view_snapshot;

pub use event_manager::{EventManager, ListenOptions, QueryListener, ViewSnapshotObserver};
pub use firestore_client::FirestoreClient;
pub use query::{Bound, Direction, FieldFilter, LimitType, Operator, OrderBy, Query};
pub use sync_engine::SyncEngine;
pub use target::Target;
pub use transaction::Transaction;
pub use types::{OnlineState, OnlineStateSource};
pub use view_snapshot::ViewSnapshot;
