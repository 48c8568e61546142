pub mod connection;
pub mod credentials;
pub mod datastore;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod stream;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use connection::{Connection, InMemoryConnection, ServerStream, StreamHandle};
pub use credentials::{NoopTokenProvider, TokenProvider, User};
pub use datastore::Datastore;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::JsonProtoSerializer;
pub use watch_change::WatchChange;
pub use watch_change_aggregator::WatchChangeAggregator;
