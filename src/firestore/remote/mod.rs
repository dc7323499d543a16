pub mod connection;
pub mod datastore;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use connection::{
    BackendStream, Connection, InMemoryConnection, ListenRequest, StreamChannel, WriteRequest,
    WriteResponse,
};
pub use datastore::{Datastore, RemoteDatastore};
pub use online_state_tracker::OnlineStateTracker;
pub use persistent_stream::{StreamListener, WatchStream, WriteStream};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState,
    WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
