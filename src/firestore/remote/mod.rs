pub mod bloom_filter;
pub mod connection;
pub mod credentials;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::{BloomFilter, BloomFilterError};
pub use connection::{
    Connection, InMemoryConnection, ListenRequest, StreamCallbacks, StreamHandle, WriteRequest, WriteResponse,
};
pub use credentials::{
    CredentialChangeListener, CredentialsProvider, EmptyCredentialsProvider, StaticCredentialsProvider, Token,
};
pub use online_state_tracker::OnlineStateTracker;
pub use persistent_stream::{PersistentStream, PersistentStreamListener, StreamState, WatchStream, WriteStream};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{RemoteStore, MAX_PENDING_WRITES};
pub use remote_syncer::RemoteSyncer;
pub use watch_change::{
    BloomFilterParams, DocumentWatchChange, ExistenceFilterChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
