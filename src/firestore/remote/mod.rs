pub mod backoff;
pub mod bloom_filter;
pub mod datastore;
pub mod effects;
pub mod messages;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod serializer;
pub mod stream;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use backoff::{ExponentialBackoff, RetrySettings};
pub use bloom_filter::BloomFilter;
pub use datastore::{
    NoopTokenProvider, StreamHandle, StreamingDatastore, StreamingDatastoreImpl, StreamingFuture,
    TokenProvider, TokenProviderArc,
};
pub use effects::{RemoteEffect, StreamKind, TimerId};
pub use messages::{ListenRequest, WriteRequest, WriteResponse};
pub use online_state_tracker::{OnlineState, OnlineStateTracker};
pub use persistent_stream::{PersistentStream, StreamState};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::JsonProtoSerializer;
pub use stream::{
    InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamHeader, StreamTransport,
};
pub use watch_change::{
    decode_watch_change, BloomFilterSpec, DocumentWatchChange, ExistenceFilter,
    ExistenceFilterChange, TargetChangeState, WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
