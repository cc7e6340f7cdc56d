pub mod client;
pub mod event_manager;
pub mod filter;
pub mod query;
pub mod settings;
pub mod sync_engine;
pub mod target;
pub mod view;

#[doc(inline)]
pub use client::{FirestoreClient, ListenerRegistration, Source};
#[doc(inline)]
pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryListener, SnapshotObserver};
#[doc(inline)]
pub use filter::{FieldFilter, Operator};
#[doc(inline)]
pub use query::{Bound, Direction, DocumentComparator, LimitType, OrderBy, Query};
#[doc(inline)]
pub use settings::SyncSettings;
#[doc(inline)]
pub use sync_engine::{RemoteRequest, SyncEngine, SyncEvent, WriteReceiver};
#[doc(inline)]
pub use target::Target;
#[doc(inline)]
pub use view::{
    ChangeType, DocumentChangeSet, DocumentSet, DocumentViewChange, LimboDocumentChange, SyncState, View,
    ViewChange, ViewDocumentChanges, ViewSnapshot,
};

pub use crate::firestore::remote::{OnlineState, TimerId};
