pub mod document_overlay_cache;
pub mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod memory_persistence;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use document_overlay_cache::{DocumentOverlayCache, MemoryDocumentOverlayCache, Overlay};
#[doc(inline)]
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult};
#[doc(inline)]
pub use lru_garbage_collector::{LruDelegate, LruGarbageCollector, LruParams, LruResults, MemoryLruDelegate};
#[doc(inline)]
pub use memory_persistence::{FaultInjector, MemoryPersistence};
#[doc(inline)]
pub use mutation_queue::{MemoryMutationQueue, MutationQueue};
#[doc(inline)]
pub use persistence::{Persistence, Transaction, TransactionMode};
#[doc(inline)]
pub use query_engine::{QueryEngine, QueryEngineSettings, ScanStrategy};
#[doc(inline)]
pub use reference_set::{ReferenceHolder, ReferenceSet};
#[doc(inline)]
pub use remote_document_cache::{MemoryRemoteDocumentCache, QueryContext, RemoteDocumentCache};
#[doc(inline)]
pub use target_cache::{MemoryTargetCache, TargetCache};
#[doc(inline)]
pub use target_data::{ListenSequence, TargetData, TargetIdGenerator, TargetPurpose};
