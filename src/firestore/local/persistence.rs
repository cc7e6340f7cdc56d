use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::lru_garbage_collector::LruDelegate;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::ListenSequenceNumber;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

/// Handle to every cache of one persistence instance, valid for the duration of a single
/// transaction.
///
/// The caches are disjoint borrows, so a transaction body can read the mutation queue while
/// writing overlays. Nothing outside the body can reach them, and the handle cannot be used
/// to open a nested transaction.
pub struct Transaction<'a> {
    /// Sequence number stamped on everything this transaction touches. Read-only
    /// transactions carry `ListenSequence::INVALID`.
    pub sequence_number: ListenSequenceNumber,
    pub remote_documents: &'a mut dyn RemoteDocumentCache,
    pub mutation_queue: &'a mut dyn MutationQueue,
    pub document_overlays: &'a mut dyn DocumentOverlayCache,
    pub target_cache: &'a mut dyn TargetCache,
    pub lru_delegate: &'a mut dyn LruDelegate,
}

/// Storage backing the local store.
///
/// Every read and write goes through [`Persistence::run_transaction`]; a body returning
/// `Err` leaves the stored state exactly as it was before the transaction started.
pub trait Persistence {
    fn run_transaction<T, F>(&mut self, action: &str, mode: TransactionMode, body: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> FirestoreResult<T>;

    /// Highest sequence number handed out so far.
    fn current_sequence_number(&self) -> ListenSequenceNumber;

    fn is_started(&self) -> bool;

    fn shutdown(&mut self);
}
