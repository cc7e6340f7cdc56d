use std::sync::{Arc, Mutex};

use crate::firestore::error::{persistence_fault, FirestoreResult};
use crate::firestore::local::document_overlay_cache::MemoryDocumentOverlayCache;
use crate::firestore::local::lru_garbage_collector::MemoryLruDelegate;
use crate::firestore::local::mutation_queue::MemoryMutationQueue;
use crate::firestore::local::persistence::{Persistence, Transaction, TransactionMode};
use crate::firestore::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::firestore::local::target_cache::MemoryTargetCache;
use crate::firestore::local::target_data::ListenSequence;
use crate::firestore::model::ListenSequenceNumber;

#[derive(Clone, Debug, Default)]
struct MemoryState {
    remote_documents: MemoryRemoteDocumentCache,
    mutation_queue: MemoryMutationQueue,
    document_overlays: MemoryDocumentOverlayCache,
    target_cache: MemoryTargetCache,
    lru_delegate: MemoryLruDelegate,
}

/// Makes the next read-write transaction fail with a persistence fault.
///
/// Clones share the same trigger, so a handle kept outside the client can break a
/// persistence instance that has been moved into it.
#[derive(Clone, Debug, Default)]
pub struct FaultInjector {
    pending: Arc<Mutex<Option<String>>>,
}

impl FaultInjector {
    pub fn fail_next(&self, message: impl Into<String>) {
        let mut pending = self.pending.lock().unwrap_or_else(|poison| poison.into_inner());
        *pending = Some(message.into());
    }

    fn take(&self) -> Option<String> {
        self.pending
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
    }
}

/// In-memory persistence with all-or-nothing transactions.
///
/// All caches live in persistent maps, so taking a snapshot before a transaction is a
/// handful of reference-count bumps; on failure the snapshot replaces the live state.
#[derive(Debug)]
pub struct MemoryPersistence {
    state: MemoryState,
    listen_sequence: ListenSequence,
    faults: FaultInjector,
    started: bool,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            state: MemoryState::default(),
            listen_sequence: ListenSequence::new(0),
            faults: FaultInjector::default(),
            started: true,
        }
    }

    pub fn fault_injector(&self) -> FaultInjector {
        self.faults.clone()
    }
}

impl Persistence for MemoryPersistence {
    fn run_transaction<T, F>(&mut self, action: &str, mode: TransactionMode, body: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> FirestoreResult<T>,
    {
        if !self.started {
            return Err(persistence_fault(format!(
                "Cannot run '{action}': persistence has been shut down"
            )));
        }
        if mode == TransactionMode::ReadWrite {
            if let Some(message) = self.faults.take() {
                log::error!("Transaction '{action}' failed: {message}");
                return Err(persistence_fault(message));
            }
        }

        let snapshot = self.state.clone();
        let previous_sequence = self.listen_sequence.clone();
        let sequence_number = match mode {
            TransactionMode::ReadWrite => self.listen_sequence.next(),
            TransactionMode::ReadOnly => ListenSequence::INVALID,
        };
        let MemoryState {
            remote_documents,
            mutation_queue,
            document_overlays,
            target_cache,
            lru_delegate,
        } = &mut self.state;
        let mut txn = Transaction {
            sequence_number,
            remote_documents,
            mutation_queue,
            document_overlays,
            target_cache,
            lru_delegate,
        };

        let result = body(&mut txn);
        if let Err(err) = &result {
            log::debug!("Rolling back transaction '{action}': {err}");
            self.state = snapshot;
            self.listen_sequence = previous_sequence;
        }
        result
    }

    fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.listen_sequence.current()
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn shutdown(&mut self) {
        self.started = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{internal_error, FirestoreErrorCode};
    use crate::firestore::model::{Document, DocumentKey, Mutation, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn failed_transactions_roll_back() {
        let mut persistence = MemoryPersistence::new();
        let result: FirestoreResult<()> =
            persistence.run_transaction("write", TransactionMode::ReadWrite, |txn| {
                let version = SnapshotVersion::new(Timestamp::new(1, 0));
                txn.remote_documents
                    .add_entry(Document::new_found(key("rooms/a"), version, MapValue::empty()), version)?;
                txn.mutation_queue.add_mutation_batch(
                    Timestamp::now(),
                    vec![],
                    vec![Mutation::delete(key("rooms/a"))],
                )?;
                Err(internal_error("boom"))
            });
        assert!(result.is_err());
        assert_eq!(persistence.current_sequence_number(), 0);

        persistence
            .run_transaction("check", TransactionMode::ReadOnly, |txn| {
                assert!(!txn.remote_documents.get_entry(&key("rooms/a")).is_valid_document());
                assert!(txn.mutation_queue.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn read_write_transactions_allocate_sequence_numbers() {
        let mut persistence = MemoryPersistence::new();
        let first = persistence
            .run_transaction("a", TransactionMode::ReadWrite, |txn| Ok(txn.sequence_number))
            .unwrap();
        let read = persistence
            .run_transaction("b", TransactionMode::ReadOnly, |txn| Ok(txn.sequence_number))
            .unwrap();
        let second = persistence
            .run_transaction("c", TransactionMode::ReadWrite, |txn| Ok(txn.sequence_number))
            .unwrap();
        assert_eq!(read, ListenSequence::INVALID);
        assert!(second > first);
    }

    #[test]
    fn injected_fault_is_fatal_and_one_shot() {
        let mut persistence = MemoryPersistence::new();
        persistence.fault_injector().fail_next("disk full");
        let err = persistence
            .run_transaction("a", TransactionMode::ReadWrite, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        assert!(err.is_fatal());
        assert!(persistence
            .run_transaction("b", TransactionMode::ReadWrite, |_| Ok(()))
            .is_ok());
    }
}
