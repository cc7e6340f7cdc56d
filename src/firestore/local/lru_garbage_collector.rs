use std::collections::HashSet;

use im::OrdMap;

use crate::firestore::local::persistence::Transaction;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::ListenSequence;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, TargetId};

/// Tracks when documents stopped being referenced by any target so the collector can
/// order them against target sequence numbers.
pub trait LruDelegate {
    /// Records that `key` lost (or changed) a reference at `sequence_number`.
    fn record_document_use(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber);

    fn orphaned_sequence_number(&self, key: &DocumentKey) -> Option<ListenSequenceNumber>;

    fn orphaned_sequence_numbers(&self) -> Vec<ListenSequenceNumber>;

    fn forget_document(&mut self, key: &DocumentKey);
}

#[derive(Clone, Debug, Default)]
pub struct MemoryLruDelegate {
    orphaned: OrdMap<DocumentKey, ListenSequenceNumber>,
}

impl MemoryLruDelegate {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LruDelegate for MemoryLruDelegate {
    fn record_document_use(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        self.orphaned.insert(key.clone(), sequence_number);
    }

    fn orphaned_sequence_number(&self, key: &DocumentKey) -> Option<ListenSequenceNumber> {
        self.orphaned.get(key).copied()
    }

    fn orphaned_sequence_numbers(&self) -> Vec<ListenSequenceNumber> {
        self.orphaned.values().copied().collect()
    }

    fn forget_document(&mut self, key: &DocumentKey) {
        self.orphaned.remove(key);
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LruParams {
    /// Cache size in bytes below which collection is skipped; `COLLECTION_DISABLED` turns
    /// collection off entirely.
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    /// Upper bound on sequence numbers considered in one run.
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub const COLLECTION_DISABLED: i64 = -1;
    pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;

    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(Self::COLLECTION_DISABLED)
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: Self::DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: 10,
            maximum_sequence_numbers_to_collect: 1000,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

/// Least-recently-used collection over targets and orphaned documents.
#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Runs one collection pass unless disabled or the cache is still small.
    ///
    /// `pins` holds documents referenced in memory (visible in views or written by pending
    /// batches); those are never removed.
    pub fn collect(
        &self,
        txn: &mut Transaction<'_>,
        active_target_ids: &HashSet<TargetId>,
        pins: &ReferenceSet,
    ) -> LruResults {
        if self.params.cache_size_collection_threshold == LruParams::COLLECTION_DISABLED {
            log::debug!("LRU garbage collection is disabled, skipping");
            return LruResults::default();
        }
        let cache_size = txn.remote_documents.byte_size() as i64;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "Cache size {cache_size} is below threshold {}, skipping LRU collection",
                self.params.cache_size_collection_threshold
            );
            return LruResults::default();
        }
        self.run_garbage_collection(txn, active_target_ids, pins)
    }

    fn run_garbage_collection(
        &self,
        txn: &mut Transaction<'_>,
        active_target_ids: &HashSet<TargetId>,
        pins: &ReferenceSet,
    ) -> LruResults {
        let mut to_collect = self.sequence_numbers_to_collect(txn);
        if to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "Capping sequence numbers to collect at {} (would have collected {to_collect})",
                self.params.maximum_sequence_numbers_to_collect
            );
            to_collect = self.params.maximum_sequence_numbers_to_collect;
        }
        let upper_bound = nth_sequence_number(txn, to_collect);
        let targets_removed = txn.target_cache.remove_targets(upper_bound, active_target_ids);
        let documents_removed = remove_orphaned_documents(txn, upper_bound, pins);
        log::debug!(
            "LRU garbage collection: {to_collect} sequence numbers, upper bound {upper_bound}, \
             removed {targets_removed} targets and {documents_removed} documents"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        }
    }

    fn sequence_numbers_to_collect(&self, txn: &Transaction<'_>) -> usize {
        let count = txn.target_cache.target_count() + txn.lru_delegate.orphaned_sequence_numbers().len();
        (self.params.percentile_to_collect as usize * count) / 100
    }
}

/// The `n`th smallest sequence number across targets and orphaned documents, or
/// `ListenSequence::INVALID` when `n` is zero.
pub fn nth_sequence_number(txn: &Transaction<'_>, n: usize) -> ListenSequenceNumber {
    if n == 0 {
        return ListenSequence::INVALID;
    }
    let mut sequence_numbers: Vec<ListenSequenceNumber> = txn
        .target_cache
        .targets()
        .iter()
        .map(|target_data| target_data.sequence_number)
        .chain(txn.lru_delegate.orphaned_sequence_numbers())
        .collect();
    sequence_numbers.sort_unstable();
    sequence_numbers
        .get(n - 1)
        .or_else(|| sequence_numbers.last())
        .copied()
        .unwrap_or(ListenSequence::INVALID)
}

fn is_pinned(
    txn: &Transaction<'_>,
    key: &DocumentKey,
    upper_bound: ListenSequenceNumber,
    pins: &ReferenceSet,
) -> bool {
    txn.mutation_queue.contains_key(key)
        || pins.contains_key(key)
        || txn.target_cache.contains_key(key)
        || txn
            .lru_delegate
            .orphaned_sequence_number(key)
            .is_some_and(|orphaned_at| orphaned_at > upper_bound)
}

fn remove_orphaned_documents(
    txn: &mut Transaction<'_>,
    upper_bound: ListenSequenceNumber,
    pins: &ReferenceSet,
) -> usize {
    let doomed: Vec<DocumentKey> = txn
        .remote_documents
        .document_keys()
        .into_iter()
        .filter(|key| !is_pinned(txn, key, upper_bound, pins))
        .collect();
    for key in &doomed {
        txn.remote_documents.remove_entry(key);
        txn.lru_delegate.forget_document(key);
    }
    doomed.len()
}
