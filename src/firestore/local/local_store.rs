use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::firestore::core::{Query, Target};
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::document_overlay_cache::Overlay;
use crate::firestore::local::local_documents_view;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
use crate::firestore::local::persistence::{Persistence, Transaction, TransactionMode};
use crate::firestore::local::query_engine::{QueryEngine, QueryEngineSettings, ScanStrategy};
use crate::firestore::local::reference_set::{ReferenceHolder, ReferenceSet};
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, FieldMask, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, TargetId, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};
use crate::firestore::value::BytesValue;

/// Resume tokens older than this are persisted even without document changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every written document after the write.
    pub changes: BTreeMap<DocumentKey, Document>,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    /// Keys the backend last reported for the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
    pub strategy: ScanStrategy,
}

/// Keys that entered or left a view, reported back so their documents stay pinned.
#[derive(Clone, Debug)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Local view of the world: cached server state plus every pending write.
///
/// All reads and writes run inside persistence transactions; a failed transaction leaves
/// both the persisted state and the in-memory target bookkeeping untouched.
pub struct LocalStore<P: Persistence> {
    persistence: P,
    query_engine: QueryEngine,
    garbage_collector: LruGarbageCollector,
    /// Active targets by id. Holds newer resume tokens than the target cache when an update
    /// was not worth persisting.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_ids_by_target: HashMap<Target, TargetId>,
    /// Documents visible in views (by target) or written by pending batches.
    local_view_references: ReferenceSet,
}

impl<P: Persistence> LocalStore<P> {
    pub fn new(persistence: P, query_settings: QueryEngineSettings, lru_params: LruParams) -> Self {
        Self {
            persistence,
            query_engine: QueryEngine::new(query_settings),
            garbage_collector: LruGarbageCollector::new(lru_params),
            target_data_by_target: BTreeMap::new(),
            target_ids_by_target: HashMap::new(),
            local_view_references: ReferenceSet::new(),
        }
    }

    /// Restores pins for batches that survived in persistence.
    pub fn start(&mut self) -> FirestoreResult<()> {
        let batches = self.persistence.run_transaction(
            "Start local store",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.mutation_queue.get_all_mutation_batches()),
        )?;
        for batch in batches {
            self.local_view_references
                .add_references(batch.keys(), ReferenceHolder::Batch(batch.batch_id));
        }
        Ok(())
    }

    pub fn persistence(&self) -> &P {
        &self.persistence
    }

    pub fn shutdown(&mut self) {
        self.persistence.shutdown();
    }

    /// Appends `mutations` as a new batch and updates the affected overlays.
    pub fn local_write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();

        let (batch, changes) =
            self.persistence
                .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                    let remote_documents = txn.remote_documents.get_entries(&keys);
                    let without_remote_version: BTreeSet<DocumentKey> = remote_documents
                        .iter()
                        .filter(|(_, document)| !document.is_valid_document())
                        .map(|(key, _)| key.clone())
                        .collect();
                    let mut overlayed =
                        local_documents_view::get_overlayed_documents(txn, remote_documents)?;

                    // Non-idempotent transforms remember the value they started from, so later
                    // re-applications agree with what the user saw at write time.
                    let base_mutations: Vec<Mutation> = mutations
                        .iter()
                        .filter_map(|mutation| {
                            let document = &overlayed.get(mutation.key())?.document;
                            let base = mutation.extract_transform_base_value(document)?;
                            let mask = FieldMask::new(base.leaf_paths());
                            Some(Mutation::patch(mutation.key().clone(), base, mask))
                        })
                        .collect();

                    let batch = txn.mutation_queue.add_mutation_batch(
                        local_write_time,
                        base_mutations,
                        mutations,
                    )?;
                    let overlays: BTreeMap<DocumentKey, Option<Mutation>> = batch
                        .apply_to_local_document_set(&mut overlayed, &without_remote_version)
                        .into_iter()
                        .map(|(key, mutation)| (key, Some(mutation)))
                        .collect();
                    txn.document_overlays.save_overlays(batch.batch_id, &overlays);

                    let changes = overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect();
                    Ok((batch, changes))
                })?;

        self.local_view_references
            .add_references(batch.keys(), ReferenceHolder::Batch(batch.batch_id));
        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes,
        })
    }

    /// Folds an acknowledged batch into the remote document cache and drops it from the
    /// queue. Returns the new local view of the affected documents.
    pub fn acknowledge_batch(
        &mut self,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let batch = &batch_result.batch;
        let affected = batch.keys();
        let documents =
            self.persistence
                .run_transaction("Acknowledge batch", TransactionMode::ReadWrite, |txn| {
                    apply_write_to_remote_document_cache(txn, batch_result)?;
                    txn.mutation_queue
                        .set_last_stream_token(batch_result.stream_token.clone());
                    finish_batch(txn, batch, &affected)
                })?;
        self.local_view_references
            .remove_references_for_holder(ReferenceHolder::Batch(batch.batch_id));
        Ok(documents)
    }

    /// Drops a batch the backend refused. The remote document cache is left alone.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let documents =
            self.persistence
                .run_transaction("Reject batch", TransactionMode::ReadWrite, |txn| {
                    let batch = txn
                        .mutation_queue
                        .lookup_mutation_batch(batch_id)
                        .ok_or_else(|| internal_error(format!("Attempt to reject nonexistent batch {batch_id}")))?;
                    let affected = batch.keys();
                    finish_batch(txn, &batch, &affected)
                })?;
        self.local_view_references
            .remove_references_for_holder(ReferenceHolder::Batch(batch_id));
        Ok(documents)
    }

    pub fn get_highest_unacknowledged_batch_id(&mut self) -> FirestoreResult<BatchId> {
        self.persistence.run_transaction(
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.mutation_queue.get_highest_unacknowledged_batch_id()),
        )
    }

    /// First pending batch after `after_batch_id` (`None` starts from the beginning).
    pub fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.persistence.run_transaction(
            "Get next mutation batch",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.mutation_queue.get_next_mutation_batch_after_batch_id(after)),
        )
    }

    pub fn get_last_stream_token(&mut self) -> FirestoreResult<BytesValue> {
        self.persistence.run_transaction(
            "Get last stream token",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.mutation_queue.last_stream_token()),
        )
    }

    pub fn set_last_stream_token(&mut self, token: BytesValue) -> FirestoreResult<()> {
        self.persistence.run_transaction(
            "Set last stream token",
            TransactionMode::ReadWrite,
            |txn| {
                txn.mutation_queue.set_last_stream_token(token);
                Ok(())
            },
        )
    }

    pub fn get_last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion> {
        self.persistence.run_transaction(
            "Get last remote snapshot version",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.target_cache.last_remote_snapshot_version()),
        )
    }

    /// Starts tracking `target`. An equal target that is cached already keeps its id and
    /// resume state.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let target_data =
            self.persistence
                .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                    if let Some(cached) = txn.target_cache.get_target_data(&target) {
                        return Ok(cached);
                    }
                    let target_id = txn.target_cache.allocate_target_id();
                    let target_data =
                        TargetData::new(target.clone(), target_id, TargetPurpose::Listen, txn.sequence_number);
                    txn.target_cache.add_target_data(target_data.clone())?;
                    Ok(target_data)
                })?;

        let target_id = target_data.target_id;
        let newer = match self.target_data_by_target.get(&target_id) {
            Some(existing) => target_data.snapshot_version > existing.snapshot_version,
            None => true,
        };
        if newer {
            self.target_data_by_target.insert(target_id, target_data.clone());
            self.target_ids_by_target
                .insert(target_data.target.clone(), target_id);
        }
        Ok(self
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or(target_data))
    }

    /// Active or cached target data for `target`.
    pub fn get_target_data(&mut self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_id) = self.target_ids_by_target.get(target) {
            return Ok(self.target_data_by_target.get(target_id).cloned());
        }
        self.persistence.run_transaction(
            "Get target data",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.target_cache.get_target_data(target)),
        )
    }

    /// Stops tracking a target. Its data stays in the target cache, stamped with the current
    /// sequence number, until garbage collection reclaims it.
    pub fn release_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        let Some(target_data) = self.target_data_by_target.get(&target_id).cloned() else {
            log::debug!("Ignoring release of nonexistent target {target_id}");
            return Ok(());
        };
        let released = self
            .local_view_references
            .remove_references_for_holder(ReferenceHolder::Target(target_id));

        self.persistence
            .run_transaction("Release target", TransactionMode::ReadWrite, |txn| {
                let sequence_number = txn.sequence_number;
                for key in &released {
                    txn.lru_delegate.record_document_use(key, sequence_number);
                }
                if txn.target_cache.get_target_data_by_id(target_id).is_some() {
                    txn.target_cache
                        .update_target_data(target_data.clone().with_sequence_number(sequence_number))?;
                }
                Ok(())
            })?;

        self.target_data_by_target.remove(&target_id);
        self.target_ids_by_target.remove(&target_data.target);
        Ok(())
    }

    /// Applies a remote event in one transaction and returns the new local view of every
    /// changed document.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let remote_version = event.snapshot_version;
        let mut new_target_data = self.target_data_by_target.clone();

        let changed = self
            .persistence
            .run_transaction("Apply remote event", TransactionMode::ReadWrite, |txn| {
                let sequence_number = txn.sequence_number;
                for (target_id, change) in &event.target_changes {
                    let Some(old) = new_target_data.get(target_id).cloned() else {
                        continue;
                    };
                    txn.target_cache
                        .remove_matching_keys(&change.removed_documents, *target_id);
                    txn.target_cache
                        .add_matching_keys(&change.added_documents, *target_id);
                    for key in change.removed_documents.iter().chain(&change.added_documents) {
                        txn.lru_delegate.record_document_use(key, sequence_number);
                    }

                    let mut updated = old.clone().with_sequence_number(sequence_number);
                    let mismatched = event.target_mismatches.contains_key(target_id);
                    if mismatched {
                        updated = updated
                            .with_resume_token(BytesValue::empty(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if mismatched || should_persist_target_data(&old, &updated, change) {
                        txn.target_cache.update_target_data(updated.clone())?;
                    }
                    new_target_data.insert(*target_id, updated);
                }

                let (changed, existence_changed) =
                    populate_document_change_buffer(txn, &event.document_updates, remote_version)?;

                for key in &event.resolved_limbo_documents {
                    txn.lru_delegate.record_document_use(key, sequence_number);
                }

                if !remote_version.is_min() {
                    let last = txn.target_cache.last_remote_snapshot_version();
                    if remote_version < last {
                        return Err(internal_error(format!(
                            "Watch stream reverted to previous snapshot ({remote_version} < {last})"
                        )));
                    }
                    txn.target_cache.set_last_remote_snapshot_version(remote_version);
                }

                local_documents_view::get_local_view_of_documents(txn, changed, &existence_changed)
            })?;

        self.target_data_by_target = new_target_data;
        Ok(changed)
    }

    /// Records which documents views now show, and advances the limbo-free snapshot of
    /// targets whose view is in sync with the backend.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                let sequence_number = txn.sequence_number;
                for change in view_changes {
                    for key in change.added_keys.iter().chain(&change.removed_keys) {
                        txn.lru_delegate.record_document_use(key, sequence_number);
                    }
                }
                Ok(())
            })?;

        for change in view_changes {
            let holder = ReferenceHolder::Target(change.target_id);
            self.local_view_references
                .add_references(change.added_keys.iter().cloned(), holder);
            self.local_view_references
                .remove_references(&change.removed_keys, holder);

            if !change.from_cache {
                if let Some(target_data) = self.target_data_by_target.get_mut(&change.target_id) {
                    target_data.last_limbo_free_snapshot_version = target_data.snapshot_version;
                }
            }
        }
        Ok(())
    }

    /// Runs `query` against the local cache. With `use_previous_results` the last
    /// limbo-free result of the query's target seeds an incremental scan.
    pub fn execute_query(&mut self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target())?;
        let query_engine = &mut self.query_engine;
        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadOnly, |txn| {
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        txn.target_cache
                            .get_matching_keys_for_target_id(target_data.target_id),
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };
                let no_keys = BTreeSet::new();
                let (since, previous_keys) = if use_previous_results {
                    (last_limbo_free, &remote_keys)
                } else {
                    (SnapshotVersion::min(), &no_keys)
                };
                let result = query_engine.get_documents_matching_query(
                    txn,
                    query,
                    since,
                    previous_keys,
                )?;
                Ok(QueryResult {
                    documents: result.documents,
                    remote_keys,
                    strategy: result.strategy,
                })
            })
    }

    pub fn is_index_candidate(&self, query: &Query) -> bool {
        self.query_engine.is_index_candidate(query)
    }

    /// Local view of `key`: the cached document with its overlay applied.
    pub fn get_document(&mut self, key: &DocumentKey) -> FirestoreResult<Document> {
        self.persistence.run_transaction(
            "Read document",
            TransactionMode::ReadOnly,
            |txn| Ok(local_documents_view::get_document(txn, key)),
        )
    }

    pub fn get_overlay(&mut self, key: &DocumentKey) -> FirestoreResult<Option<Overlay>> {
        self.persistence.run_transaction(
            "Read overlay",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.document_overlays.get_overlay(key)),
        )
    }

    pub fn remote_document_keys(&mut self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence.run_transaction(
            "Remote document keys",
            TransactionMode::ReadOnly,
            |txn| Ok(txn.target_cache.get_matching_keys_for_target_id(target_id)),
        )
    }

    /// Runs one LRU pass. Active targets and pinned documents are never collected.
    pub fn collect_garbage(&mut self) -> FirestoreResult<LruResults> {
        let active: HashSet<TargetId> = self.target_data_by_target.keys().copied().collect();
        let collector = &self.garbage_collector;
        let pins = &self.local_view_references;
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWrite, |txn| {
                Ok(collector.collect(txn, &active, pins))
            })
    }
}

/// Removes a finished batch and recomputes the overlays of its documents.
fn finish_batch(
    txn: &mut Transaction<'_>,
    batch: &MutationBatch,
    affected: &BTreeSet<DocumentKey>,
) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
    txn.mutation_queue.remove_mutation_batch(batch)?;
    txn.document_overlays.remove_overlays_for_batch_id(batch.batch_id);
    local_documents_view::recalculate_and_save_overlays_for_document_keys(txn, affected)?;
    let sequence_number = txn.sequence_number;
    for key in affected {
        txn.lru_delegate.record_document_use(key, sequence_number);
    }
    local_documents_view::get_documents(txn, affected)
}

fn apply_write_to_remote_document_cache(
    txn: &mut Transaction<'_>,
    batch_result: &MutationBatchResult,
) -> FirestoreResult<()> {
    let batch = &batch_result.batch;
    let keys = batch.keys();
    let mut documents = txn.remote_documents.get_entries(&keys);
    for key in &keys {
        let Some(document) = documents.get_mut(key) else {
            continue;
        };
        let Some(ack_version) = batch_result.doc_versions.get(key) else {
            return Err(internal_error(format!("Acknowledgement is missing a version for {key}")));
        };
        if document.version() < *ack_version {
            batch.apply_to_remote_document(document, batch_result);
            if document.is_valid_document() {
                txn.remote_documents
                    .add_entry(document.clone(), batch_result.commit_version)?;
            }
        }
    }
    Ok(())
}

/// Writes watch documents into the remote document cache and reports the changed ones plus
/// the keys whose existence flipped.
fn populate_document_change_buffer(
    txn: &mut Transaction<'_>,
    updates: &BTreeMap<DocumentKey, Document>,
    remote_version: SnapshotVersion,
) -> FirestoreResult<(BTreeMap<DocumentKey, Document>, BTreeSet<DocumentKey>)> {
    let keys: BTreeSet<DocumentKey> = updates.keys().cloned().collect();
    let existing = txn.remote_documents.get_entries(&keys);
    let mut changed = BTreeMap::new();
    let mut existence_changed = BTreeSet::new();

    for (key, document) in updates {
        let Some(existing) = existing.get(key) else {
            continue;
        };
        if document.is_found_document() != existing.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // A synthesized delete at version zero means "forget the document", e.g. when
            // a limbo target was rejected.
            txn.remote_documents.remove_entry(key);
            changed.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            let read_time = if remote_version.is_min() {
                document.version()
            } else {
                remote_version
            };
            txn.remote_documents.add_entry(document.clone(), read_time)?;
            changed.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "Ignoring outdated watch update for {key}. Current version: {} Watch version: {}",
                existing.version(),
                document.version()
            );
        }
    }
    Ok((changed, existence_changed))
}

fn should_persist_target_data(old: &TargetData, updated: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let delta = updated.snapshot_version.timestamp().to_micros() - old.snapshot_version.timestamp().to_micros();
    if delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::model::{FieldPath, MutationResult, TransformOperation};
    use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    fn map(entries: &[(&str, i64)]) -> MapValue {
        let mut value = MapValue::empty();
        for (name, n) in entries {
            value.set(&field(name), FirestoreValue::from_integer(*n));
        }
        value
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn store() -> LocalStore<MemoryPersistence> {
        LocalStore::new(
            MemoryPersistence::new(),
            QueryEngineSettings::default(),
            LruParams::default(),
        )
    }

    fn ack(store: &mut LocalStore<MemoryPersistence>, batch_id: BatchId, at: i64, transform_results: Vec<FirestoreValue>) {
        let batch = store.next_mutation_batch(Some(batch_id - 1)).unwrap().unwrap();
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(version(at), transform_results.clone()))
            .collect();
        let result = MutationBatchResult::from(batch, version(at), results, BytesValue::new(vec![9])).unwrap();
        store.acknowledge_batch(&result).unwrap();
    }

    fn remote_event(target_id: TargetId, at: i64, documents: Vec<Document>) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(at));
        let mut change = TargetChange {
            resume_token: BytesValue::new(vec![at as u8]),
            current: true,
            ..TargetChange::default()
        };
        for document in documents {
            change.added_documents.insert(document.key().clone());
            event.document_updates.insert(document.key().clone(), document);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[test]
    fn local_write_is_visible_before_acknowledgement() {
        let mut store = store();
        let result = store
            .local_write(vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]))])
            .unwrap();
        assert_eq!(result.batch_id, 1);

        let document = store.get_document(&key("rooms/a")).unwrap();
        assert_eq!(document.data(), &map(&[("x", 1)]));
        assert!(document.has_pending_writes());
        assert!(store.get_overlay(&key("rooms/a")).unwrap().is_some());
    }

    #[test]
    fn acknowledgement_removes_the_overlay() {
        let mut store = store();
        store
            .local_write(vec![Mutation::set(key("rooms/a"), map(&[("x", 1)]))])
            .unwrap();
        ack(&mut store, 1, 2, vec![]);

        let document = store.get_document(&key("rooms/a")).unwrap();
        assert_eq!(document.data(), &map(&[("x", 1)]));
        assert!(document.has_committed_mutations());
        assert!(!document.has_local_mutations());
        assert!(store.get_overlay(&key("rooms/a")).unwrap().is_none());
        assert_eq!(store.get_last_stream_token().unwrap().as_slice(), &[9]);
    }

    #[test]
    fn rejection_restores_the_remote_document() {
        let mut store = store();
        let target = Query::collection("rooms").unwrap().to_target();
        let target_data = store.allocate_target(target).unwrap();
        let remote = Document::new_found(key("rooms/a"), version(1), map(&[("x", 1)]));
        store
            .apply_remote_event(&remote_event(target_data.target_id, 1, vec![remote]))
            .unwrap();

        let write = store
            .local_write(vec![Mutation::patch(key("rooms/a"), map(&[("x", 2)]), FieldMask::new([field("x")]))])
            .unwrap();
        assert_eq!(write.changes[&key("rooms/a")].data(), &map(&[("x", 2)]));

        let changes = store.reject_batch(write.batch_id).unwrap();
        assert_eq!(changes[&key("rooms/a")].data(), &map(&[("x", 1)]));
        assert!(!changes[&key("rooms/a")].has_pending_writes());
        assert!(store.reject_batch(write.batch_id).is_err());
    }

    #[test]
    fn increments_use_the_server_result_on_ack() {
        let mut store = store();
        let increment = Mutation::patch(key("rooms/a"), MapValue::empty(), FieldMask::empty())
            .with_precondition(crate::firestore::model::Precondition::None)
            .with_transform(field("n"), TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)));
        store.local_write(vec![increment]).unwrap();
        assert_eq!(
            store.get_document(&key("rooms/a")).unwrap().field(&field("n")),
            Some(&FirestoreValue::from_integer(1))
        );
        ack(&mut store, 1, 2, vec![FirestoreValue::from_integer(41)]);
        let document = store.get_document(&key("rooms/a")).unwrap();
        assert!(matches!(
            document.field(&field("n")).map(FirestoreValue::kind),
            Some(ValueKind::Integer(41))
        ));
    }

    #[test]
    fn outdated_watch_updates_are_ignored() {
        let mut store = store();
        let target = Query::collection("rooms").unwrap().to_target();
        let target_id = store.allocate_target(target).unwrap().target_id;
        let newer = Document::new_found(key("rooms/a"), version(5), map(&[("x", 5)]));
        store.apply_remote_event(&remote_event(target_id, 5, vec![newer])).unwrap();

        let older = Document::new_found(key("rooms/a"), version(3), map(&[("x", 3)]));
        let changed = store.apply_remote_event(&remote_event(target_id, 6, vec![older])).unwrap();
        assert!(changed.is_empty());
        assert_eq!(store.get_document(&key("rooms/a")).unwrap().data(), &map(&[("x", 5)]));
        assert_eq!(store.remote_document_keys(target_id).unwrap().len(), 1);
    }

    #[test]
    fn reverting_snapshot_version_fails_without_side_effects() {
        let mut store = store();
        let target_id = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap()
            .target_id;
        store.apply_remote_event(&remote_event(target_id, 5, vec![])).unwrap();
        let stale = Document::new_found(key("rooms/b"), version(1), map(&[("x", 1)]));
        assert!(store.apply_remote_event(&remote_event(target_id, 4, vec![stale])).is_err());
        assert!(!store.get_document(&key("rooms/b")).unwrap().is_valid_document());
        assert_eq!(store.get_last_remote_snapshot_version().unwrap(), version(5));
    }

    #[test]
    fn mismatch_clears_the_resume_token() {
        let mut store = store();
        let target = Query::collection("rooms").unwrap().to_target();
        let target_id = store.allocate_target(target.clone()).unwrap().target_id;
        store.apply_remote_event(&remote_event(target_id, 5, vec![])).unwrap();
        assert!(!store.get_target_data(&target).unwrap().unwrap().resume_token.is_empty());

        let mut event = RemoteEvent::new(version(6));
        event.target_changes.insert(target_id, TargetChange::default());
        event
            .target_mismatches
            .insert(target_id, TargetPurpose::ExistenceFilterMismatch);
        store.apply_remote_event(&event).unwrap();
        let target_data = store.get_target_data(&target).unwrap().unwrap();
        assert!(target_data.resume_token.is_empty());
        assert!(target_data.snapshot_version.is_min());
    }

    #[test]
    fn allocating_an_equal_target_reuses_its_id() {
        let mut store = store();
        let first = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        store.release_target(first.target_id).unwrap();
        let second = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap();
        assert_eq!(first.target_id, second.target_id);
    }

    #[test]
    fn garbage_collection_keeps_pending_and_visible_documents() {
        let mut store = LocalStore::new(
            MemoryPersistence::new(),
            QueryEngineSettings::default(),
            LruParams {
                cache_size_collection_threshold: 0,
                percentile_to_collect: 100,
                maximum_sequence_numbers_to_collect: 1000,
            },
        );
        let target_id = store
            .allocate_target(Query::collection("rooms").unwrap().to_target())
            .unwrap()
            .target_id;
        let documents = vec![
            Document::new_found(key("rooms/a"), version(1), map(&[("x", 1)])),
            Document::new_found(key("rooms/b"), version(1), map(&[("x", 2)])),
        ];
        store.apply_remote_event(&remote_event(target_id, 1, documents)).unwrap();
        store
            .notify_local_view_changes(&[LocalViewChanges {
                target_id,
                from_cache: false,
                added_keys: [key("rooms/a"), key("rooms/b")].into_iter().collect(),
                removed_keys: BTreeSet::new(),
            }])
            .unwrap();
        store
            .local_write(vec![Mutation::patch(key("rooms/b"), map(&[("y", 1)]), FieldMask::new([field("y")]))])
            .unwrap();

        // Active target: nothing may go.
        let results = store.collect_garbage().unwrap();
        assert_eq!(results.documents_removed, 0);

        // After release only the document with a pending write survives.
        store.release_target(target_id).unwrap();
        let results = store.collect_garbage().unwrap();
        assert_eq!(results.targets_removed, 1);
        assert!(!store.get_document(&key("rooms/a")).unwrap().is_valid_document());
        assert!(store.get_document(&key("rooms/b")).unwrap().is_found_document());
    }
}
