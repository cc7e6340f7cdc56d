use std::collections::{BTreeMap, BTreeSet, VecDeque};

use futures::channel::oneshot;

use crate::firestore::core::query::Query;
use crate::firestore::core::target::Target;
use crate::firestore::core::view::{ChangeType, LimboDocumentChange, View, ViewSnapshot};
use crate::firestore::error::{cancelled, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    ListenSequence, LocalStore, LocalViewChanges, LruResults, Persistence, ReferenceHolder,
    ReferenceSet, TargetData, TargetIdGenerator, TargetPurpose,
};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, Mutation, MutationBatch, MutationBatchResult, SnapshotVersion,
    TargetId, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{OnlineState, RemoteEvent, RemoteSyncer, TargetChange};
use crate::firestore::value::BytesValue;

/// Resolves once the write is acknowledged or rejected by the backend.
pub type WriteReceiver = oneshot::Receiver<FirestoreResult<()>>;

/// Remote store work requested by the sync engine, executed by its owner in order.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteRequest {
    Listen(TargetData),
    Unlisten(TargetId),
    FillWritePipeline,
}

/// Notifications for the event manager.
#[derive(Clone, Debug)]
pub enum SyncEvent {
    Snapshots(Vec<ViewSnapshot>),
    QueryError { query: Query, error: FirestoreError },
    OnlineStateChanged(OnlineState),
}

#[derive(Debug)]
struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

#[derive(Clone, Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// The limbo target delivered the document at least once, so it is now the target's
    /// only remote key.
    received_document: bool,
}

/// Ties views, the local store and limbo resolution together.
///
/// Remote store calls are not made directly; they are queued as [`RemoteRequest`]s and
/// drained by the owner, which keeps every callback from the remote store re-entrancy free.
pub struct SyncEngine<P: Persistence> {
    local_store: LocalStore<P>,
    max_concurrent_limbo_resolutions: usize,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets hold each limbo document.
    limbo_document_refs: ReferenceSet,
    limbo_target_ids: TargetIdGenerator,
    mutation_callbacks: BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<FirestoreResult<()>>>>,
    online_state: OnlineState,
    remote_requests: Vec<RemoteRequest>,
    events: Vec<SyncEvent>,
}

impl<P: Persistence> SyncEngine<P> {
    pub fn new(local_store: LocalStore<P>, max_concurrent_limbo_resolutions: usize) -> Self {
        Self {
            local_store,
            max_concurrent_limbo_resolutions,
            query_views: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_ids: TargetIdGenerator::for_sync_engine(),
            mutation_callbacks: BTreeMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            remote_requests: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn local_store(&self) -> &LocalStore<P> {
        &self.local_store
    }

    pub fn local_store_mut(&mut self) -> &mut LocalStore<P> {
        &mut self.local_store
    }

    pub fn take_remote_requests(&mut self) -> Vec<RemoteRequest> {
        std::mem::take(&mut self.remote_requests)
    }

    pub fn take_events(&mut self) -> Vec<SyncEvent> {
        std::mem::take(&mut self.events)
    }

    /// Keys currently resolved by a limbo target.
    pub fn active_limbo_documents(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.active_limbo_targets_by_key.clone()
    }

    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn target_id_for_query(&self, query: &Query) -> Option<TargetId> {
        self.query_views
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id)
    }

    /// Starts watching `query` and returns its first snapshot.
    ///
    /// A query that already has a view shares its target.
    pub fn listen(&mut self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        if let Some(existing) = self.query_views.get(&query.canonical_id()) {
            return Ok(existing.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_id = target_data.target_id;
        // Queries with the same target share one backend listen.
        let target_is_new = !self.queries_by_target.contains_key(&target_id);
        log::debug!("Listening to {} with target {}", query.canonical_id(), target_id);
        let snapshot = self.initialize_view(query, target_id, target_data.resume_token.clone())?;
        if target_is_new {
            self.remote_requests.push(RemoteRequest::Listen(target_data));
        }
        Ok(snapshot)
    }

    fn initialize_view(
        &mut self,
        query: &Query,
        target_id: TargetId,
        resume_token: BytesValue,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None);
        let synthesized = TargetChange::create_synthesized(false, resume_token);
        let view_change = view.apply_changes(changes, true, Some(&synthesized), false);
        self.update_tracked_limbos(target_id, view_change.limbo_changes);

        self.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.queries_by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());

        view_change
            .snapshot
            .ok_or_else(|| internal_error("A new view always produces a first snapshot"))
    }

    /// Stops watching `query`. The target is released once no query shares it.
    pub fn unlisten(&mut self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(query_view) = self.query_views.get(&canonical_id) else {
            log::debug!("Ignoring unlisten of unknown query {canonical_id}");
            return Ok(());
        };
        let target_id = query_view.target_id;

        if let Some(queries) = self.queries_by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|existing| existing != query);
                self.query_views.remove(&canonical_id);
                return Ok(());
            }
        }

        log::debug!("Releasing target {target_id}");
        self.local_store.release_target(target_id)?;
        self.remote_requests.push(RemoteRequest::Unlisten(target_id));
        self.remove_and_cleanup_target(target_id, None);
        Ok(())
    }

    /// Applies `mutations` locally and queues them for the backend.
    pub fn write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<WriteReceiver> {
        let result = self.local_store.local_write(mutations)?;
        let (sender, receiver) = oneshot::channel();
        self.mutation_callbacks.insert(result.batch_id, sender);
        self.emit_new_snapshots(&result.changes, None)?;
        self.remote_requests.push(RemoteRequest::FillWritePipeline);
        Ok(receiver)
    }

    /// Resolves once every batch written so far is acknowledged or rejected.
    pub fn register_pending_writes_callback(&mut self) -> FirestoreResult<WriteReceiver> {
        let (sender, receiver) = oneshot::channel();
        let highest = self.local_store.get_highest_unacknowledged_batch_id()?;
        if highest == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            self.pending_writes_callbacks
                .entry(highest)
                .or_default()
                .push(sender);
        }
        Ok(receiver)
    }

    /// One-shot query against the local cache; no target is allocated.
    pub fn execute_query_from_cache(&mut self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None);
        view.apply_changes(changes, false, None, false)
            .snapshot
            .ok_or_else(|| internal_error("A new view always produces a first snapshot"))
    }

    pub fn get_document_from_cache(&mut self, key: &DocumentKey) -> FirestoreResult<Document> {
        self.local_store.get_document(key)
    }

    pub fn collect_garbage(&mut self) -> FirestoreResult<LruResults> {
        self.local_store.collect_garbage()
    }

    /// Fails every outstanding write and pending-writes waiter.
    pub fn fail_pending_writes(&mut self, error: &FirestoreError) {
        for (_, sender) in std::mem::take(&mut self.mutation_callbacks) {
            let _ = sender.send(Err(error.clone()));
        }
        for (_, senders) in std::mem::take(&mut self.pending_writes_callbacks) {
            for sender in senders {
                let _ = sender.send(Err(error.clone()));
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.fail_pending_writes(&cancelled("The client has been terminated"));
        self.local_store.shutdown();
    }

    fn emit_new_snapshots(
        &mut self,
        changes: &BTreeMap<DocumentKey, Document>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let canonical_ids: Vec<String> = self.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some((target_id, snapshot)) = self.apply_doc_changes(&canonical_id, changes, remote_event)? else {
                continue;
            };
            view_changes.push(local_view_changes(target_id, &snapshot));
            snapshots.push(snapshot);
        }
        if !snapshots.is_empty() {
            self.events.push(SyncEvent::Snapshots(snapshots));
        }
        self.local_store.notify_local_view_changes(&view_changes)
    }

    fn apply_doc_changes(
        &mut self,
        canonical_id: &str,
        changes: &BTreeMap<DocumentKey, Document>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<Option<(TargetId, ViewSnapshot)>> {
        let Some(query_view) = self.query_views.get_mut(canonical_id) else {
            return Ok(None);
        };
        let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
        if doc_changes.needs_refill {
            let refill = self.local_store.execute_query(&query_view.query, false)?;
            doc_changes = query_view
                .view
                .compute_doc_changes(&refill.documents, Some(doc_changes));
        }
        let target_id = query_view.target_id;
        let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
        let pending_reset = remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
        let view_change = query_view
            .view
            .apply_changes(doc_changes, true, target_change, pending_reset);
        self.update_tracked_limbos(target_id, view_change.limbo_changes);
        Ok(view_change.snapshot.map(|snapshot| (target_id, snapshot)))
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs
                        .add_reference(key.clone(), ReferenceHolder::Target(target_id));
                    self.track_limbo_change(key);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("Document no longer in limbo: {key}");
                    self.limbo_document_refs
                        .remove_reference(&key, ReferenceHolder::Target(target_id));
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        log::debug!("New document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    /// Starts limbo targets until the concurrency limit is reached.
    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_ids.next();
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            self.remote_requests.push(RemoteRequest::Listen(TargetData::new(
                Target::for_document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                ListenSequence::INVALID,
            )));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        self.remote_requests.push(RemoteRequest::Unlisten(target_id));
        self.active_limbo_resolutions_by_target.remove(&target_id);
        self.pump_enqueued_limbo_resolutions();
    }

    fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<FirestoreError>) {
        for query in self.queries_by_target.remove(&target_id).unwrap_or_default() {
            self.query_views.remove(&query.canonical_id());
            if let Some(error) = &error {
                self.events.push(SyncEvent::QueryError {
                    query,
                    error: error.clone(),
                });
            }
        }

        let limbo_keys = self
            .limbo_document_refs
            .remove_references_for_holder(ReferenceHolder::Target(target_id));
        for key in limbo_keys {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    fn resolve_write_callbacks(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        if let Some(sender) = self.mutation_callbacks.remove(&batch_id) {
            let _ = sender.send(result);
        }
        if let Some(senders) = self.pending_writes_callbacks.remove(&batch_id) {
            for sender in senders {
                let _ = sender.send(Ok(()));
            }
        }
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = BTreeSet::new();
    let mut removed_keys = BTreeSet::new();
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}

impl<P: Persistence> RemoteSyncer for SyncEngine<P> {
    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
        let mut received = Vec::new();
        for (target_id, change) in &event.target_changes {
            if !self.active_limbo_resolutions_by_target.contains_key(target_id) {
                continue;
            }
            let touched = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if touched > 1 {
                return Err(internal_error(format!(
                    "Limbo resolution target {target_id} matched more than one document"
                )));
            }
            if !change.added_documents.is_empty() {
                received.push((*target_id, true));
            } else if !change.removed_documents.is_empty() {
                received.push((*target_id, false));
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        for (target_id, received_document) in received {
            if let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(&target_id) {
                resolution.received_document = received_document;
            }
        }
        self.emit_new_snapshots(&changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = self
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        match limbo_key {
            Some(key) => {
                // The backend will not tell us about this document; treat it as deleted.
                log::debug!("Limbo target {target_id} for {key} rejected: {error}");
                self.active_limbo_targets_by_key.remove(&key);
                self.active_limbo_resolutions_by_target.remove(&target_id);
                let mut event = RemoteEvent::new(SnapshotVersion::min());
                event.document_updates.insert(
                    key.clone(),
                    Document::new_no_document(key.clone(), SnapshotVersion::min()),
                );
                event.resolved_limbo_documents.insert(key.clone());
                self.apply_remote_event(event)?;
                self.pump_enqueued_limbo_resolutions();
                Ok(())
            }
            None => {
                log::warn!("Listen for target {target_id} rejected: {error}");
                self.local_store.release_target(target_id)?;
                self.remove_and_cleanup_target(target_id, Some(error));
                Ok(())
            }
        }
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.resolve_write_callbacks(batch_id, Ok(()));
        self.emit_new_snapshots(&changes, None)
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        log::warn!("Write batch {batch_id} rejected: {error}");
        let changes = self.local_store.reject_batch(batch_id)?;
        self.resolve_write_callbacks(batch_id, Err(error));
        self.emit_new_snapshots(&changes, None)
    }

    fn next_mutation_batch(&mut self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        self.local_store.next_mutation_batch(after_batch_id)
    }

    fn set_last_stream_token(&mut self, stream_token: BytesValue) -> FirestoreResult<()> {
        self.local_store.set_last_stream_token(stream_token)
    }

    fn last_remote_snapshot_version(&mut self) -> FirestoreResult<SnapshotVersion> {
        self.local_store.get_last_remote_snapshot_version()
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            let mut keys = BTreeSet::new();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
            return keys;
        }
        let mut keys = BTreeSet::new();
        for query in self.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) {
        let snapshots: Vec<ViewSnapshot> = self
            .query_views
            .values_mut()
            .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
            .collect();
        self.online_state = online_state;
        self.events.push(SyncEvent::OnlineStateChanged(online_state));
        if !snapshots.is_empty() {
            self.events.push(SyncEvent::Snapshots(snapshots));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{permission_denied, FirestoreErrorCode};
    use crate::firestore::local::{LruParams, MemoryPersistence, QueryEngineSettings};
    use crate::firestore::model::{FieldPath, MutationResult, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn data(n: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        map
    }

    fn engine(max_limbo: usize) -> SyncEngine<MemoryPersistence> {
        let mut store = LocalStore::new(
            MemoryPersistence::new(),
            QueryEngineSettings::default(),
            LruParams::default(),
        );
        store.start().unwrap();
        SyncEngine::new(store, max_limbo)
    }

    fn snapshots(engine: &mut SyncEngine<MemoryPersistence>) -> Vec<ViewSnapshot> {
        engine
            .take_events()
            .into_iter()
            .flat_map(|event| match event {
                SyncEvent::Snapshots(snapshots) => snapshots,
                _ => Vec::new(),
            })
            .collect()
    }

    /// Target becomes current with `synced` while the cache receives every doc in `docs`.
    fn current_event(target_id: TargetId, at: i64, synced: &[&str], docs: &[&str]) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(at));
        event.target_changes.insert(
            target_id,
            TargetChange {
                resume_token: BytesValue::new(vec![at as u8]),
                current: true,
                added_documents: synced.iter().map(|path| key(path)).collect(),
                ..TargetChange::default()
            },
        );
        for path in docs {
            event
                .document_updates
                .insert(key(path), Document::new_found(key(path), version(at), data(1)));
        }
        event
    }

    #[test]
    fn listen_allocates_target_and_returns_cached_snapshot() {
        let mut engine = engine(100);
        let query = Query::collection("rooms").unwrap();
        let snapshot = engine.listen(&query).unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.docs.is_empty());

        let requests = engine.take_remote_requests();
        assert!(matches!(&requests[..], [RemoteRequest::Listen(data)] if data.target_id == 2));

        // A second listen shares the view and does not start a target.
        engine.listen(&query).unwrap();
        assert!(engine.take_remote_requests().is_empty());
    }

    #[test]
    fn current_target_produces_synced_snapshot() {
        let mut engine = engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        engine.take_events();

        engine
            .apply_remote_event(current_event(2, 1, &["rooms/a"], &["rooms/a"]))
            .unwrap();
        let snapshots = snapshots(&mut engine);
        assert_eq!(snapshots.len(), 1);
        assert!(!snapshots[0].from_cache);
        assert_eq!(snapshots[0].docs.len(), 1);
        assert_eq!(engine.remote_keys_for_target(2), BTreeSet::from([key("rooms/a")]));
    }

    #[test]
    fn write_raises_pending_snapshot_and_resolves_on_ack() {
        let mut engine = engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        engine.take_events();
        engine.take_remote_requests();

        let mut receiver = engine
            .write(vec![Mutation::set(key("rooms/a"), data(1))])
            .unwrap();
        let snapshots = snapshots(&mut engine);
        assert!(snapshots[0].has_pending_writes());
        assert_eq!(engine.take_remote_requests(), vec![RemoteRequest::FillWritePipeline]);
        let mut waiter = engine.register_pending_writes_callback().unwrap();

        let batch = engine.next_mutation_batch(None).unwrap().unwrap();
        let result = MutationBatchResult::from(
            batch,
            version(2),
            vec![MutationResult::new(version(2), Vec::new())],
            BytesValue::new(vec![7]),
        )
        .unwrap();
        engine.apply_successful_write(result).unwrap();

        assert_eq!(receiver.try_recv().unwrap(), Some(Ok(())));
        assert_eq!(waiter.try_recv().unwrap(), Some(Ok(())));
    }

    #[test]
    fn limbo_resolutions_respect_concurrency_limit() {
        let mut engine = engine(1);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        engine.take_remote_requests();

        engine
            .apply_remote_event(current_event(2, 1, &["rooms/a"], &["rooms/a", "rooms/b", "rooms/c"]))
            .unwrap();
        let requests = engine.take_remote_requests();
        assert_eq!(requests.len(), 1);
        let RemoteRequest::Listen(limbo) = &requests[0] else {
            panic!("expected a limbo listen, got {requests:?}");
        };
        assert_eq!(limbo.target_id, 1);
        assert_eq!(limbo.purpose, TargetPurpose::LimboResolution);
        assert_eq!(engine.enqueued_limbo_documents(), vec![key("rooms/c")]);
        assert!(snapshots(&mut engine)[0].from_cache);

        // Rejection resolves the document as deleted and frees the slot.
        engine
            .reject_listen(1, permission_denied("no access"))
            .unwrap();
        let requests = engine.take_remote_requests();
        assert!(matches!(
            &requests[..],
            [RemoteRequest::Listen(next)] if next.target_id == 3
        ));
        assert_eq!(
            engine.active_limbo_documents(),
            BTreeMap::from([(key("rooms/c"), 3)])
        );
        let snapshot = snapshots(&mut engine).pop().unwrap();
        assert!(!snapshot.docs.contains(&key("rooms/b")));
    }

    #[test]
    fn limbo_target_reports_received_document_as_remote_key() {
        let mut engine = engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        engine
            .apply_remote_event(current_event(2, 1, &[], &["rooms/b"]))
            .unwrap();
        assert!(engine.remote_keys_for_target(1).is_empty());

        engine
            .apply_remote_event(current_event(1, 2, &["rooms/b"], &["rooms/b"]))
            .unwrap();
        assert_eq!(engine.remote_keys_for_target(1), BTreeSet::from([key("rooms/b")]));
    }

    #[test]
    fn rejected_query_target_reports_error() {
        let mut engine = engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        engine.take_events();

        engine.reject_listen(2, permission_denied("no access")).unwrap();
        let events = engine.take_events();
        assert!(matches!(
            &events[..],
            [SyncEvent::QueryError { error, .. }] if error.code == FirestoreErrorCode::PermissionDenied
        ));
        assert_eq!(engine.target_id_for_query(&query), None);
    }

    #[test]
    fn unlisten_releases_target_once_unshared() {
        let mut engine = engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        engine.take_remote_requests();
        engine.unlisten(&query).unwrap();
        assert_eq!(engine.take_remote_requests(), vec![RemoteRequest::Unlisten(2)]);
    }

    #[test]
    fn offline_marks_synced_views_from_cache() {
        let mut engine = engine(100);
        let query = Query::collection("rooms").unwrap();
        engine.listen(&query).unwrap();
        engine
            .apply_remote_event(current_event(2, 1, &["rooms/a"], &["rooms/a"]))
            .unwrap();
        engine.take_events();

        engine.apply_online_state_change(OnlineState::Offline);
        let events = engine.take_events();
        assert!(matches!(events[0], SyncEvent::OnlineStateChanged(OnlineState::Offline)));
        let SyncEvent::Snapshots(snapshots) = &events[1] else {
            panic!("expected snapshots");
        };
        assert!(snapshots[0].from_cache);
    }
}
