use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::firestore::core::SyncSettings;
use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, unavailable, FirestoreError,
    FirestoreResult,
};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DatabaseId, DocumentKey, MutationBatch, MutationBatchResult, SnapshotVersion, TargetId,
};
use crate::firestore::remote::effects::{RemoteEffect, StreamKind, TimerId};
use crate::firestore::remote::messages::{ListenRequest, WriteRequest, WriteResponse};
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::persistent_stream::{PersistentStream, StreamState};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::value::BytesValue;

/// Reasons the remote store is not using the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    Shutdown,
}

/// Listen targets owned by the remote store plus remote keys owned by the syncer.
struct ListenMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.remote_keys_for_target(target_id)
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Drives the listen and write streams.
///
/// The remote store never performs I/O itself. Every operation queues [`RemoteEffect`]s
/// which the owner drains with [`RemoteStore::take_effects`] and executes in order,
/// reporting transport events back through the `handle_*` methods.
#[derive(Debug)]
pub struct RemoteStore {
    database_id: DatabaseId,
    max_pending_writes: usize,
    /// Targets the backend should be watching, keyed by id.
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_stream: PersistentStream,
    write_stream: PersistentStream,
    /// Present while a listen stream is started.
    watch_aggregator: Option<WatchChangeAggregator>,
    /// Batches read from the mutation queue, oldest first. Only the head is in flight.
    write_pipeline: VecDeque<MutationBatch>,
    write_in_flight: bool,
    handshake_complete: bool,
    last_stream_token: BytesValue,
    online_state: OnlineStateTracker,
    offline_causes: BTreeSet<OfflineCause>,
    effects: Vec<RemoteEffect>,
}

impl RemoteStore {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            database_id: settings.database_id.clone(),
            max_pending_writes: settings.max_pending_writes.max(1),
            listen_targets: BTreeMap::new(),
            watch_stream: PersistentStream::new(
                StreamKind::Listen,
                settings.retry.clone(),
                settings.stream_idle_timeout,
            ),
            write_stream: PersistentStream::new(
                StreamKind::Write,
                settings.retry.clone(),
                settings.stream_idle_timeout,
            ),
            watch_aggregator: None,
            write_pipeline: VecDeque::new(),
            write_in_flight: false,
            handshake_complete: false,
            last_stream_token: BytesValue::empty(),
            online_state: OnlineStateTracker::new(
                settings.online_state_timeout,
                settings.max_watch_stream_failures,
            ),
            offline_causes: BTreeSet::new(),
            effects: Vec::new(),
        }
    }

    pub fn take_effects(&mut self) -> Vec<RemoteEffect> {
        std::mem::take(&mut self.effects)
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state.state()
    }

    pub fn listen_target(&self, target_id: TargetId) -> Option<&TargetData> {
        self.listen_targets.get(&target_id)
    }

    pub fn stream_state(&self, kind: StreamKind) -> StreamState {
        match kind {
            StreamKind::Listen => self.watch_stream.state(),
            StreamKind::Write => self.write_stream.state(),
        }
    }

    pub fn pending_write_count(&self) -> usize {
        self.write_pipeline.len()
    }

    pub fn start(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        self.enable_network(syncer)
    }

    pub fn enable_network(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal(syncer)
    }

    /// Stops both streams and reports `Offline` right away.
    pub fn disable_network(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        self.set_online_state(syncer, OnlineState::Offline);
    }

    pub fn shutdown(&mut self, syncer: &mut dyn RemoteSyncer) {
        log::debug!("RemoteStore shutting down");
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        self.set_online_state(syncer, OnlineState::Unknown);
    }

    /// Starts watching `target_data`. Sent now if the stream is open, otherwise on the next
    /// open together with every other listen target.
    pub fn listen(&mut self, syncer: &mut dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target_data.clone());

        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else if self.watch_stream.is_open() {
            self.send_watch_request(&*syncer, target_data);
        }
    }

    pub fn unlisten(&mut self, syncer: &mut dyn RemoteSyncer, target_id: TargetId) {
        if self.listen_targets.remove(&target_id).is_none() {
            log::debug!("Ignoring unlisten of unwatched target {target_id}");
            return;
        }
        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle(&mut self.effects);
            } else if self.can_use_network() {
                // Nothing to watch; no reason to report offline.
                self.set_online_state(syncer, OnlineState::Unknown);
            }
        }
    }

    /// Reads new batches from the mutation queue into the write pipeline.
    pub fn fill_write_pipeline(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut last_batch_id = self.write_pipeline.back().map(|batch| batch.batch_id);
        while self.can_add_to_write_pipeline() {
            match syncer.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = Some(batch.batch_id);
                    self.add_to_write_pipeline(batch);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.mark_idle(&mut self.effects);
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    pub fn handle_stream_open(&mut self, syncer: &mut dyn RemoteSyncer, kind: StreamKind, generation: u64) {
        match kind {
            StreamKind::Listen => {
                if self.watch_stream.on_open(generation) {
                    // Resume every target; tokens make the backend skip what we have.
                    let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
                    for target_data in targets {
                        self.send_watch_request(&*syncer, target_data);
                    }
                }
            }
            StreamKind::Write => {
                if self.write_stream.on_open(generation) {
                    self.handshake_complete = false;
                    self.write_in_flight = false;
                    self.effects.push(RemoteEffect::SendWrite(WriteRequest::Handshake));
                }
            }
        }
    }

    /// A transport stream ended. `None` means the backend closed it without a status.
    pub fn handle_stream_closed(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        kind: StreamKind,
        generation: u64,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let error = error.unwrap_or_else(|| unavailable("Stream closed by the backend"));
        match kind {
            StreamKind::Listen => {
                if self
                    .watch_stream
                    .on_transport_closed(generation, error.clone(), &mut self.effects)
                {
                    self.on_watch_stream_close(syncer, Some(&error));
                }
                Ok(())
            }
            StreamKind::Write => {
                if self
                    .write_stream
                    .on_transport_closed(generation, error.clone(), &mut self.effects)
                {
                    self.on_write_stream_close(syncer, Some(error))?;
                }
                Ok(())
            }
        }
    }

    pub fn handle_watch_change(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        generation: u64,
        change: WatchChange,
    ) -> FirestoreResult<()> {
        if !self.watch_stream.is_current(generation) || !self.watch_stream.is_open() {
            return Ok(());
        }
        self.watch_stream.mark_healthy();
        self.set_online_state(syncer, OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Remove {
                if let Some(cause) = target_change.cause.clone() {
                    return self.handle_target_error(syncer, target_change, cause);
                }
            }
        }

        let Some(aggregator) = self.watch_aggregator.as_mut() else {
            return Ok(());
        };
        let metadata = ListenMetadata {
            listen_targets: &self.listen_targets,
            syncer: &*syncer,
        };
        let snapshot_version = match change {
            WatchChange::DocumentChange(document_change) => {
                aggregator.handle_document_change(document_change, &metadata);
                SnapshotVersion::min()
            }
            WatchChange::ExistenceFilter(filter) => {
                aggregator.handle_existence_filter(&filter, &metadata);
                SnapshotVersion::min()
            }
            WatchChange::TargetChange(target_change) => {
                aggregator.handle_target_change(&target_change, &metadata);
                // Only a global no-change marks a consistent snapshot across all targets.
                if target_change.state == TargetChangeState::NoChange && target_change.target_ids.is_empty() {
                    target_change.read_time
                } else {
                    SnapshotVersion::min()
                }
            }
        };

        if !snapshot_version.is_min() {
            let last_remote_snapshot_version = syncer.last_remote_snapshot_version()?;
            if snapshot_version >= last_remote_snapshot_version {
                self.raise_watch_snapshot(syncer, snapshot_version)?;
            }
        }
        Ok(())
    }

    pub fn handle_write_response(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        generation: u64,
        response: WriteResponse,
    ) -> FirestoreResult<()> {
        if !self.write_stream.is_current(generation) || !self.write_stream.is_open() {
            return Ok(());
        }
        self.write_stream.mark_healthy();
        self.last_stream_token = response.stream_token.clone();

        if !self.handshake_complete {
            self.handshake_complete = true;
            syncer.set_last_stream_token(response.stream_token)?;
            self.send_next_write();
            return Ok(());
        }

        let batch = self
            .write_pipeline
            .front()
            .cloned()
            .ok_or_else(|| internal_error("Write response received with an empty pipeline"))?;
        // The head batch stays queued until the response is known to describe it.
        let result = MutationBatchResult::from(
            batch,
            response.commit_version,
            response.mutation_results,
            response.stream_token,
        )?;
        self.write_pipeline.pop_front();
        self.write_in_flight = false;
        syncer.apply_successful_write(result)?;
        self.send_next_write();
        self.fill_write_pipeline(syncer)
    }

    pub fn handle_timer(&mut self, syncer: &mut dyn RemoteSyncer, timer: TimerId) -> FirestoreResult<()> {
        match timer {
            TimerId::ListenStreamConnectionBackoff => {
                self.watch_stream.on_backoff_elapsed(&mut self.effects);
            }
            TimerId::WriteStreamConnectionBackoff => {
                self.write_stream.on_backoff_elapsed(&mut self.effects);
            }
            TimerId::ListenStreamIdle => {
                if self.watch_stream.on_idle_timer(&mut self.effects) {
                    self.on_watch_stream_close(syncer, None);
                }
            }
            TimerId::WriteStreamIdle => {
                if self.write_stream.on_idle_timer(&mut self.effects) {
                    self.on_write_stream_close(syncer, None)?;
                }
            }
            TimerId::OnlineStateTimeout => {
                if let Some(state) = self.online_state.on_timeout() {
                    syncer.apply_online_state_change(state);
                }
            }
            TimerId::LruGarbageCollection => {}
        }
        Ok(())
    }

    fn enable_network_internal(&mut self, syncer: &mut dyn RemoteSyncer) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(syncer);
        } else {
            self.set_online_state(syncer, OnlineState::Unknown);
        }
        self.fill_write_pipeline(syncer)
    }

    fn disable_network_internal(&mut self) {
        self.write_stream.stop(&mut self.effects);
        self.watch_stream.stop(&mut self.effects);
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "Stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.write_in_flight = false;
        self.watch_aggregator = None;
    }

    fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < self.max_pending_writes
    }

    fn start_watch_stream(&mut self, syncer: &mut dyn RemoteSyncer) {
        self.watch_aggregator = Some(WatchChangeAggregator::new(self.database_id.clone()));
        self.watch_stream.start(&mut self.effects);
        if let Some(state) = self.online_state.handle_watch_stream_start(&mut self.effects) {
            syncer.apply_online_state_change(state);
        }
    }

    fn start_write_stream(&mut self) {
        self.handshake_complete = false;
        self.write_in_flight = false;
        self.write_stream.start(&mut self.effects);
    }

    fn send_watch_request(&mut self, syncer: &dyn RemoteSyncer, target_data: TargetData) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let request = if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min() {
            let expected_count = syncer.remote_keys_for_target(target_id).len() as i32;
            target_data.with_expected_count(expected_count)
        } else {
            target_data
        };
        self.watch_stream.cancel_idle_check(&mut self.effects);
        self.effects
            .push(RemoteEffect::SendListen(ListenRequest::AddTarget(request)));
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.watch_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.watch_stream.cancel_idle_check(&mut self.effects);
        self.effects
            .push(RemoteEffect::SendListen(ListenRequest::RemoveTarget(target_id)));
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        self.write_pipeline.push_back(batch);
        self.send_next_write();
    }

    /// Sends the pipeline head unless a batch is already awaiting its response.
    fn send_next_write(&mut self) {
        if self.write_in_flight || !self.handshake_complete || !self.write_stream.is_open() {
            return;
        }
        let Some(batch) = self.write_pipeline.front() else {
            return;
        };
        self.write_in_flight = true;
        let request = WriteRequest::Mutations {
            stream_token: self.last_stream_token.clone(),
            batch: batch.clone(),
        };
        self.write_stream.cancel_idle_check(&mut self.effects);
        self.effects.push(RemoteEffect::SendWrite(request));
    }

    fn raise_watch_snapshot(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let Some(aggregator) = self.watch_aggregator.as_mut() else {
            return Ok(());
        };
        let event = {
            let metadata = ListenMetadata {
                listen_targets: &self.listen_targets,
                syncer: &*syncer,
            };
            aggregator.create_remote_event(snapshot_version, &metadata)
        };

        let resume_tokens: Vec<(TargetId, BytesValue)> = event
            .target_changes
            .iter()
            .filter(|(_, change)| !change.resume_token.is_empty())
            .map(|(target_id, change)| (*target_id, change.resume_token.clone()))
            .collect();
        let target_mismatches = event.target_mismatches.clone();

        // Resume tokens only advance once the local store has accepted the event.
        syncer.apply_remote_event(event)?;

        for (target_id, resume_token) in resume_tokens {
            if let Some(target_data) = self.listen_targets.get_mut(&target_id) {
                *target_data = target_data
                    .clone()
                    .with_resume_token(resume_token, snapshot_version);
            }
        }

        for (target_id, purpose) in &target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            log::debug!("Re-listening to target {target_id} from scratch ({purpose:?})");
            // Keep the snapshot version but drop the token so the backend resends everything.
            let cleared = target_data
                .clone()
                .with_resume_token(BytesValue::empty(), target_data.snapshot_version);
            self.listen_targets.insert(*target_id, cleared);
            self.send_unwatch_request(*target_id);
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(&*syncer, request);
        }
        Ok(())
    }

    fn handle_target_error(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        change: &WatchTargetChange,
        cause: FirestoreError,
    ) -> FirestoreResult<()> {
        for target_id in &change.target_ids {
            if self.listen_targets.remove(target_id).is_some() {
                log::debug!("Target {target_id} rejected by the backend: {cause}");
                if let Some(aggregator) = self.watch_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
                syncer.reject_listen(*target_id, cause.clone())?;
            }
        }
        Ok(())
    }

    fn on_watch_stream_close(&mut self, syncer: &mut dyn RemoteSyncer, error: Option<&FirestoreError>) {
        self.watch_aggregator = None;
        if self.should_start_watch_stream() {
            if let Some(error) = error {
                if let Some(state) = self
                    .online_state
                    .handle_watch_stream_failure(error, &mut self.effects)
                {
                    syncer.apply_online_state_change(state);
                }
            }
            self.start_watch_stream(syncer);
        } else {
            self.set_online_state(syncer, OnlineState::Unknown);
        }
    }

    fn on_write_stream_close(
        &mut self,
        syncer: &mut dyn RemoteSyncer,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        self.write_in_flight = false;
        if let Some(error) = error {
            if !self.write_pipeline.is_empty() {
                if self.handshake_complete {
                    self.handle_write_error(syncer, error)?;
                } else {
                    self.handle_handshake_error(syncer, &error)?;
                }
            }
        }
        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    fn handle_handshake_error(&mut self, syncer: &mut dyn RemoteSyncer, error: &FirestoreError) -> FirestoreResult<()> {
        if is_permanent_error(error.code) {
            log::debug!("Write stream handshake failed permanently ({error}); resetting stream token");
            self.last_stream_token = BytesValue::empty();
            syncer.set_last_stream_token(BytesValue::empty())?;
        }
        Ok(())
    }

    /// Permanent errors fail the head batch only; the others are retried on reconnect.
    fn handle_write_error(&mut self, syncer: &mut dyn RemoteSyncer, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        if let Some(batch) = self.write_pipeline.pop_front() {
            self.write_stream.inhibit_backoff();
            syncer.reject_failed_write(batch.batch_id, error)?;
            self.fill_write_pipeline(syncer)?;
        }
        Ok(())
    }

    fn set_online_state(&mut self, syncer: &mut dyn RemoteSyncer, state: OnlineState) {
        if let Some(state) = self.online_state.set(state, &mut self.effects) {
            syncer.apply_online_state_change(state);
        }
    }
}
