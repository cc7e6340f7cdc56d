use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};
use crate::firestore::value::BytesValue;

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the target matched as of the last applied remote event.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// `None` when the target is no longer listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

#[derive(Debug, Clone)]
struct TargetState {
    /// Outstanding add/remove requests; changes for a pending target are ignored.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: BytesValue,
    current: bool,
    /// Starts dirty so that the first event after a listen carries the target.
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: BytesValue::empty(),
            current: false,
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &BytesValue) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.clone();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::create_synthesized(self.current, self.resume_token.clone());
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        debug_assert!(self.pending_responses >= 0, "more target responses than requests");
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds individual watch messages into one [`RemoteEvent`] per consistent snapshot.
#[derive(Debug)]
pub struct WatchChangeAggregator {
    database_id: DatabaseId,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    /// Every target a pending document change touched; decides limbo-only documents.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(database_id: DatabaseId) -> Self {
        Self {
            database_id,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change<M>(&mut self, change: DocumentWatchChange, metadata: &M)
    where
        M: TargetMetadataProvider + ?Sized,
    {
        for target_id in &change.updated_target_ids {
            match &change.new_document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone(), metadata);
                }
                other => {
                    self.remove_document_from_target(*target_id, &change.key, other.clone(), metadata);
                }
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                &change.key,
                change.new_document.clone(),
                metadata,
            );
        }
    }

    pub fn handle_target_change<M>(&mut self, change: &WatchTargetChange, metadata: &M)
    where
        M: TargetMetadataProvider + ?Sized,
    {
        for target_id in self.targets_for_change(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(target_id, metadata) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(target_id, metadata) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(target_id, metadata) {
                        self.reset_target(target_id, metadata);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the server's count with the local one and, on mismatch, tries the bloom
    /// filter before scheduling the target for a full re-listen.
    pub fn handle_existence_filter<M>(&mut self, change: &ExistenceFilterChange, metadata: &M)
    where
        M: TargetMetadataProvider + ?Sized,
    {
        let target_id = change.target_id;
        let expected_count = change.filter.count;
        let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted while the client was not listening and no
                // delete was sent; synthesize one.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let tombstone = Document::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(target_id, &key, Some(tombstone), metadata);
                }
            } else {
                debug_assert_eq!(expected_count, 1, "single document target with count > 1");
            }
            return;
        }

        let current_count = self.current_document_count_of_target(target_id, metadata);
        if current_count == expected_count as usize {
            return;
        }
        let application = self.apply_bloom_filter(change, current_count, metadata);
        if application != BloomFilterApplication::Success {
            log::debug!(
                "Existence filter mismatch for target {target_id}: expected {expected_count}, \
                 have {current_count}; resetting target"
            );
            self.reset_target(target_id, metadata);
            let purpose = if application == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter<M>(
        &mut self,
        change: &ExistenceFilterChange,
        current_count: usize,
        metadata: &M,
    ) -> BloomFilterApplication
    where
        M: TargetMetadataProvider + ?Sized,
    {
        let Some(spec) = &change.filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let bloom_filter =
            match BloomFilter::new(spec.bitmap.as_slice().to_vec(), spec.padding, spec.hash_count) {
                Ok(filter) => filter,
                Err(err) => {
                    log::warn!("Applying bloom filter failed: {err}");
                    return BloomFilterApplication::Skipped;
                }
            };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(&bloom_filter, change.target_id, metadata);
        if change.filter.count as i64 != current_count as i64 - removed as i64 {
            return BloomFilterApplication::FalsePositive;
        }
        BloomFilterApplication::Success
    }

    /// Drops every locally known key the filter says the server no longer has.
    fn filter_removed_documents<M>(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
        metadata: &M,
    ) -> usize
    where
        M: TargetMetadataProvider + ?Sized,
    {
        let database_name = self.database_id.database_name();
        let mut removed = 0;
        for key in metadata.remote_keys_for_target(target_id) {
            let name = format!("{database_name}/documents/{}", key.path().canonical_string());
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, &key, None, metadata);
                removed += 1;
            }
        }
        removed
    }

    /// Builds the event for everything accumulated so far and clears the pending state.
    pub fn create_remote_event<M>(&mut self, snapshot_version: SnapshotVersion, metadata: &M) -> RemoteEvent
    where
        M: TargetMetadataProvider + ?Sized,
    {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, metadata) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .map(|state| state.current)
                .unwrap_or(false);
            if current && target_data.target.is_document_target() {
                // A current document target that never mentioned its document means the
                // document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(target_id, &key, metadata)
                    {
                        let tombstone = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(tombstone), metadata);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id, metadata)
                    .map(|data| data.purpose == TargetPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    /// Called for every add/remove request sent, so responses to stale requests are ignored.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn add_document_to_target<M>(&mut self, target_id: TargetId, document: Document, metadata: &M)
    where
        M: TargetMetadataProvider + ?Sized,
    {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key, metadata) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    /// `updated_document` is `None` when only the membership changed.
    fn remove_document_from_target<M>(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<Document>,
        metadata: &M,
    ) where
        M: TargetMetadataProvider + ?Sized,
    {
        if !self.is_active_target(target_id, metadata) {
            return;
        }
        let contained = self.target_contains_document(target_id, key, metadata);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left before a snapshot was raised.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    /// Forgets all pending changes and schedules removal of every key the target had.
    fn reset_target<M>(&mut self, target_id: TargetId, metadata: &M)
    where
        M: TargetMetadataProvider + ?Sized,
    {
        self.target_states.insert(target_id, TargetState::default());
        for key in metadata.remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, metadata);
        }
    }

    fn current_document_count_of_target<M>(&mut self, target_id: TargetId, metadata: &M) -> usize
    where
        M: TargetMetadataProvider + ?Sized,
    {
        let change = self.ensure_target_state(target_id).to_target_change();
        (metadata.remote_keys_for_target(target_id).len() + change.added_documents.len())
            .saturating_sub(change.removed_documents.len())
    }

    fn target_contains_document<M>(&self, target_id: TargetId, key: &DocumentKey, metadata: &M) -> bool
    where
        M: TargetMetadataProvider + ?Sized,
    {
        metadata.remote_keys_for_target(target_id).contains(key)
    }

    fn targets_for_change(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target<M>(&self, target_id: TargetId, metadata: &M) -> bool
    where
        M: TargetMetadataProvider + ?Sized,
    {
        self.target_data_for_active_target(target_id, metadata).is_some()
    }

    /// Target data, unless the target is unknown or awaiting responses to earlier requests.
    fn target_data_for_active_target<M>(&self, target_id: TargetId, metadata: &M) -> Option<TargetData>
    where
        M: TargetMetadataProvider + ?Sized,
    {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.target_data_for_target(target_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Query, Target};
    use crate::firestore::model::Timestamp;
    use crate::firestore::remote::watch_change::{BloomFilterSpec, ExistenceFilter};
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct TestMetadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl TestMetadata {
        fn with_target(mut self, target_id: TargetId, target: Target, purpose: TargetPurpose) -> Self {
            self.targets
                .insert(target_id, TargetData::new(target, target_id, purpose, 1));
            self
        }

        fn with_keys(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn rooms() -> Target {
        Query::collection("rooms").unwrap().to_target()
    }

    fn doc_added(target_id: TargetId, path: &str, at: i64) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: vec![target_id],
            removed_target_ids: Vec::new(),
            key: key(path),
            new_document: Some(Document::new_found(key(path), version(at), MapValue::empty())),
        }
    }

    fn target_change(state: TargetChangeState, ids: Vec<TargetId>, token: &[u8]) -> WatchTargetChange {
        let mut change = WatchTargetChange::new(state, ids);
        change.resume_token = BytesValue::new(token.to_vec());
        change
    }

    fn existence_filter(target_id: TargetId, count: i32, spec: Option<BloomFilterSpec>) -> ExistenceFilterChange {
        ExistenceFilterChange {
            target_id,
            filter: ExistenceFilter {
                count,
                unchanged_names: spec,
            },
        }
    }

    fn name(path: &str) -> String {
        format!("projects/p/databases/(default)/documents/{path}")
    }

    fn aggregator() -> WatchChangeAggregator {
        WatchChangeAggregator::new(DatabaseId::default("p"))
    }

    #[test]
    fn aggregates_document_changes_into_one_event() {
        let metadata = TestMetadata::default().with_target(2, rooms(), TargetPurpose::Listen);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(2);
        aggregator.handle_target_change(&target_change(TargetChangeState::Add, vec![2], &[]), &metadata);
        aggregator.handle_document_change(doc_added(2, "rooms/a", 1), &metadata);
        aggregator.handle_target_change(&target_change(TargetChangeState::Current, vec![2], &[7]), &metadata);

        let event = aggregator.create_remote_event(version(3), &metadata);
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token.as_slice(), &[7]);
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert_eq!(event.document_updates[&key("rooms/a")].read_time(), version(3));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn changes_for_pending_targets_are_ignored() {
        let metadata = TestMetadata::default().with_target(2, rooms(), TargetPurpose::Listen);
        let mut aggregator = aggregator();
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(doc_added(2, "rooms/a", 1), &metadata);
        let event = aggregator.create_remote_event(version(1), &metadata);
        assert!(event.document_updates.is_empty());
        assert!(event.target_changes.is_empty());
    }

    #[test]
    fn document_entering_and_leaving_before_snapshot_is_dropped() {
        let metadata = TestMetadata::default().with_target(2, rooms(), TargetPurpose::Listen);
        let mut aggregator = aggregator();
        aggregator.handle_document_change(doc_added(2, "rooms/a", 1), &metadata);
        aggregator.handle_document_change(
            DocumentWatchChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: vec![2],
                key: key("rooms/a"),
                new_document: None,
            },
            &metadata,
        );
        let event = aggregator.create_remote_event(version(2), &metadata);
        let change = &event.target_changes[&2];
        assert!(change.added_documents.is_empty());
        assert!(change.removed_documents.is_empty());
    }

    #[test]
    fn count_mismatch_without_bloom_filter_resets_target() {
        let metadata = TestMetadata::default()
            .with_target(2, rooms(), TargetPurpose::Listen)
            .with_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&existence_filter(2, 1, None), &metadata);

        let event = aggregator.create_remote_event(version(4), &metadata);
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents.len(), 2);
        assert!(!change.current);
    }

    #[test]
    fn matching_count_is_accepted() {
        let metadata = TestMetadata::default()
            .with_target(2, rooms(), TargetPurpose::Listen)
            .with_keys(2, &["rooms/a"]);
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&existence_filter(2, 1, None), &metadata);
        let event = aggregator.create_remote_event(version(4), &metadata);
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn bloom_filter_prunes_documents_missing_on_server() {
        let metadata = TestMetadata::default()
            .with_target(2, rooms(), TargetPurpose::Listen)
            .with_keys(2, &["rooms/a", "rooms/b", "rooms/c"]);
        let unchanged = [name("rooms/a"), name("rooms/b")];
        let bloom = BloomFilter::from_values(unchanged.iter().map(String::as_str), 4096, 10).unwrap();
        let spec = BloomFilterSpec {
            bitmap: BytesValue::new(bloom.bitmap().to_vec()),
            padding: bloom.padding(),
            hash_count: bloom.hash_count(),
        };
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&existence_filter(2, 2, Some(spec)), &metadata);

        let event = aggregator.create_remote_event(version(5), &metadata);
        assert!(event.target_mismatches.is_empty());
        let change = &event.target_changes[&2];
        assert_eq!(
            change.removed_documents.iter().cloned().collect::<Vec<_>>(),
            vec![key("rooms/c")]
        );
    }

    #[test]
    fn bloom_filter_false_positive_falls_back_to_reset() {
        let metadata = TestMetadata::default()
            .with_target(2, rooms(), TargetPurpose::Listen)
            .with_keys(2, &["rooms/a", "rooms/b"]);
        let everything = [name("rooms/a"), name("rooms/b")];
        let bloom = BloomFilter::from_values(everything.iter().map(String::as_str), 4096, 10).unwrap();
        let spec = BloomFilterSpec {
            bitmap: BytesValue::new(bloom.bitmap().to_vec()),
            padding: bloom.padding(),
            hash_count: bloom.hash_count(),
        };
        let mut aggregator = aggregator();
        aggregator.handle_existence_filter(&existence_filter(2, 1, Some(spec)), &metadata);
        let event = aggregator.create_remote_event(version(5), &metadata);
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_delete() {
        let limbo_key = key("rooms/gone");
        let metadata = TestMetadata::default().with_target(
            1,
            Target::for_document(&limbo_key),
            TargetPurpose::LimboResolution,
        );
        let mut aggregator = aggregator();
        aggregator.handle_target_change(&target_change(TargetChangeState::Current, vec![1], &[1]), &metadata);
        let event = aggregator.create_remote_event(version(6), &metadata);

        let document = &event.document_updates[&limbo_key];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(6));
        assert!(event.resolved_limbo_documents.contains(&limbo_key));
    }

    #[test]
    fn document_also_in_query_target_is_not_limbo_resolved() {
        let shared = "rooms/a";
        let metadata = TestMetadata::default()
            .with_target(1, Target::for_document(&key(shared)), TargetPurpose::LimboResolution)
            .with_target(2, rooms(), TargetPurpose::Listen);
        let mut aggregator = aggregator();
        let mut change = doc_added(2, shared, 1);
        change.updated_target_ids.push(1);
        aggregator.handle_document_change(change, &metadata);
        let event = aggregator.create_remote_event(version(2), &metadata);
        assert!(event.resolved_limbo_documents.is_empty());
    }
}
