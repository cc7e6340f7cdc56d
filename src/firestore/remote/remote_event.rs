use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::TargetPurpose;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::value::BytesValue;

/// Everything the watch stream delivered up to one consistent snapshot.
///
/// Applied to the local store as a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match; their cached results and resume token
    /// are discarded and the purpose says how they are re-listened.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Documents that only limbo targets reference; they carry no query state of their own.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn new(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeMap::new(),
            document_updates: BTreeMap::new(),
            resolved_limbo_documents: BTreeSet::new(),
        }
    }

    /// Synthesized event for a target that became current on the client side alone, e.g.
    /// an offline listen served from cache.
    pub fn for_current_change(
        target_id: TargetId,
        snapshot_version: SnapshotVersion,
        current: bool,
        resume_token: BytesValue,
    ) -> Self {
        let mut event = Self::new(snapshot_version);
        event.target_changes.insert(
            target_id,
            TargetChange::create_synthesized(current, resume_token),
        );
        event
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target delta since the previous snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server sent none this round.
    pub resume_token: BytesValue,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn create_synthesized(current: bool, resume_token: BytesValue) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }
}
