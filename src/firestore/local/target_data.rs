use crate::firestore::core::Target;
use crate::firestore::model::{ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::firestore::value::BytesValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetPurpose {
    /// A regular query listen.
    Listen,
    /// Re-listen after an existence filter mismatch with no usable bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter failed to reconcile the mismatch.
    ExistenceFilterMismatchBloom,
    /// Single-document target resolving a limbo document.
    LimboResolution,
}

impl TargetPurpose {
    /// Value of the `goog-listen-tags` label sent with the target, if any.
    pub fn listen_tag(&self) -> Option<&'static str> {
        match self {
            TargetPurpose::Listen => None,
            TargetPurpose::ExistenceFilterMismatch => Some("existence-filter-mismatch"),
            TargetPurpose::ExistenceFilterMismatchBloom => Some("existence-filter-mismatch-bloom"),
            TargetPurpose::LimboResolution => Some("limbo-document"),
        }
    }
}

/// Cached state for one target. Owned by the target cache; everything else holds ids.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    /// Last time the target was used, for LRU collection.
    pub sequence_number: ListenSequenceNumber,
    /// Version of the latest consistent snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Latest snapshot version at which the target had no limbo documents.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: BytesValue,
    /// Number of documents the client believes match when resuming; lets the backend send
    /// an existence filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: BytesValue::empty(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(mut self, sequence_number: ListenSequenceNumber) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// New resume position; the expected count belongs to the old position and is dropped.
    pub fn with_resume_token(mut self, resume_token: BytesValue, snapshot_version: SnapshotVersion) -> Self {
        self.resume_token = resume_token;
        self.snapshot_version = snapshot_version;
        self.expected_count = None;
        self
    }

    pub fn with_expected_count(mut self, expected_count: i32) -> Self {
        self.expected_count = Some(expected_count);
        self
    }

    pub fn with_last_limbo_free_snapshot_version(mut self, version: SnapshotVersion) -> Self {
        self.last_limbo_free_snapshot_version = version;
        self
    }

    pub fn with_purpose(mut self, purpose: TargetPurpose) -> Self {
        self.purpose = purpose;
        self
    }
}

/// Hands out target ids from one parity class so that cache targets (even) and limbo
/// targets (odd) never collide.
#[derive(Clone, Debug)]
pub struct TargetIdGenerator {
    next_id: TargetId,
}

impl TargetIdGenerator {
    /// Even ids starting after `last_id`.
    pub fn for_target_cache(last_id: TargetId) -> Self {
        let mut generator = Self { next_id: 2 };
        while generator.next_id <= last_id {
            generator.next_id += 2;
        }
        generator
    }

    /// Odd ids, used for limbo resolution targets.
    pub fn for_sync_engine() -> Self {
        Self { next_id: 1 }
    }

    pub fn next(&mut self) -> TargetId {
        let id = self.next_id;
        self.next_id += 2;
        id
    }
}

/// Logical clock for listen sequence numbers.
#[derive(Clone, Debug, Default)]
pub struct ListenSequence {
    previous: ListenSequenceNumber,
}

impl ListenSequence {
    pub const INVALID: ListenSequenceNumber = -1;

    pub fn new(previous: ListenSequenceNumber) -> Self {
        Self { previous }
    }

    pub fn current(&self) -> ListenSequenceNumber {
        self.previous
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous += 1;
        self.previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generators_keep_parity() {
        let mut cache = TargetIdGenerator::for_target_cache(4);
        assert_eq!(cache.next(), 6);
        assert_eq!(cache.next(), 8);
        let mut limbo = TargetIdGenerator::for_sync_engine();
        assert_eq!(limbo.next(), 1);
        assert_eq!(limbo.next(), 3);
    }

    #[test]
    fn resume_token_update_clears_expected_count() {
        let key = crate::firestore::model::DocumentKey::from_string("rooms/a").unwrap();
        let data = TargetData::new(Target::for_document(&key), 2, TargetPurpose::Listen, 1)
            .with_expected_count(3)
            .with_resume_token(BytesValue::new(vec![1]), SnapshotVersion::min());
        assert_eq!(data.expected_count, None);
        assert_eq!(data.resume_token.as_slice(), &[1]);
    }
}
