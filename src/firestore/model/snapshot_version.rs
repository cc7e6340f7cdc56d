use std::fmt::{Display, Formatter};

use crate::firestore::model::Timestamp;

/// Version of a document or of a consistent watch snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SnapshotVersion {
    timestamp: Timestamp,
}

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self { timestamp }
    }

    /// Sentinel for "never synced".
    pub fn min() -> Self {
        Self {
            timestamp: Timestamp::new(0, 0),
        }
    }

    pub fn is_min(&self) -> bool {
        *self == Self::min()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl From<Timestamp> for SnapshotVersion {
    fn from(timestamp: Timestamp) -> Self {
        Self::new(timestamp)
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SnapshotVersion({}.{:09})",
            self.timestamp.seconds, self.timestamp.nanos
        )
    }
}
