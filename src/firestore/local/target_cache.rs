use std::collections::{BTreeSet, HashSet};

use im::{OrdMap, OrdSet};

use crate::firestore::core::Target;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::target_data::{TargetData, TargetIdGenerator};
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Cache of target metadata plus the document keys the backend reported for each target.
pub trait TargetCache {
    fn allocate_target_id(&mut self) -> TargetId;

    fn last_remote_snapshot_version(&self) -> SnapshotVersion;

    fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion);

    fn highest_sequence_number(&self) -> ListenSequenceNumber;

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()>;

    /// Removes the target and all of its matching keys.
    fn remove_target_data(&mut self, target_data: &TargetData);

    /// Looks a target up by structural equality.
    fn get_target_data(&self, target: &Target) -> Option<TargetData>;

    fn get_target_data_by_id(&self, target_id: TargetId) -> Option<TargetData>;

    fn target_count(&self) -> usize;

    fn targets(&self) -> Vec<TargetData>;

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId);

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Whether any target references `key`.
    fn contains_key(&self, key: &DocumentKey) -> bool;

    /// Removes inactive targets whose sequence number is at or below `upper_bound`.
    /// Returns the number of removed targets.
    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &HashSet<TargetId>,
    ) -> usize;
}

#[derive(Clone, Debug)]
pub struct MemoryTargetCache {
    targets_by_canonical_id: OrdMap<String, TargetData>,
    canonical_ids: OrdMap<TargetId, String>,
    keys_by_target: OrdMap<TargetId, OrdSet<DocumentKey>>,
    targets_by_key: OrdMap<DocumentKey, OrdSet<TargetId>>,
    last_remote_snapshot_version: SnapshotVersion,
    highest_sequence_number: ListenSequenceNumber,
    highest_target_id: TargetId,
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self {
            targets_by_canonical_id: OrdMap::new(),
            canonical_ids: OrdMap::new(),
            keys_by_target: OrdMap::new(),
            targets_by_key: OrdMap::new(),
            last_remote_snapshot_version: SnapshotVersion::min(),
            highest_sequence_number: 0,
            highest_target_id: 0,
        }
    }
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        if target_data.target_id > self.highest_target_id {
            self.highest_target_id = target_data.target_id;
        }
        if target_data.sequence_number > self.highest_sequence_number {
            self.highest_sequence_number = target_data.sequence_number;
        }
        let canonical_id = target_data.target.canonical_id().to_string();
        self.canonical_ids
            .insert(target_data.target_id, canonical_id.clone());
        self.targets_by_canonical_id.insert(canonical_id, target_data);
    }

    fn remove_matching_keys_for_target_id(&mut self, target_id: TargetId) {
        if let Some(keys) = self.keys_by_target.remove(&target_id) {
            for key in keys {
                self.unlink(&key, target_id);
            }
        }
    }

    fn unlink(&mut self, key: &DocumentKey, target_id: TargetId) {
        let now_empty = match self.targets_by_key.get_mut(key) {
            Some(targets) => {
                targets.remove(&target_id);
                targets.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.targets_by_key.remove(key);
        }
    }
}

impl TargetCache for MemoryTargetCache {
    fn allocate_target_id(&mut self) -> TargetId {
        let target_id = TargetIdGenerator::for_target_cache(self.highest_target_id).next();
        self.highest_target_id = target_id;
        target_id
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.last_remote_snapshot_version
    }

    fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        self.last_remote_snapshot_version = version;
    }

    fn highest_sequence_number(&self) -> ListenSequenceNumber {
        self.highest_sequence_number
    }

    fn add_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        if self
            .targets_by_canonical_id
            .contains_key(target_data.target.canonical_id())
        {
            return Err(internal_error(format!(
                "Adding a target that already exists: {}",
                target_data.target.canonical_id()
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn update_target_data(&mut self, target_data: TargetData) -> FirestoreResult<()> {
        if !self
            .targets_by_canonical_id
            .contains_key(target_data.target.canonical_id())
        {
            return Err(internal_error(format!(
                "Updating a nonexistent target: {}",
                target_data.target.canonical_id()
            )));
        }
        self.save_target_data(target_data);
        Ok(())
    }

    fn remove_target_data(&mut self, target_data: &TargetData) {
        self.targets_by_canonical_id
            .remove(target_data.target.canonical_id());
        self.canonical_ids.remove(&target_data.target_id);
        self.remove_matching_keys_for_target_id(target_data.target_id);
    }

    fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        self.targets_by_canonical_id
            .get(target.canonical_id())
            .cloned()
    }

    fn get_target_data_by_id(&self, target_id: TargetId) -> Option<TargetData> {
        self.canonical_ids
            .get(&target_id)
            .and_then(|canonical_id| self.targets_by_canonical_id.get(canonical_id))
            .cloned()
    }

    fn target_count(&self) -> usize {
        self.targets_by_canonical_id.len()
    }

    fn targets(&self) -> Vec<TargetData> {
        self.targets_by_canonical_id.values().cloned().collect()
    }

    fn add_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        for key in keys {
            self.keys_by_target
                .entry(target_id)
                .or_default()
                .insert(key.clone());
            self.targets_by_key
                .entry(key.clone())
                .or_default()
                .insert(target_id);
        }
    }

    fn remove_matching_keys(&mut self, keys: &BTreeSet<DocumentKey>, target_id: TargetId) {
        if let Some(target_keys) = self.keys_by_target.get_mut(&target_id) {
            for key in keys {
                target_keys.remove(key);
            }
        }
        for key in keys {
            self.unlink(key, target_id);
        }
    }

    fn get_matching_keys_for_target_id(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.keys_by_target
            .get(&target_id)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.targets_by_key.contains_key(key)
    }

    fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &HashSet<TargetId>,
    ) -> usize {
        let doomed: Vec<TargetData> = self
            .targets_by_canonical_id
            .values()
            .filter(|data| {
                data.sequence_number <= upper_bound && !active_target_ids.contains(&data.target_id)
            })
            .cloned()
            .collect();
        for target_data in &doomed {
            self.remove_target_data(target_data);
        }
        doomed.len()
    }
}
