use std::collections::{BTreeMap, BTreeSet};

use im::{OrdMap, OrdSet};

use crate::firestore::model::{BatchId, DocumentKey, Mutation, ResourcePath};

/// Net local effect of all pending batches on one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    /// Highest batch id folded into `mutation`.
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

pub trait DocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay>;

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay>;

    /// Replaces the overlays of the given keys. A `None` entry removes the overlay.
    fn save_overlays(
        &mut self,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Option<Mutation>>,
    );

    /// Drops every overlay last written by `batch_id`.
    fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId);

    /// Overlays of immediate children of `collection` with a batch id above `since_batch_id`.
    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay>;

    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay>;
}

#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: OrdMap<DocumentKey, Overlay>,
    keys_by_batch_id: OrdMap<BatchId, OrdSet<DocumentKey>>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    fn remove_overlay(&mut self, key: &DocumentKey) {
        if let Some(existing) = self.overlays.remove(key) {
            if let Some(keys) = self.keys_by_batch_id.get_mut(&existing.largest_batch_id) {
                keys.remove(key);
                if keys.is_empty() {
                    self.keys_by_batch_id.remove(&existing.largest_batch_id);
                }
            }
        }
    }
}

impl DocumentOverlayCache for MemoryDocumentOverlayCache {
    fn get_overlay(&self, key: &DocumentKey) -> Option<Overlay> {
        self.overlays.get(key).cloned()
    }

    fn get_overlays(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Overlay> {
        keys.iter()
            .filter_map(|key| self.get_overlay(key).map(|overlay| (key.clone(), overlay)))
            .collect()
    }

    fn save_overlays(
        &mut self,
        largest_batch_id: BatchId,
        overlays: &BTreeMap<DocumentKey, Option<Mutation>>,
    ) {
        for (key, mutation) in overlays {
            self.remove_overlay(key);
            let Some(mutation) = mutation else {
                continue;
            };
            self.overlays.insert(
                key.clone(),
                Overlay {
                    largest_batch_id,
                    mutation: mutation.clone(),
                },
            );
            self.keys_by_batch_id
                .entry(largest_batch_id)
                .or_default()
                .insert(key.clone());
        }
    }

    fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) {
        if let Some(keys) = self.keys_by_batch_id.remove(&batch_id) {
            for key in keys {
                self.overlays.remove(&key);
            }
        }
    }

    fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path()) && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                key.collection_group() == collection_group && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn overlays(entries: &[(&str, bool)]) -> BTreeMap<DocumentKey, Option<Mutation>> {
        entries
            .iter()
            .map(|(path, present)| {
                let mutation = present.then(|| Mutation::set(key(path), MapValue::empty()));
                (key(path), mutation)
            })
            .collect()
    }

    #[test]
    fn save_replaces_and_removes() {
        let mut cache = MemoryDocumentOverlayCache::new();
        cache.save_overlays(1, &overlays(&[("rooms/a", true), ("rooms/b", true)]));
        cache.save_overlays(2, &overlays(&[("rooms/a", true), ("rooms/b", false)]));
        assert_eq!(cache.get_overlay(&key("rooms/a")).unwrap().largest_batch_id, 2);
        assert!(cache.get_overlay(&key("rooms/b")).is_none());

        // Batch 1 no longer owns any overlay.
        cache.remove_overlays_for_batch_id(1);
        assert!(cache.get_overlay(&key("rooms/a")).is_some());
        cache.remove_overlays_for_batch_id(2);
        assert!(cache.is_empty());
    }

    #[test]
    fn collection_lookups_respect_batch_offset() {
        let mut cache = MemoryDocumentOverlayCache::new();
        cache.save_overlays(1, &overlays(&[("rooms/a", true)]));
        cache.save_overlays(3, &overlays(&[("rooms/b", true), ("rooms/b/msgs/m", true)]));
        let rooms = ResourcePath::from_string("rooms").unwrap();
        assert_eq!(cache.get_overlays_for_collection(&rooms, 0).len(), 2);
        assert_eq!(cache.get_overlays_for_collection(&rooms, 1).len(), 1);
        assert_eq!(cache.get_overlays_for_collection_group("msgs", 0).len(), 1);
    }
}
