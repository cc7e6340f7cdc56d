use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{BatchId, DocumentKey, TargetId};

/// Something that keeps a document alive in the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReferenceHolder {
    /// A view's locally visible document or a limbo document of that target.
    Target(TargetId),
    /// A pending write touching the document.
    Batch(BatchId),
}

/// Bidirectional reference table between document keys and their holders.
///
/// Both directions are kept so that adding, removing and "is this key referenced"
/// are all logarithmic, and dropping every reference of a holder touches only that
/// holder's keys.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeMap<DocumentKey, BTreeSet<ReferenceHolder>>,
    by_holder: BTreeMap<ReferenceHolder, BTreeSet<DocumentKey>>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, holder: ReferenceHolder) {
        self.by_holder
            .entry(holder)
            .or_default()
            .insert(key.clone());
        self.by_key.entry(key).or_default().insert(holder);
    }

    pub fn add_references(&mut self, keys: impl IntoIterator<Item = DocumentKey>, holder: ReferenceHolder) {
        for key in keys {
            self.add_reference(key, holder);
        }
    }

    /// Returns true when the pair existed.
    pub fn remove_reference(&mut self, key: &DocumentKey, holder: ReferenceHolder) -> bool {
        let removed = match self.by_key.get_mut(key) {
            Some(holders) => {
                let removed = holders.remove(&holder);
                if holders.is_empty() {
                    self.by_key.remove(key);
                }
                removed
            }
            None => false,
        };
        if let Some(keys) = self.by_holder.get_mut(&holder) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_holder.remove(&holder);
            }
        }
        removed
    }

    pub fn remove_references<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a DocumentKey>,
        holder: ReferenceHolder,
    ) {
        for key in keys {
            self.remove_reference(key, holder);
        }
    }

    /// Drops every reference of `holder` and returns the keys it held.
    pub fn remove_references_for_holder(&mut self, holder: ReferenceHolder) -> BTreeSet<DocumentKey> {
        let keys = self.by_holder.remove(&holder).unwrap_or_default();
        for key in &keys {
            if let Some(holders) = self.by_key.get_mut(key) {
                holders.remove(&holder);
                if holders.is_empty() {
                    self.by_key.remove(key);
                }
            }
        }
        keys
    }

    pub fn references_for_holder(&self, holder: ReferenceHolder) -> BTreeSet<DocumentKey> {
        self.by_holder.get(&holder).cloned().unwrap_or_default()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    /// Number of holders referencing `key`.
    pub fn reference_count(&self, key: &DocumentKey) -> usize {
        self.by_key.get(key).map(BTreeSet::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn counts_holders_per_key() {
        let mut references = ReferenceSet::new();
        references.add_reference(key("rooms/a"), ReferenceHolder::Target(2));
        references.add_reference(key("rooms/a"), ReferenceHolder::Batch(1));
        assert_eq!(references.reference_count(&key("rooms/a")), 2);

        assert!(references.remove_reference(&key("rooms/a"), ReferenceHolder::Batch(1)));
        assert!(!references.remove_reference(&key("rooms/a"), ReferenceHolder::Batch(1)));
        assert!(references.contains_key(&key("rooms/a")));
    }

    #[test]
    fn removing_a_holder_releases_only_its_keys() {
        let mut references = ReferenceSet::new();
        references.add_references([key("rooms/a"), key("rooms/b")], ReferenceHolder::Target(2));
        references.add_reference(key("rooms/b"), ReferenceHolder::Target(4));

        let released = references.remove_references_for_holder(ReferenceHolder::Target(2));
        assert_eq!(released.len(), 2);
        assert!(!references.contains_key(&key("rooms/a")));
        assert!(references.contains_key(&key("rooms/b")));
        assert!(references
            .references_for_holder(ReferenceHolder::Target(2))
            .is_empty());
    }
}
