use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::mutation::{calculate_overlay_mutation, FieldMask, Mutation, MutationResult};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, Timestamp};
use crate::firestore::value::BytesValue;

pub type BatchId = i32;

/// Marker for "no batch", e.g. when no mutation has been applied yet.
pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// A document with the net local mutations applied, plus the fields those mutations touched.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: Document,
    /// `None` when the whole document was replaced or deleted locally.
    pub mutated_fields: Option<FieldMask>,
}

/// Group of mutations committed atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Mutations capturing base values of non-idempotent transforms. Applied locally only.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn affects_key(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }

    /// Applies the acknowledged mutations of this batch to `document`.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationBatchResult) {
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    /// Applies the batch optimistically; returns the accumulated mutated-field mask.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every affected entry of `documents` and returns the resulting
    /// overlays keyed by document.
    ///
    /// Keys in `without_remote_version` get full-document overlays since there is no remote
    /// base to patch against.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for key in self.keys() {
            let Some(entry) = documents.get_mut(&key) else {
                continue;
            };
            let mutated = self.apply_to_local_view(&mut entry.document, entry.mutated_fields.take());
            let mutated = if without_remote_version.contains(&key) {
                None
            } else {
                mutated
            };
            if let Some(overlay) = calculate_overlay_mutation(&entry.document, mutated.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            entry.mutated_fields = mutated;
            if !entry.document.is_valid_document() {
                entry.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// Backend acknowledgement of a whole batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: BytesValue,
    /// Version each written document ended up at.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: BytesValue,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mismatch between mutations length ({}) and results length ({})",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn value(field: &str, number: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(
            &FieldPath::from_dot_separated(field).unwrap(),
            FirestoreValue::from_integer(number),
        );
        map
    }

    #[test]
    fn result_requires_matching_lengths() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            vec![],
            vec![Mutation::set(key("rooms/a"), MapValue::empty())],
        );
        assert!(MutationBatchResult::from(batch, SnapshotVersion::min(), vec![], BytesValue::empty())
            .is_err());
    }

    #[test]
    fn local_document_set_produces_overlays() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            vec![],
            vec![
                Mutation::set(key("rooms/a"), value("n", 1)),
                Mutation::delete(key("rooms/b")),
            ],
        );
        let mut documents = BTreeMap::new();
        for path in ["rooms/a", "rooms/b"] {
            documents.insert(
                key(path),
                OverlayedDocument {
                    document: Document::new_invalid(key(path)),
                    mutated_fields: None,
                },
            );
        }
        let overlays = batch.apply_to_local_document_set(&mut documents, &BTreeSet::new());
        assert_eq!(overlays.len(), 2);
        assert!(documents[&key("rooms/a")].document.is_found_document());
        assert!(documents[&key("rooms/b")].document.is_no_document());
    }

    #[test]
    fn remote_application_only_touches_matching_key() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            vec![],
            vec![
                Mutation::set(key("rooms/a"), value("n", 1)),
                Mutation::set(key("rooms/b"), value("n", 2)),
            ],
        );
        let commit = SnapshotVersion::new(Timestamp::new(10, 0));
        let results = vec![
            MutationResult::new(commit, vec![]),
            MutationResult::new(commit, vec![]),
        ];
        let result =
            MutationBatchResult::from(batch.clone(), commit, results, BytesValue::empty()).unwrap();
        let mut doc = Document::new_invalid(key("rooms/b"));
        batch.apply_to_remote_document(&mut doc, &result);
        assert_eq!(
            doc.field(&FieldPath::from_dot_separated("n").unwrap()),
            Some(&FirestoreValue::from_integer(2))
        );
        assert!(doc.has_committed_mutations());
        assert_eq!(result.doc_versions.len(), 2);
    }
}
