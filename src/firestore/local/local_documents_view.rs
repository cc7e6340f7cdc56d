//! Local view of documents: remote cache entries with pending-write overlays applied.

use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::Overlay;
use crate::firestore::local::persistence::Transaction;
use crate::firestore::local::remote_document_cache::QueryContext;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, FieldMask, Mutation,
    OverlayedDocument, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// Position in the cache a scan resumes from: documents read after `read_time` and overlays
/// written by batches after `largest_batch_id`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexOffset {
    pub read_time: SnapshotVersion,
    pub largest_batch_id: BatchId,
}

impl IndexOffset {
    /// Offset that includes everything.
    pub fn none() -> Self {
        Self {
            read_time: SnapshotVersion::min(),
            largest_batch_id: BATCH_ID_UNKNOWN,
        }
    }

    pub fn from_read_time(read_time: SnapshotVersion) -> Self {
        Self {
            read_time,
            largest_batch_id: BATCH_ID_UNKNOWN,
        }
    }
}

/// Local view of one document, or an invalid document when nothing is known.
pub fn get_document(txn: &Transaction<'_>, key: &DocumentKey) -> Document {
    let mut document = txn.remote_documents.get_entry(key);
    if let Some(overlay) = txn.document_overlays.get_overlay(key) {
        overlay
            .mutation
            .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
    }
    document
}

pub fn get_documents(
    txn: &mut Transaction<'_>,
    keys: &BTreeSet<DocumentKey>,
) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
    let documents = txn.remote_documents.get_entries(keys);
    get_local_view_of_documents(txn, documents, &BTreeSet::new())
}

/// Applies overlays to already loaded remote documents.
///
/// Documents in `existence_state_changed` whose overlay is a patch (or that have none) get
/// their overlay recomputed, since a patch folded against a missing base may now produce a
/// different result.
pub fn get_local_view_of_documents(
    txn: &mut Transaction<'_>,
    documents: BTreeMap<DocumentKey, Document>,
    existence_state_changed: &BTreeSet<DocumentKey>,
) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
    let overlays = txn
        .document_overlays
        .get_overlays(&documents.keys().cloned().collect());
    Ok(compute_views(txn, documents, &overlays, existence_state_changed)?
        .into_iter()
        .map(|(key, overlayed)| (key, overlayed.document))
        .collect())
}

/// Like [`get_local_view_of_documents`] but also reports the fields each overlay touched.
pub fn get_overlayed_documents(
    txn: &mut Transaction<'_>,
    documents: BTreeMap<DocumentKey, Document>,
) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
    let overlays = txn
        .document_overlays
        .get_overlays(&documents.keys().cloned().collect());
    compute_views(txn, documents, &overlays, &BTreeSet::new())
}

fn compute_views(
    txn: &mut Transaction<'_>,
    mut documents: BTreeMap<DocumentKey, Document>,
    overlays: &BTreeMap<DocumentKey, Overlay>,
    existence_state_changed: &BTreeSet<DocumentKey>,
) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
    let mut recalculate = BTreeMap::new();
    let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
    let now = Timestamp::now();

    for (key, document) in documents.iter_mut() {
        let overlay = overlays.get(key);
        let needs_recalculation = existence_state_changed.contains(key)
            && overlay.map_or(true, |overlay| overlay.mutation.is_patch());
        if needs_recalculation {
            recalculate.insert(key.clone(), document.clone());
        } else if let Some(overlay) = overlay {
            let mask = overlay.mutation.field_mask();
            mutated_fields.insert(key.clone(), mask.clone());
            overlay.mutation.apply_to_local_view(document, mask, now);
        } else {
            mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
        }
    }

    let recalculated = recalculate_overlays_in_place(txn, &mut recalculate)?;
    mutated_fields.extend(recalculated);
    documents.extend(recalculate);

    Ok(documents
        .into_iter()
        .map(|(key, document)| {
            let mutated = mutated_fields.remove(&key).unwrap_or(None);
            (
                key,
                OverlayedDocument {
                    document,
                    mutated_fields: mutated,
                },
            )
        })
        .collect())
}

/// Recomputes the overlays of `documents` from the pending batches and saves them.
///
/// `documents` holds remote (overlay-free) copies. Each overlay is stored under the highest
/// batch id that touched its document; documents no batch produces an overlay for lose any
/// overlay they had. Returns the mutated-field mask per document.
pub fn recalculate_and_save_overlays(
    txn: &mut Transaction<'_>,
    mut documents: BTreeMap<DocumentKey, Document>,
) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
    recalculate_overlays_in_place(txn, &mut documents)
}

/// Leaves the local view of each document in `documents`.
fn recalculate_overlays_in_place(
    txn: &mut Transaction<'_>,
    documents: &mut BTreeMap<DocumentKey, Document>,
) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
    let keys: BTreeSet<DocumentKey> = documents.keys().cloned().collect();
    let batches = txn
        .mutation_queue
        .get_all_mutation_batches_affecting_document_keys(&keys);

    let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
    let mut keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
    for batch in &batches {
        for key in batch.keys() {
            let Some(document) = documents.get_mut(&key) else {
                continue;
            };
            let previous = masks.remove(&key).unwrap_or_else(|| Some(FieldMask::empty()));
            masks.insert(key.clone(), batch.apply_to_local_view(document, previous));
            keys_by_batch.entry(batch.batch_id).or_default().insert(key);
        }
    }

    let mut processed = BTreeSet::new();
    for (batch_id, batch_keys) in keys_by_batch.iter().rev() {
        let mut overlays: BTreeMap<DocumentKey, Option<Mutation>> = BTreeMap::new();
        for key in batch_keys {
            if !processed.insert(key.clone()) {
                continue;
            }
            let Some(document) = documents.get(key) else {
                continue;
            };
            let mask = masks.get(key).cloned().flatten();
            let overlay = calculate_overlay_mutation(document, mask.as_ref());
            overlays.insert(key.clone(), overlay);
        }
        txn.document_overlays.save_overlays(*batch_id, &overlays);
    }

    let orphaned: BTreeMap<DocumentKey, Option<Mutation>> = keys
        .difference(&processed)
        .map(|key| (key.clone(), None))
        .collect();
    if !orphaned.is_empty() {
        txn.document_overlays.save_overlays(BATCH_ID_UNKNOWN, &orphaned);
    }
    Ok(masks)
}

pub fn recalculate_and_save_overlays_for_document_keys(
    txn: &mut Transaction<'_>,
    keys: &BTreeSet<DocumentKey>,
) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
    let documents = txn.remote_documents.get_entries(keys);
    recalculate_and_save_overlays(txn, documents)
}

/// Documents matching `query` in the local view, restricted to cache entries and overlays
/// newer than `offset`.
pub fn get_documents_matching_query(
    txn: &Transaction<'_>,
    query: &Query,
    offset: IndexOffset,
    context: &mut QueryContext,
) -> BTreeMap<DocumentKey, Document> {
    if query.is_document_query() {
        return get_documents_matching_document_query(txn, query);
    }

    let overlays = match query.collection_group_id() {
        Some(group) => txn
            .document_overlays
            .get_overlays_for_collection_group(group, offset.largest_batch_id),
        None => txn
            .document_overlays
            .get_overlays_for_collection(query.path(), offset.largest_batch_id),
    };
    let mutated_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
    let mut documents = txn.remote_documents.get_documents_matching_query(
        query,
        offset.read_time,
        &mutated_keys,
        context,
    );
    for key in mutated_keys {
        documents
            .entry(key.clone())
            .or_insert_with(|| Document::new_invalid(key));
    }

    let now = Timestamp::now();
    documents
        .into_iter()
        .filter_map(|(key, mut document)| {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), now);
            }
            query.matches(&document).then_some((key, document))
        })
        .collect()
}

fn get_documents_matching_document_query(
    txn: &Transaction<'_>,
    query: &Query,
) -> BTreeMap<DocumentKey, Document> {
    let mut result = BTreeMap::new();
    if let Ok(key) = DocumentKey::from_path(query.path().clone()) {
        let document = get_document(txn, &key);
        if document.is_found_document() {
            result.insert(key, document);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::FieldPath;
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    fn map(entries: &[(&str, i64)]) -> MapValue {
        let mut value = MapValue::empty();
        for (name, n) in entries {
            value.set(&field(name), FirestoreValue::from_integer(*n));
        }
        value
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn write(txn: &mut Transaction<'_>, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let keys = mutations.iter().map(|m| m.key().clone()).collect();
        txn.mutation_queue
            .add_mutation_batch(Timestamp::now(), vec![], mutations)?;
        recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
        Ok(())
    }

    #[test]
    fn overlay_folds_every_pending_batch() {
        let mut persistence = MemoryPersistence::new();
        persistence
            .run_transaction("fold", TransactionMode::ReadWrite, |txn| {
                txn.remote_documents.add_entry(
                    Document::new_found(key("rooms/a"), version(1), map(&[("a", 1)])),
                    version(1),
                )?;
                write(txn, vec![Mutation::patch(key("rooms/a"), map(&[("b", 2)]), FieldMask::new([field("b")]))])?;
                write(txn, vec![Mutation::patch(key("rooms/a"), map(&[("c", 3)]), FieldMask::new([field("c")]))])?;
                // Recomputing from scratch must not change the result.
                recalculate_and_save_overlays_for_document_keys(txn, &[key("rooms/a")].into_iter().collect())?;

                let overlay = txn.document_overlays.get_overlay(&key("rooms/a")).unwrap();
                assert_eq!(overlay.largest_batch_id, 2);
                let document = get_document(txn, &key("rooms/a"));
                assert_eq!(document.data(), &map(&[("a", 1), ("b", 2), ("c", 3)]));
                assert!(document.has_local_mutations());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn removed_batches_drop_their_overlays() {
        let mut persistence = MemoryPersistence::new();
        persistence
            .run_transaction("drop", TransactionMode::ReadWrite, |txn| {
                write(txn, vec![Mutation::set(key("rooms/a"), map(&[("a", 1)]))])?;
                let batch = txn.mutation_queue.lookup_mutation_batch(1).unwrap();
                txn.mutation_queue.remove_mutation_batch(&batch)?;
                recalculate_and_save_overlays_for_document_keys(txn, &batch.keys())?;
                assert!(txn.document_overlays.get_overlay(&key("rooms/a")).is_none());
                assert!(!get_document(txn, &key("rooms/a")).is_valid_document());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn query_includes_locally_written_documents() {
        let mut persistence = MemoryPersistence::new();
        persistence
            .run_transaction("query", TransactionMode::ReadWrite, |txn| {
                txn.remote_documents.add_entry(
                    Document::new_found(key("rooms/a"), version(1), map(&[("n", 1)])),
                    version(1),
                )?;
                write(txn, vec![Mutation::set(key("rooms/b"), map(&[("n", 2)]))])?;
                write(txn, vec![Mutation::delete(key("rooms/a"))])?;

                let query = Query::collection("rooms").unwrap();
                let mut context = QueryContext::default();
                let results = get_documents_matching_query(txn, &query, IndexOffset::none(), &mut context);
                assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/b")]);
                Ok(())
            })
            .unwrap();
    }
}
