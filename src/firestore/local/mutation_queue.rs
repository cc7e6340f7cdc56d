use std::collections::BTreeSet;
use std::ops::Bound::{Excluded, Unbounded};

use im::{OrdMap, OrdSet};

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::value::BytesValue;

/// Log of locally written batches the backend has not acknowledged yet.
pub trait MutationQueue {
    fn is_empty(&self) -> bool;

    /// Appends a batch with the next batch id.
    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch>;

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch>;

    /// First batch with an id greater than `batch_id`.
    fn get_next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch>;

    fn get_highest_unacknowledged_batch_id(&self) -> BatchId;

    fn get_all_mutation_batches(&self) -> Vec<MutationBatch>;

    fn get_all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch>;

    /// Batches touching any of `keys`, in batch id order, each once.
    fn get_all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch>;

    fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch>;

    /// Removes a batch by id. Batches may be removed out of submission order.
    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()>;

    /// Whether any pending batch touches `key`.
    fn contains_key(&self, key: &DocumentKey) -> bool;

    fn last_stream_token(&self) -> BytesValue;

    fn set_last_stream_token(&mut self, token: BytesValue);
}

#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    batches: OrdMap<BatchId, MutationBatch>,
    batches_by_key: OrdSet<(DocumentKey, BatchId)>,
    next_batch_id: BatchId,
    last_stream_token: BytesValue,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self {
            batches: OrdMap::new(),
            batches_by_key: OrdSet::new(),
            next_batch_id: 1,
            last_stream_token: BytesValue::empty(),
        }
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> impl Iterator<Item = BatchId> + '_ {
        let start = (key.clone(), BatchId::MIN);
        let key = key.clone();
        self.batches_by_key
            .range(start..)
            .take_while(move |(candidate, _)| candidate == &key)
            .map(|(_, batch_id)| *batch_id)
    }

    fn collect_batches(&self, ids: BTreeSet<BatchId>) -> Vec<MutationBatch> {
        ids.into_iter()
            .filter_map(|id| self.batches.get(&id).cloned())
            .collect()
    }
}

impl MutationQueue for MemoryMutationQueue {
    fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(internal_error("Mutation batches should not be empty"));
        }
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for key in batch.keys() {
            self.batches_by_key.insert((key, batch_id));
        }
        self.batches.insert(batch_id, batch.clone());
        Ok(batch)
    }

    fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.batches.get(&batch_id).cloned()
    }

    fn get_next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.batches
            .range((Excluded(batch_id), Unbounded))
            .next()
            .map(|(_, batch)| batch.clone())
    }

    fn get_highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches
            .get_max()
            .map(|(batch_id, _)| *batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    fn get_all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.batches.values().cloned().collect()
    }

    fn get_all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        self.collect_batches(self.batch_ids_for_key(key).collect())
    }

    fn get_all_mutation_batches_affecting_document_keys(
        &self,
        keys: &BTreeSet<DocumentKey>,
    ) -> Vec<MutationBatch> {
        let ids = keys
            .iter()
            .flat_map(|key| self.batch_ids_for_key(key).collect::<Vec<_>>())
            .collect();
        self.collect_batches(ids)
    }

    fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let prefix = query.path();
        let ids = self
            .batches_by_key
            .iter()
            .filter(|(key, _)| {
                if query.is_collection_group_query() {
                    query.collection_group_id() == Some(key.collection_group())
                        && prefix.is_prefix_of(key.path())
                } else if query.is_document_query() {
                    key.path() == prefix
                } else {
                    prefix.is_immediate_parent_of(key.path())
                }
            })
            .map(|(_, batch_id)| *batch_id)
            .collect();
        self.collect_batches(ids)
    }

    fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()> {
        if self.batches.remove(&batch.batch_id).is_none() {
            return Err(internal_error(format!(
                "Attempt to remove unknown mutation batch {}",
                batch.batch_id
            )));
        }
        for key in batch.keys() {
            self.batches_by_key.remove(&(key, batch.batch_id));
        }
        Ok(())
    }

    fn contains_key(&self, key: &DocumentKey) -> bool {
        self.batch_ids_for_key(key).next().is_some()
    }

    fn last_stream_token(&self) -> BytesValue {
        self.last_stream_token.clone()
    }

    fn set_last_stream_token(&mut self, token: BytesValue) {
        self.last_stream_token = token;
    }
}
