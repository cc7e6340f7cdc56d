use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Included, Unbounded};

use im::OrdMap;

use crate::firestore::core::Query;
use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, ResourcePath, SnapshotVersion};

/// Bookkeeping for a single query execution.
#[derive(Clone, Debug, Default)]
pub struct QueryContext {
    /// Documents scanned from the remote document cache.
    pub document_read_count: usize,
}

/// Cache of the latest documents received from the backend, keyed by document key.
///
/// Entries are owned here; readers always receive copies.
pub trait RemoteDocumentCache {
    /// Stores `document`, stamping it with `read_time`.
    fn add_entry(&mut self, document: Document, read_time: SnapshotVersion) -> FirestoreResult<()>;

    fn remove_entry(&mut self, key: &DocumentKey);

    /// Cached document, or an invalid document when nothing is cached.
    fn get_entry(&self, key: &DocumentKey) -> Document;

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Document>;

    /// Documents in the query's collection(s) read after `since_read_time` that either match
    /// `query` or appear in `mutated_keys` (their overlays may make them match).
    fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, Document>;

    fn document_keys(&self) -> Vec<DocumentKey>;

    /// Approximate size of all cached documents in bytes.
    fn byte_size(&self) -> usize;
}

#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    documents: OrdMap<DocumentKey, Document>,
    byte_size: usize,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl RemoteDocumentCache for MemoryRemoteDocumentCache {
    fn add_entry(&mut self, mut document: Document, read_time: SnapshotVersion) -> FirestoreResult<()> {
        if read_time.is_min() {
            return Err(internal_error(format!(
                "Cannot add document {} to the remote document cache with a read time of zero",
                document.key()
            )));
        }
        document.set_read_time(read_time);
        let size = document.approximate_byte_size();
        if let Some(previous) = self.documents.insert(document.key().clone(), document) {
            self.byte_size = self.byte_size.saturating_sub(previous.approximate_byte_size());
        }
        self.byte_size += size;
        Ok(())
    }

    fn remove_entry(&mut self, key: &DocumentKey) {
        if let Some(previous) = self.documents.remove(key) {
            self.byte_size = self.byte_size.saturating_sub(previous.approximate_byte_size());
        }
    }

    fn get_entry(&self, key: &DocumentKey) -> Document {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| Document::new_invalid(key.clone()))
    }

    fn get_entries(&self, keys: &BTreeSet<DocumentKey>) -> BTreeMap<DocumentKey, Document> {
        keys.iter()
            .map(|key| (key.clone(), self.get_entry(key)))
            .collect()
    }

    fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> BTreeMap<DocumentKey, Document> {
        let collection = query.path();
        let mut results = BTreeMap::new();
        // Every key under the query path sorts directly after the path itself.
        let under_path = self
            .documents
            .range::<_, ResourcePath>((Included(collection.clone()), Unbounded))
            .take_while(|(key, _)| collection.is_prefix_of(key.path()));
        for (key, document) in under_path {
            if !query.is_collection_group_query() && key.path().len() != collection.len() + 1 {
                continue;
            }
            context.document_read_count += 1;
            if document.read_time() <= since_read_time {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(document) {
                continue;
            }
            results.insert(key.clone(), document.clone());
        }
        results
    }

    fn document_keys(&self) -> Vec<DocumentKey> {
        self.documents.keys().cloned().collect()
    }

    fn byte_size(&self) -> usize {
        self.byte_size
    }
}
