use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::{LimitType, Query};
use crate::firestore::local::local_documents_view::{self, IndexOffset};
use crate::firestore::local::persistence::Transaction;
use crate::firestore::local::remote_document_cache::QueryContext;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};
use crate::firestore::error::FirestoreResult;

/// Tuning knobs deciding when a query should be backed by a persistent index.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryEngineSettings {
    pub index_auto_creation_enabled: bool,
    /// Collections scanned with fewer documents than this never become index candidates.
    pub index_auto_creation_min_collection_size: usize,
    /// A full scan reading more than `relative_index_read_cost_per_document * result size`
    /// documents flags the query as an index candidate.
    pub relative_index_read_cost_per_document: f64,
}

impl Default for QueryEngineSettings {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: true,
            index_auto_creation_min_collection_size: 100,
            relative_index_read_cost_per_document: 8.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanStrategy {
    /// Every cached document in the query's collection was read.
    FullScan,
    /// Previous results were reused and only documents read since the last limbo-free
    /// snapshot were scanned.
    SinceReadTime,
}

#[derive(Clone, Debug)]
pub struct QueryEngineResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub strategy: ScanStrategy,
    pub documents_read: usize,
}

/// Runs queries against the local cache.
#[derive(Debug, Default)]
pub struct QueryEngine {
    settings: QueryEngineSettings,
    index_candidates: BTreeSet<String>,
}

impl QueryEngine {
    pub fn new(settings: QueryEngineSettings) -> Self {
        Self {
            settings,
            index_candidates: BTreeSet::new(),
        }
    }

    /// Whether a past full scan of `query` was expensive enough to warrant an index.
    pub fn is_index_candidate(&self, query: &Query) -> bool {
        self.index_candidates.contains(&query.canonical_id())
    }

    /// Documents matching `query`. `remote_keys` and `last_limbo_free_snapshot_version`
    /// describe the previous consistent result of the query's target, if any.
    pub fn get_documents_matching_query(
        &mut self,
        txn: &mut Transaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<QueryEngineResult> {
        if let Some(result) =
            self.perform_query_using_remote_keys(txn, query, last_limbo_free_snapshot_version, remote_keys)?
        {
            return Ok(result);
        }
        Ok(self.execute_full_collection_scan(txn, query))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut Transaction<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<Option<QueryEngineResult>> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return Ok(None);
        }

        let documents = local_documents_view::get_documents(txn, remote_keys)?;
        let previous_results = apply_query(query, documents.into_values());
        if query.has_limit()
            && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version)
        {
            return Ok(None);
        }

        log::debug!(
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        );
        let mut context = QueryContext::default();
        let mut documents = local_documents_view::get_documents_matching_query(
            txn,
            query,
            IndexOffset::from_read_time(last_limbo_free_snapshot_version),
            &mut context,
        );
        for document in previous_results {
            documents.insert(document.key().clone(), document);
        }
        Ok(Some(QueryEngineResult {
            documents,
            strategy: ScanStrategy::SinceReadTime,
            documents_read: context.document_read_count,
        }))
    }

    fn execute_full_collection_scan(&mut self, txn: &Transaction<'_>, query: &Query) -> QueryEngineResult {
        log::debug!("Using full collection scan to execute query: {}", query.canonical_id());
        let mut context = QueryContext::default();
        let documents =
            local_documents_view::get_documents_matching_query(txn, query, IndexOffset::none(), &mut context);
        if self.settings.index_auto_creation_enabled {
            self.record_index_candidate(query, &context, documents.len());
        }
        QueryEngineResult {
            documents,
            strategy: ScanStrategy::FullScan,
            documents_read: context.document_read_count,
        }
    }

    fn record_index_candidate(&mut self, query: &Query, context: &QueryContext, result_size: usize) {
        if context.document_read_count < self.settings.index_auto_creation_min_collection_size {
            log::debug!(
                "SDK will not create cache indexes for query {} since it only read {} documents",
                query.canonical_id(),
                context.document_read_count
            );
            return;
        }
        let threshold = self.settings.relative_index_read_cost_per_document * result_size as f64;
        if context.document_read_count as f64 > threshold {
            log::debug!(
                "Query {} scanned {} documents for {result_size} results; flagging it for indexing",
                query.canonical_id(),
                context.document_read_count
            );
            self.index_candidates.insert(query.canonical_id());
        }
    }
}

/// Matching documents from `documents`, in query order.
fn apply_query(query: &Query, documents: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let comparator = query.comparator();
    let mut results: Vec<Document> = documents
        .into_iter()
        .filter(|document| query.matches(document))
        .collect();
    results.sort_by(|left, right| comparator.compare(left, right));
    results
}

/// Whether a limited query's previous results can no longer be trusted: a document dropped
/// out, or the document at the limit edge changed after the last limbo-free snapshot and
/// something outside the old result set may now sort ahead of it.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &[Document],
    remote_keys: &BTreeSet<DocumentKey>,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    match edge {
        Some(document) => {
            document.has_pending_writes() || document.version() > limbo_free_snapshot_version
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::{Direction, FieldFilter, Operator};
    use crate::firestore::local::memory_persistence::MemoryPersistence;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::{FieldPath, Timestamp};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, n: i64, at: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        Document::new_found(key(path), version(at), data)
    }

    fn seed(persistence: &mut MemoryPersistence, docs: Vec<(Document, i64)>) {
        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                for (document, read_at) in docs {
                    txn.remote_documents.add_entry(document, version(read_at))?;
                }
                Ok(())
            })
            .unwrap();
    }

    fn filtered_query() -> Query {
        Query::collection("rooms").unwrap().with_filter(
            FieldFilter::new(
                FieldPath::from_dot_separated("n").unwrap(),
                Operator::GreaterThan,
                FirestoreValue::from_integer(0),
            )
            .unwrap(),
        )
    }

    #[test]
    fn incremental_scan_merges_previous_results() {
        let mut persistence = MemoryPersistence::new();
        seed(&mut persistence, vec![(doc("rooms/a", 1, 1), 1), (doc("rooms/b", 2, 5), 5)]);
        let mut engine = QueryEngine::default();
        let remote_keys: BTreeSet<_> = [key("rooms/a")].into_iter().collect();

        let result = persistence
            .run_transaction("query", TransactionMode::ReadOnly, |txn| {
                engine.get_documents_matching_query(txn, &filtered_query(), version(2), &remote_keys)
            })
            .unwrap();
        assert_eq!(result.strategy, ScanStrategy::SinceReadTime);
        assert_eq!(
            result.documents.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/b")]
        );
    }

    #[test]
    fn limit_query_with_changed_edge_falls_back_to_full_scan() {
        let mut persistence = MemoryPersistence::new();
        seed(&mut persistence, vec![(doc("rooms/a", 1, 3), 3), (doc("rooms/b", 2, 1), 1)]);
        let mut engine = QueryEngine::default();
        let query = filtered_query()
            .order_by(FieldPath::from_dot_separated("n").unwrap(), Direction::Ascending)
            .limit_to_first(1);
        let remote_keys: BTreeSet<_> = [key("rooms/a")].into_iter().collect();

        let result = persistence
            .run_transaction("query", TransactionMode::ReadOnly, |txn| {
                engine.get_documents_matching_query(txn, &query, version(2), &remote_keys)
            })
            .unwrap();
        assert_eq!(result.strategy, ScanStrategy::FullScan);
    }

    #[test]
    fn expensive_full_scans_flag_index_candidates() {
        let mut persistence = MemoryPersistence::new();
        let mut docs = Vec::new();
        for i in 0..20 {
            docs.push((doc(&format!("rooms/{i:02}"), if i == 0 { 1 } else { -1 }, 1), 1));
        }
        seed(&mut persistence, docs);
        let mut engine = QueryEngine::new(QueryEngineSettings {
            index_auto_creation_min_collection_size: 10,
            ..QueryEngineSettings::default()
        });
        let query = filtered_query();
        let result = persistence
            .run_transaction("query", TransactionMode::ReadOnly, |txn| {
                engine.get_documents_matching_query(txn, &query, SnapshotVersion::min(), &BTreeSet::new())
            })
            .unwrap();
        assert_eq!(result.documents.len(), 1);
        assert_eq!(result.documents_read, 20);
        assert!(engine.is_index_candidate(&query));
    }
}
