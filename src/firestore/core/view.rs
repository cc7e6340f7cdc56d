use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{DocumentComparator, LimitType, Query};
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::remote::{OnlineState, TargetChange};

/// Documents of one view, ordered by the query's comparator.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.position(document).ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    /// Inserts `document`, replacing any entry with the same key.
    pub fn insert(&mut self, document: Document) {
        self.remove(document.key());
        let index = match self.position(&document) {
            Ok(index) | Err(index) => index,
        };
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(index, document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let existing = self.by_key.remove(key)?;
        if let Ok(index) = self.position(&existing) {
            self.sorted.remove(index);
        }
        Some(existing)
    }

    fn position(&self, document: &Document) -> Result<usize, usize> {
        self.sorted
            .binary_search_by(|probe| self.comparator.compare(probe, document))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
    /// Only the pending-write state of the document changed.
    Metadata,
}

impl ChangeType {
    fn sort_rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Accumulates per-key changes, folding successive changes to the same document.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };
        let merged = match (old.change_type, change.change_type) {
            (ChangeType::Metadata, new_type) if new_type != ChangeType::Added => Some(change),
            (old_type, ChangeType::Metadata) if old_type != ChangeType::Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (ChangeType::Modified, ChangeType::Modified) => Some(change),
            (ChangeType::Added, ChangeType::Modified) => Some(DocumentViewChange {
                change_type: ChangeType::Added,
                document: change.document,
            }),
            (ChangeType::Added, ChangeType::Removed) => None,
            (ChangeType::Modified, ChangeType::Removed) => Some(DocumentViewChange {
                change_type: ChangeType::Removed,
                document: old.document.clone(),
            }),
            (ChangeType::Removed, ChangeType::Added) => Some(DocumentViewChange {
                change_type: ChangeType::Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                log::warn!(
                    "Unsupported change sequence {:?} -> {:?} for {}",
                    old_type,
                    new_type,
                    key
                );
                Some(change)
            }
        };
        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// One consistent state of a query's results, delivered to listeners.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys of documents in `docs` that carry pending writes.
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    /// The target had a resume token, so the cache is known to hold server results.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// A first snapshot where every document counts as added.
    pub fn from_initial_documents(
        query: Query,
        docs: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = docs
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_docs = DocumentSet::new(query.comparator());
        Self {
            query,
            docs,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Copy without metadata-only changes.
    pub fn without_metadata_changes(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot
            .doc_changes
            .retain(|change| change.change_type != ChangeType::Metadata);
        snapshot.excludes_metadata_changes = true;
        snapshot
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Result of [`View::compute_doc_changes`], not yet applied to the view.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// A limited view dropped an edge document; the local store has to be re-queried
    /// before the result is complete.
    pub needs_refill: bool,
    pub mutated_keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Computes the visible result set of one query from local documents and target state.
#[derive(Debug)]
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend says belong to the target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Folds `changes` into the current (or `previous`) result without touching the view.
    pub fn compute_doc_changes(
        &self,
        changes: &BTreeMap<DocumentKey, Document>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut document_set, mut change_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.document_set, previous.change_set, previous.mutated_keys),
            None => (
                self.document_set.clone(),
                DocumentChangeSet::default(),
                self.mutated_keys.clone(),
            ),
        };

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit.is_some_and(|limit| document_set.len() == limit);
        let last_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => document_set.last().cloned(),
            _ => None,
        };
        let first_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => document_set.first().cloned(),
            _ => None,
        };

        let mut needs_refill = false;
        for (key, entry) in changes {
            let old_doc = document_set.get(key).cloned();
            let new_doc = self.query.matches(entry).then(|| entry.clone());

            let old_had_pending = old_doc
                .as_ref()
                .is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.as_ref().is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut applied = false;
            match (&old_doc, &new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !Self::should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new.clone(),
                            });
                            applied = true;
                            let past_last = last_in_limit
                                .as_ref()
                                .is_some_and(|edge| self.comparator.compare(new, edge) == Ordering::Greater);
                            let before_first = first_in_limit
                                .as_ref()
                                .is_some_and(|edge| self.comparator.compare(new, edge) == Ordering::Less);
                            if past_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new.clone(),
                        });
                        applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new.clone(),
                    });
                    applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old.clone(),
                    });
                    applied = true;
                    if last_in_limit.is_some() || first_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if applied {
                match new_doc {
                    Some(new) => {
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                        document_set.insert(new);
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Local acknowledged writes are held back until the backend reports the same version.
    fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
        old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
    }

    /// Commits `doc_changes` and the optional target change, producing a snapshot if
    /// anything visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let mut changes = doc_changes.change_set.into_changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_rank()
                .cmp(&right.change_type.sort_rank())
                .then_with(|| self.comparator.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);

        let limbo_changes = if update_limbo_documents && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_state);
        self.sync_state = Some(new_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: self.document_set.clone(),
            old_docs,
            doc_changes: changes,
            mutated_keys: self.mutated_keys.clone(),
            from_cache: new_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline makes the view stale; nothing else about the online state matters.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::default(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            self.apply_changes(unchanged, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    /// Rebuilds the view from a fresh local query.
    pub fn synchronize_with_persisted_state(
        &mut self,
        documents: &BTreeMap<DocumentKey, Document>,
        remote_keys: BTreeSet<DocumentKey>,
    ) -> ViewChange {
        self.synced_documents = remote_keys;
        self.limbo_documents.clear();
        let changes = self.compute_doc_changes(documents, None);
        self.apply_changes(changes, true, None, false)
    }

    /// Snapshot for a listener joining an existing view.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else { return };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.modified_documents {
            if !self.synced_documents.contains(key) {
                log::debug!("Modified document {} was not part of the synced set", key);
            }
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let previous = std::mem::take(&mut self.limbo_documents);
        let limbo: BTreeSet<DocumentKey> = self
            .document_set
            .iter()
            .filter(|document| self.should_be_in_limbo(document))
            .map(|document| document.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = previous
            .difference(&limbo)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            limbo
                .difference(&previous)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        self.limbo_documents = limbo;
        changes
    }

    /// Visible locally, unknown to the backend and not explained by a pending write.
    fn should_be_in_limbo(&self, document: &Document) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}
