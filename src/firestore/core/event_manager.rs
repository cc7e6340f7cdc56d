use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::core::view::ViewSnapshot;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::remote::OnlineState;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Deliver snapshots whose only change is pending-write or sync state.
    pub include_metadata_changes: bool,
    /// Hold back the first cached snapshot while the client may still reach the backend.
    pub wait_for_sync_when_online: bool,
}

/// Receives snapshots or the terminal error of a listener.
pub type SnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

pub type ListenerId = u64;

/// Filters view snapshots for one user-facing listener.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: SnapshotObserver) -> Self {
        Self {
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether an event reached the observer.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            snapshot.without_metadata_changes()
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            (self.observer)(Ok(snapshot.clone()));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let pending = match &self.snapshot {
            Some(snapshot) if !self.raised_initial_event => {
                self.should_raise_initial_event(snapshot, online_state).then(|| snapshot.clone())
            }
            _ => None,
        };
        match pending {
            Some(snapshot) => {
                self.raise_initial_event(&snapshot);
                true
            }
            None => false,
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.docs.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        (self.observer)(Ok(initial));
    }
}

struct QueryListeners {
    query: Query,
    last_snapshot: Option<ViewSnapshot>,
    listener_ids: Vec<ListenerId>,
}

/// Fans view snapshots out to every listener of the same query.
#[derive(Default)]
pub struct EventManager {
    queries: HashMap<String, QueryListeners>,
    listeners: BTreeMap<ListenerId, QueryListener>,
    next_listener_id: ListenerId,
    online_state: OnlineState,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no listener watches `query` yet, so a target must be started for it.
    pub fn needs_target(&self, query: &Query) -> bool {
        !self.queries.contains_key(&query.canonical_id())
    }

    /// Registers a listener. `initial` is the view's first snapshot when the caller just
    /// started the target for it.
    pub fn add_listener(&mut self, mut listener: QueryListener, initial: Option<ViewSnapshot>) -> ListenerId {
        let id = self.next_listener_id;
        self.next_listener_id += 1;

        let entry = self
            .queries
            .entry(listener.query().canonical_id())
            .or_insert_with(|| QueryListeners {
                query: listener.query().clone(),
                last_snapshot: None,
                listener_ids: Vec::new(),
            });
        if let Some(snapshot) = initial {
            entry.last_snapshot = Some(snapshot);
        }
        entry.listener_ids.push(id);

        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = &entry.last_snapshot {
            listener.on_view_snapshot(snapshot.clone());
        }
        self.listeners.insert(id, listener);
        id
    }

    /// Removes a listener; returns its query if it was the last one watching it.
    pub fn remove_listener(&mut self, id: ListenerId) -> Option<Query> {
        let listener = self.listeners.remove(&id)?;
        let canonical_id = listener.query().canonical_id();
        let entry = self.queries.get_mut(&canonical_id)?;
        entry.listener_ids.retain(|existing| *existing != id);
        if entry.listener_ids.is_empty() {
            self.queries.remove(&canonical_id).map(|entry| entry.query)
        } else {
            None
        }
    }

    pub fn on_view_snapshots(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(entry) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for id in &entry.listener_ids {
                if let Some(listener) = self.listeners.get_mut(id) {
                    listener.on_view_snapshot(snapshot.clone());
                }
            }
            entry.last_snapshot = Some(snapshot);
        }
    }

    /// The target for `query` failed; its listeners get the error and are dropped.
    pub fn on_query_error(&mut self, query: &Query, error: FirestoreError) {
        let Some(entry) = self.queries.remove(&query.canonical_id()) else {
            return;
        };
        for id in entry.listener_ids {
            if let Some(listener) = self.listeners.remove(&id) {
                listener.on_error(error.clone());
            }
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for listener in self.listeners.values_mut() {
            listener.apply_online_state_change(online_state);
        }
    }

    /// Fails and drops every listener.
    pub fn fail_all(&mut self, error: &FirestoreError) {
        self.queries.clear();
        for (_, listener) in std::mem::take(&mut self.listeners) {
            listener.on_error(error.clone());
        }
    }

    /// Drops every listener without notifying it.
    pub fn clear(&mut self) {
        self.queries.clear();
        self.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::view::View;
    use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    fn recorder() -> (SnapshotObserver, Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer: SnapshotObserver = Arc::new(move |event| sink.lock().unwrap().push(event));
        (observer, events)
    }

    fn cached_snapshot(query: &Query, paths: &[&str]) -> ViewSnapshot {
        let mut view = View::new(query.clone(), BTreeSet::new());
        let docs = paths
            .iter()
            .map(|path| {
                let key = DocumentKey::from_string(path).unwrap();
                let doc = Document::new_found(key.clone(), SnapshotVersion::new(Timestamp::new(1, 0)), MapValue::empty());
                (key, doc)
            })
            .collect();
        let changes = view.compute_doc_changes(&docs, None);
        view.apply_changes(changes, false, None, false).snapshot.unwrap()
    }

    #[test]
    fn empty_cached_snapshot_waits_until_offline() {
        let query = Query::collection("rooms").unwrap();
        let (observer, events) = recorder();
        let mut manager = EventManager::new();
        assert!(manager.needs_target(&query));
        manager.add_listener(
            QueryListener::new(query.clone(), ListenOptions::default(), observer),
            Some(cached_snapshot(&query, &[])),
        );
        assert!(events.lock().unwrap().is_empty());
        assert!(!manager.needs_target(&query));

        manager.on_online_state_change(OnlineState::Offline);
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].as_ref().unwrap().from_cache);
    }

    #[test]
    fn cached_documents_are_raised_immediately_unless_waiting_for_sync() {
        let query = Query::collection("rooms").unwrap();
        let (eager, eager_events) = recorder();
        let (patient, patient_events) = recorder();
        let mut manager = EventManager::new();
        manager.add_listener(
            QueryListener::new(query.clone(), ListenOptions::default(), eager),
            Some(cached_snapshot(&query, &["rooms/a"])),
        );
        manager.add_listener(
            QueryListener::new(
                query.clone(),
                ListenOptions {
                    include_metadata_changes: true,
                    wait_for_sync_when_online: true,
                },
                patient,
            ),
            None,
        );
        assert_eq!(eager_events.lock().unwrap().len(), 1);
        assert!(patient_events.lock().unwrap().is_empty());
    }

    #[test]
    fn last_listener_removal_reports_query() {
        let query = Query::collection("rooms").unwrap();
        let (first, _) = recorder();
        let (second, _) = recorder();
        let mut manager = EventManager::new();
        let a = manager.add_listener(QueryListener::new(query.clone(), ListenOptions::default(), first), None);
        let b = manager.add_listener(QueryListener::new(query.clone(), ListenOptions::default(), second), None);
        assert_eq!(manager.remove_listener(a), None);
        assert_eq!(manager.remove_listener(b), Some(query));
        assert_eq!(manager.listener_count(), 0);
    }

    #[test]
    fn query_error_reaches_every_listener() {
        let query = Query::collection("rooms").unwrap();
        let (observer, events) = recorder();
        let mut manager = EventManager::new();
        manager.add_listener(QueryListener::new(query.clone(), ListenOptions::default(), observer), None);
        manager.on_query_error(&query, crate::firestore::error::permission_denied("denied"));
        assert!(events.lock().unwrap()[0].is_err());
        assert_eq!(manager.listener_count(), 0);
    }
}
