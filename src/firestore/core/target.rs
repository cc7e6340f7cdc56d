use std::hash::{Hash, Hasher};

use crate::firestore::core::filter::FieldFilter;
use crate::firestore::core::query::{Bound, OrderBy};
use crate::firestore::model::{DocumentKey, ResourcePath};

/// The part of a query the backend watches. Two queries that differ only in limit type
/// (`limit` vs `limit_to_last`) can share a target.
#[derive(Clone, Debug)]
pub struct Target {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    order_by: Vec<OrderBy>,
    limit: Option<u32>,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
    canonical_id: String,
}

impl Target {
    pub(crate) fn new(
        path: ResourcePath,
        collection_group: Option<String>,
        filters: Vec<FieldFilter>,
        order_by: Vec<OrderBy>,
        limit: Option<u32>,
        start_at: Option<Bound>,
        end_at: Option<Bound>,
    ) -> Self {
        let mut target = Self {
            path,
            collection_group,
            filters,
            order_by,
            limit,
            start_at,
            end_at,
            canonical_id: String::new(),
        };
        target.canonical_id = target.compute_canonical_id();
        target
    }

    /// Target watching a single document.
    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone(), None, Vec::new(), Vec::new(), None, None, None)
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn start_at(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_at(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn canonical_id(&self) -> &str {
        &self.canonical_id
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_path(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    fn compute_canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(
            &self
                .filters
                .iter()
                .map(FieldFilter::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        id.push_str("|ob:");
        id.push_str(
            &self
                .order_by
                .iter()
                .map(OrderBy::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(limit) = self.limit {
            id.push_str(&format!("|l:{limit}"));
        }
        if let Some(bound) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if bound.inclusive { "b:" } else { "a:" });
            id.push_str(&bound.canonical_position());
        }
        if let Some(bound) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if bound.inclusive { "a:" } else { "b:" });
            id.push_str(&bound.canonical_position());
        }
        id
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id == other.canonical_id
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical_id.hash(state);
    }
}
