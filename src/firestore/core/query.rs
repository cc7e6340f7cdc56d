use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::core::filter::{key_from_reference, FieldFilter};
use crate::firestore::core::target::Target;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        }
    }

    fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub(crate) fn canonical_id(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.direction.as_str())
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let ordering = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => l.compare(r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            Direction::Ascending => ordering,
            Direction::Descending => ordering.reverse(),
        }
    }
}

/// Cursor position over the normalised order-by fields.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    /// Whether a document exactly at `position` is part of the result.
    pub inclusive: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self {
            position,
            inclusive,
        }
    }

    pub(crate) fn canonical_position(&self) -> String {
        self.position
            .iter()
            .map(FirestoreValue::canonical_string)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Compares the bound position with `document` under `order_by`.
    fn compare_to_document(&self, order_by: &[OrderBy], document: &Document) -> Ordering {
        for (component, order) in self.position.iter().zip(order_by) {
            let ordering = if order.field.is_key_field() {
                match key_from_reference(component) {
                    Some(key) => key.cmp(document.key()),
                    None => Ordering::Equal,
                }
            } else {
                match document.field(&order.field) {
                    Some(value) => component.compare(value),
                    None => Ordering::Greater,
                }
            };
            let ordering = match order.direction {
                Direction::Ascending => ordering,
                Direction::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    fn sorts_before_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    fn sorts_after_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

/// A query over a collection, a collection group, or a single document.
#[derive(Clone, Debug)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    /// Query over the immediate children of `path` (or the document at `path` when it has an
    /// even number of segments).
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection(path: &str) -> FirestoreResult<Self> {
        let path = ResourcePath::from_string(path)?;
        if DocumentKey::is_document_path(&path) {
            return Err(invalid_argument(format!(
                "Invalid collection path '{path}': must have an odd number of segments"
            )));
        }
        Ok(Self::new(path))
    }

    /// Query over every collection named `collection_id`, at any depth.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::new(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: FieldPath, direction: Direction) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_path(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// True when the query returns every document of its collection unfiltered.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    /// Order used for results: explicit orderings, then any inequality fields not yet
    /// ordered, then the document key in the direction of the last ordering.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut result = self.explicit_order_by.clone();
        let last_direction = self
            .explicit_order_by
            .last()
            .map(|order| order.direction)
            .unwrap_or(Direction::Ascending);

        let ordered: BTreeSet<FieldPath> = result.iter().map(|order| order.field.clone()).collect();
        let inequality_fields: BTreeSet<FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.is_inequality() && !filter.field().is_key_field())
            .map(|filter| filter.field().clone())
            .collect();
        for field in inequality_fields {
            if !ordered.contains(&field) {
                result.push(OrderBy::new(field, last_direction));
            }
        }

        if !result.iter().any(|order| order.field.is_key_field()) {
            result.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        result
    }

    pub fn comparator(&self) -> DocumentComparator {
        DocumentComparator {
            order_by: self.normalized_order_by(),
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let path = key.path();
        if let Some(group) = &self.collection_group {
            key.collection_group() == group && self.path.is_prefix_of(path)
        } else if DocumentKey::is_document_path(&self.path) {
            &self.path == path
        } else {
            self.path.is_immediate_parent_of(path)
        }
    }

    fn matches_order_by(&self, document: &Document) -> bool {
        self.normalized_order_by()
            .iter()
            .all(|order| order.field.is_key_field() || document.field(&order.field).is_some())
    }

    fn matches_bounds(&self, document: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(bound) = &self.start_at {
            if !bound.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(bound) = &self.end_at {
            if !bound.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Backend target for this query. `limit_to_last` queries are sent with every ordering
    /// flipped and their cursors swapped.
    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by
                    .into_iter()
                    .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                    .collect(),
                self.limit,
                self.end_at.clone(),
                self.start_at.clone(),
            ),
        }
    }

    pub fn canonical_id(&self) -> String {
        let limit_type = match self.limit_type {
            LimitType::First => "f",
            LimitType::Last => "l",
        };
        format!("{}|lt:{limit_type}", self.to_target().canonical_id())
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Query {}

/// Total order over documents for one query: the normalised order-by fields with the
/// document key as final tie-break.
#[derive(Clone, Debug)]
pub struct DocumentComparator {
    order_by: Vec<OrderBy>,
}

impl DocumentComparator {
    /// Orders purely by key; used for document sets outside any query.
    pub fn by_key() -> Self {
        Self {
            order_by: vec![OrderBy::new(FieldPath::document_id(), Direction::Ascending)],
        }
    }

    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        for order in &self.order_by {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        left.key().cmp(right.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::Operator;
    use crate::firestore::model::{SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    fn doc(path: &str, n: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(&field("n"), FirestoreValue::from_integer(n));
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    #[test]
    fn collection_query_matches_only_direct_children() {
        let query = Query::collection("rooms").unwrap();
        assert!(query.matches(&doc("rooms/a", 1)));
        assert!(!query.matches(&doc("rooms/a/messages/m", 1)));
        assert!(!query.matches(&doc("halls/a", 1)));
    }

    #[test]
    fn collection_group_matches_any_depth() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/a/messages/m", 1)));
        assert!(!query.matches(&doc("rooms/a", 1)));
    }

    #[test]
    fn normalized_order_appends_inequality_and_key() {
        let query = Query::collection("rooms").unwrap().with_filter(
            FieldFilter::new(field("n"), Operator::GreaterThan, FirestoreValue::from_integer(1)).unwrap(),
        );
        let order = query.normalized_order_by();
        assert_eq!(order.len(), 2);
        assert_eq!(order[0].field, field("n"));
        assert!(order[1].field.is_key_field());
    }

    #[test]
    fn ties_are_broken_by_key() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by(field("n"), Direction::Descending);
        let comparator = query.comparator();
        assert_eq!(comparator.compare(&doc("rooms/a", 2), &doc("rooms/b", 1)), Ordering::Less);
        // Key tie-break follows the direction of the last explicit ordering.
        assert_eq!(comparator.compare(&doc("rooms/a", 1), &doc("rooms/b", 1)), Ordering::Greater);
    }

    #[test]
    fn cursors_restrict_matches() {
        let query = Query::collection("rooms")
            .unwrap()
            .order_by(field("n"), Direction::Ascending)
            .start_at(Bound::new(vec![FirestoreValue::from_integer(2)], false))
            .end_at(Bound::new(vec![FirestoreValue::from_integer(4)], true));
        assert!(!query.matches(&doc("rooms/a", 2)));
        assert!(query.matches(&doc("rooms/b", 3)));
        assert!(query.matches(&doc("rooms/c", 4)));
        assert!(!query.matches(&doc("rooms/d", 5)));
    }

    #[test]
    fn limit_to_last_flips_target_ordering() {
        let first = Query::collection("rooms")
            .unwrap()
            .order_by(field("n"), Direction::Ascending)
            .limit_to_first(2);
        let last = Query::collection("rooms")
            .unwrap()
            .order_by(field("n"), Direction::Ascending)
            .limit_to_last(2);
        assert_ne!(first.to_target(), last.to_target());
        assert_eq!(last.to_target().order_by()[0].direction, Direction::Descending);
        assert_ne!(first, last);
    }
}
