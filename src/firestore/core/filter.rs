use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, FieldPath};
use crate::firestore::value::{FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::ArrayContainsAny => "array-contains-any",
            Operator::In => "in",
            Operator::NotIn => "not-in",
        }
    }

    /// Name used by the wire protocol's `fieldFilter.op`.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Operator::LessThan => "LESS_THAN",
            Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Operator::Equal => "EQUAL",
            Operator::NotEqual => "NOT_EQUAL",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Operator::ArrayContains => "ARRAY_CONTAINS",
            Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::NotEqual
                | Operator::NotIn
        )
    }

    fn takes_array_operand(&self) -> bool {
        matches!(
            self,
            Operator::In | Operator::NotIn | Operator::ArrayContainsAny
        )
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single `field op value` predicate. Filters on `__name__` take reference values holding
/// the document's relative path.
#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    field: FieldPath,
    op: Operator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> FirestoreResult<Self> {
        if op.takes_array_operand() && value.as_array().is_none() {
            return Err(invalid_argument(format!(
                "Invalid query. A non-empty array is required for '{op}' filters."
            )));
        }
        if field.is_key_field()
            && !op.takes_array_operand()
            && !matches!(value.kind(), ValueKind::Reference(_))
        {
            return Err(invalid_argument(
                "Invalid query. Filters on the document id must use reference values.",
            ));
        }
        Ok(Self { field, op, value })
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn op(&self) -> Operator {
        self.op
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            self.value.canonical_string()
        )
    }

    pub fn matches(&self, document: &Document) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(document.key());
        }

        let other = document.field(&self.field);
        match self.op {
            Operator::NotEqual => match other {
                Some(other) if !other.is_null() => self.matches_comparison(other.compare(&self.value)),
                _ => false,
            },
            Operator::ArrayContains => other
                .and_then(FirestoreValue::as_array)
                .map(|values| values.iter().any(|candidate| candidate.query_equals(&self.value)))
                .unwrap_or(false),
            Operator::ArrayContainsAny => {
                let (Some(values), Some(needles)) =
                    (other.and_then(FirestoreValue::as_array), self.value.as_array())
                else {
                    return false;
                };
                needles
                    .iter()
                    .any(|needle| values.iter().any(|candidate| candidate.query_equals(needle)))
            }
            Operator::In => match (other, self.value.as_array()) {
                (Some(other), Some(options)) => options.iter().any(|option| option.query_equals(other)),
                _ => false,
            },
            Operator::NotIn => {
                let Some(options) = self.value.as_array() else {
                    return false;
                };
                if options.iter().any(FirestoreValue::is_null) {
                    return false;
                }
                match other {
                    Some(other) if !other.is_null() => {
                        !options.iter().any(|option| option.query_equals(other))
                    }
                    _ => false,
                }
            }
            _ => match other {
                Some(other) if same_type_order(other, &self.value) => {
                    self.matches_comparison(other.compare(&self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            Operator::In | Operator::NotIn => {
                let contained = self
                    .value
                    .as_array()
                    .map(|options| {
                        options
                            .iter()
                            .filter_map(key_from_reference)
                            .any(|candidate| &candidate == key)
                    })
                    .unwrap_or(false);
                (self.op == Operator::In) == contained
            }
            _ => match key_from_reference(&self.value) {
                Some(bound) => self.matches_comparison(key.cmp(&bound)),
                None => false,
            },
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.op {
            Operator::LessThan => ordering == Ordering::Less,
            Operator::LessThanOrEqual => ordering != Ordering::Greater,
            Operator::Equal => ordering == Ordering::Equal,
            Operator::NotEqual => ordering != Ordering::Equal,
            Operator::GreaterThan => ordering == Ordering::Greater,
            Operator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }
}

/// Parses a reference value holding a relative document path.
pub(crate) fn key_from_reference(value: &FirestoreValue) -> Option<DocumentKey> {
    match value.kind() {
        ValueKind::Reference(path) => DocumentKey::from_string(path).ok(),
        _ => None,
    }
}

fn same_type_order(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    // Numbers compare across integer/double; every other kind only with itself.
    left.is_number() && right.is_number()
        || std::mem::discriminant(left.kind()) == std::mem::discriminant(right.kind())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{SnapshotVersion, Timestamp};
    use crate::firestore::value::MapValue;

    fn doc(path: &str, entries: &[(&str, FirestoreValue)]) -> Document {
        let mut data = MapValue::empty();
        for (field, value) in entries {
            data.set(&FieldPath::from_dot_separated(field).unwrap(), value.clone());
        }
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn filter(field: &str, op: Operator, value: FirestoreValue) -> FieldFilter {
        FieldFilter::new(FieldPath::from_dot_separated(field).unwrap(), op, value).unwrap()
    }

    #[test]
    fn comparisons_require_matching_types() {
        let document = doc("rooms/a", &[("n", FirestoreValue::from_integer(5))]);
        assert!(filter("n", Operator::GreaterThan, FirestoreValue::from_double(4.5)).matches(&document));
        assert!(!filter("n", Operator::GreaterThan, FirestoreValue::from_string("a")).matches(&document));
        assert!(!filter("missing", Operator::LessThan, FirestoreValue::from_integer(9)).matches(&document));
    }

    #[test]
    fn not_equal_skips_missing_and_null_fields() {
        let with_null = doc("rooms/a", &[("n", FirestoreValue::null())]);
        let with_value = doc("rooms/b", &[("n", FirestoreValue::from_integer(2))]);
        let missing = doc("rooms/c", &[]);
        let not_one = filter("n", Operator::NotEqual, FirestoreValue::from_integer(1));
        assert!(!not_one.matches(&with_null));
        assert!(not_one.matches(&with_value));
        assert!(!not_one.matches(&missing));
    }

    #[test]
    fn array_operators() {
        let document = doc(
            "rooms/a",
            &[(
                "tags",
                FirestoreValue::from_array(vec![
                    FirestoreValue::from_string("x"),
                    FirestoreValue::from_string("y"),
                ]),
            )],
        );
        assert!(filter("tags", Operator::ArrayContains, FirestoreValue::from_string("y")).matches(&document));
        assert!(filter(
            "tags",
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec![FirestoreValue::from_string("z"), FirestoreValue::from_string("x")])
        )
        .matches(&document));
        let in_filter = filter(
            "n",
            Operator::In,
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]),
        );
        assert!(in_filter.matches(&doc("rooms/b", &[("n", FirestoreValue::from_double(1.0))])));
        let not_in_with_null = filter(
            "n",
            Operator::NotIn,
            FirestoreValue::from_array(vec![FirestoreValue::null()]),
        );
        assert!(!not_in_with_null.matches(&doc("rooms/b", &[("n", FirestoreValue::from_integer(3))])));
    }

    #[test]
    fn key_filters_compare_document_keys() {
        let document = doc("rooms/b", &[]);
        let after_a = FieldFilter::new(
            FieldPath::document_id(),
            Operator::GreaterThan,
            FirestoreValue::from_reference("rooms/a"),
        )
        .unwrap();
        assert!(after_a.matches(&document));
        assert!(FieldFilter::new(
            FieldPath::document_id(),
            Operator::Equal,
            FirestoreValue::from_string("rooms/a")
        )
        .is_err());
    }

    #[test]
    fn array_operators_reject_scalar_operands() {
        assert!(FieldFilter::new(
            FieldPath::from_dot_separated("n").unwrap(),
            Operator::In,
            FirestoreValue::from_integer(1)
        )
        .is_err());
    }
}
