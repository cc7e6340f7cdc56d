use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl ValueKind {
    fn type_order(&self) -> u8 {
        match self {
            ValueKind::Null => 0,
            ValueKind::Boolean(_) => 1,
            ValueKind::Integer(_) | ValueKind::Double(_) => 2,
            ValueKind::Timestamp(_) => 3,
            ValueKind::String(_) => 4,
            ValueKind::Bytes(_) => 5,
            ValueKind::Reference(_) => 6,
            ValueKind::GeoPoint(_) => 7,
            ValueKind::Array(_) => 8,
            ValueKind::Map(_) => 9,
        }
    }
}

impl FirestoreValue {
    pub fn null() -> Self {
        Self {
            kind: ValueKind::Null,
        }
    }

    pub fn from_bool(value: bool) -> Self {
        Self {
            kind: ValueKind::Boolean(value),
        }
    }

    pub fn from_integer(value: i64) -> Self {
        Self {
            kind: ValueKind::Integer(value),
        }
    }

    pub fn from_double(value: f64) -> Self {
        Self {
            kind: ValueKind::Double(value),
        }
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        Self {
            kind: ValueKind::Timestamp(value),
        }
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::String(value.into()),
        }
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        Self {
            kind: ValueKind::Bytes(value),
        }
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        Self {
            kind: ValueKind::Reference(path.into()),
        }
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        Self {
            kind: ValueKind::GeoPoint(value),
        }
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Array(ArrayValue::new(values)),
        }
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            kind: ValueKind::Map(MapValue::new(map)),
        }
    }

    pub fn from_map_value(map: MapValue) -> Self {
        Self {
            kind: ValueKind::Map(map),
        }
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn as_array(&self) -> Option<&[FirestoreValue]> {
        match &self.kind {
            ValueKind::Array(array) => Some(array.values()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub(crate) fn as_map_mut(&mut self) -> Option<&mut MapValue> {
        match &mut self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Total order across all value types, as used by queries.
    pub fn compare(&self, other: &FirestoreValue) -> Ordering {
        let left_order = self.kind.type_order();
        let right_order = other.kind.type_order();
        if left_order != right_order {
            return left_order.cmp(&right_order);
        }

        match (&self.kind, &other.kind) {
            (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
            (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
            (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
            (ValueKind::Integer(l), ValueKind::Double(r)) => compare_doubles(*l as f64, *r),
            (ValueKind::Double(l), ValueKind::Integer(r)) => compare_doubles(*l, *r as f64),
            (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
            (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
            (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
            (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.as_slice().cmp(r.as_slice()),
            (ValueKind::Reference(l), ValueKind::Reference(r)) => l.split('/').cmp(r.split('/')),
            (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => {
                compare_doubles(l.latitude(), r.latitude())
                    .then_with(|| compare_doubles(l.longitude(), r.longitude()))
            }
            (ValueKind::Array(l), ValueKind::Array(r)) => {
                for (left, right) in l.values().iter().zip(r.values()) {
                    match left.compare(right) {
                        Ordering::Equal => continue,
                        non_eq => return non_eq,
                    }
                }
                l.values().len().cmp(&r.values().len())
            }
            (ValueKind::Map(l), ValueKind::Map(r)) => {
                for ((left_key, left), (right_key, right)) in
                    l.fields().iter().zip(r.fields().iter())
                {
                    let ordering = left_key.cmp(right_key).then_with(|| left.compare(right));
                    if ordering != Ordering::Equal {
                        return ordering;
                    }
                }
                l.fields().len().cmp(&r.fields().len())
            }
            _ => Ordering::Equal,
        }
    }

    /// Equality under the query ordering (integer 1 equals double 1.0, NaN equals NaN).
    pub fn query_equals(&self, other: &FirestoreValue) -> bool {
        self.compare(other) == Ordering::Equal
    }

    /// Stable textual form used to build canonical target ids.
    pub fn canonical_string(&self) -> String {
        match &self.kind {
            ValueKind::Null => "null".to_string(),
            ValueKind::Boolean(value) => value.to_string(),
            ValueKind::Integer(value) => value.to_string(),
            ValueKind::Double(value) => format!("{value:?}"),
            ValueKind::Timestamp(value) => format!("time({},{})", value.seconds, value.nanos),
            ValueKind::String(value) => value.clone(),
            ValueKind::Bytes(value) => value.to_base64(),
            ValueKind::Reference(value) => value.clone(),
            ValueKind::GeoPoint(value) => {
                format!("geo({},{})", value.latitude(), value.longitude())
            }
            ValueKind::Array(array) => {
                let parts: Vec<String> = array
                    .values()
                    .iter()
                    .map(FirestoreValue::canonical_string)
                    .collect();
                format!("[{}]", parts.join(","))
            }
            ValueKind::Map(map) => {
                let parts: Vec<String> = map
                    .fields()
                    .iter()
                    .map(|(key, value)| format!("{key}:{}", value.canonical_string()))
                    .collect();
                format!("{{{}}}", parts.join(","))
            }
        }
    }

    /// Rough in-memory footprint used by cache size accounting.
    pub fn approximate_byte_size(&self) -> usize {
        match &self.kind {
            ValueKind::Null | ValueKind::Boolean(_) => 4,
            ValueKind::Integer(_) | ValueKind::Double(_) => 8,
            ValueKind::Timestamp(_) | ValueKind::GeoPoint(_) => 16,
            ValueKind::String(value) => value.len() + 1,
            ValueKind::Bytes(value) => value.as_slice().len(),
            ValueKind::Reference(value) => value.len(),
            ValueKind::Array(array) => array
                .values()
                .iter()
                .map(FirestoreValue::approximate_byte_size)
                .sum(),
            ValueKind::Map(map) => map.approximate_byte_size(),
        }
    }
}

fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_across_types() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(1),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_bytes(BytesValue::new(vec![0])),
            FirestoreValue::from_reference("a/b"),
            FirestoreValue::from_geo_point(GeoPoint::new(0.0, 0.0).unwrap()),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                window[0].compare(&window[1]),
                Ordering::Less,
                "{:?} < {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn integers_and_doubles_compare_numerically() {
        let int = FirestoreValue::from_integer(1);
        let double = FirestoreValue::from_double(1.0);
        assert!(int.query_equals(&double));
        assert_ne!(int, double);
    }

    #[test]
    fn canonical_strings_are_stable() {
        let mut fields = BTreeMap::new();
        fields.insert("b".to_string(), FirestoreValue::from_integer(2));
        fields.insert("a".to_string(), FirestoreValue::from_string("x"));
        let value = FirestoreValue::from_map(fields);
        assert_eq!(value.canonical_string(), "{a:x,b:2}");
        let array = FirestoreValue::from_array(vec![
            FirestoreValue::null(),
            FirestoreValue::from_double(1.5),
        ]);
        assert_eq!(array.canonical_string(), "[null,1.5]");
    }
}
