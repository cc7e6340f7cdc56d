use std::collections::BTreeMap;

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Field tree of a document (or of a nested map value).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value stored at `path`, descending through nested maps.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_map()?.fields.get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing non-map intermediates with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Applies `data` at every path of `mask`; paths missing from `data` are deleted.
    pub fn apply_mask(&mut self, data: &MapValue, mask: &[FieldPath]) {
        for path in mask {
            match data.get(path) {
                Some(value) => self.set(path, value.clone()),
                None => self.delete(path),
            }
        }
    }

    /// Leaf paths of the tree. Empty nested maps count as leaves.
    pub fn leaf_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        paths
    }

    pub fn approximate_byte_size(&self) -> usize {
        self.fields
            .iter()
            .map(|(key, value)| key.len() + value.approximate_byte_size())
            .sum()
    }
}

impl From<BTreeMap<String, FirestoreValue>> for MapValue {
    fn from(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self::new(fields)
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| FirestoreValue::from_map_value(MapValue::empty()));
    if entry.as_map().is_none() {
        *entry = FirestoreValue::from_map_value(MapValue::empty());
    }
    if let Some(child) = entry.as_map_mut() {
        set_at_segments(&mut child.fields, rest, value);
    }
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    if let Some(child) = fields.get_mut(first).and_then(FirestoreValue::as_map_mut) {
        delete_at_segments(&mut child.fields, rest);
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        prefix.push(key.clone());
        match value.kind() {
            ValueKind::Map(map) if !map.is_empty() => collect_leaf_paths(&map.fields, prefix, out),
            _ => {
                if let Ok(path) = FieldPath::new(prefix.clone()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn sets_and_reads_nested_fields() {
        let mut map = MapValue::empty();
        map.set(&path("a.b.c"), FirestoreValue::from_integer(1));
        map.set(&path("a.d"), FirestoreValue::from_string("x"));
        assert_eq!(
            map.get(&path("a.b.c")),
            Some(&FirestoreValue::from_integer(1))
        );
        assert_eq!(map.leaf_paths(), vec![path("a.b.c"), path("a.d")]);
    }

    #[test]
    fn overwrites_scalar_intermediates() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from_integer(1));
        map.set(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(map.get(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn mask_application_deletes_missing_paths() {
        let mut target = MapValue::empty();
        target.set(&path("keep"), FirestoreValue::from_integer(1));
        target.set(&path("drop"), FirestoreValue::from_integer(2));
        let mut data = MapValue::empty();
        data.set(&path("added"), FirestoreValue::from_bool(true));
        target.apply_mask(&data, &[path("drop"), path("added")]);
        assert!(target.get(&path("drop")).is_none());
        assert!(target.get(&path("keep")).is_some());
        assert_eq!(
            target.get(&path("added")),
            Some(&FirestoreValue::from_bool(true))
        );
    }
}
