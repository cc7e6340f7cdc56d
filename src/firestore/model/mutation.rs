use std::collections::BTreeSet;

use crate::firestore::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Server-side transform of a single field, resolved when the write is committed.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    NumericIncrement(FirestoreValue),
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
}

impl TransformOperation {
    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            // Estimated with the local write time until the backend assigns the real value.
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .compute_base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                numeric_add(&base, operand)
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
        }
    }

    fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: Option<FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                server_result.unwrap_or_else(FirestoreValue::null)
            }
        }
    }

    /// Value a non-idempotent transform starts from; `None` for idempotent transforms.
    fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => match previous {
                Some(value) if value.is_number() => Some(value.clone()),
                _ => Some(FirestoreValue::from_integer(0)),
            },
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I: IntoIterator<Item = FieldPath>>(fields: I) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<'a, I: IntoIterator<Item = &'a FieldPath>>(mut self, other: I) -> Self {
        self.fields.extend(other.into_iter().cloned());
        self
    }

    fn to_vec(&self) -> Vec<FieldPath> {
        self.fields.iter().cloned().collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    Set { value: MapValue },
    Patch { value: MapValue, mask: FieldMask },
    Delete,
    Verify,
}

/// A single write against one document.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// Outcome of one mutation as reported by the write stream.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self {
            key,
            kind: MutationKind::Set { value },
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    /// Update of the masked fields. Requires the document to exist, like `update()` does.
    pub fn patch(key: DocumentKey, value: MapValue, mask: FieldMask) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { value, mask },
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self {
            key,
            kind: MutationKind::Verify,
            precondition: Precondition::UpdateTime(version),
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, field_path: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms
            .push(FieldTransform::new(field_path, operation));
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Fields written by a patch; `None` for mutations that replace the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(mask.clone()),
            _ => None,
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self.kind, MutationKind::Patch { .. })
    }

    /// Applies this mutation optimistically to `document`.
    ///
    /// `previous_mask` carries the fields already changed by earlier mutations for the same
    /// document (`None` means the whole document changed). The returned mask includes the
    /// fields touched by this mutation.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let results = self.local_transform_results(document.data(), local_write_time);
                let mut new_data = value.clone();
                self.write_transform_results(&mut new_data, results);
                let version = post_mutation_version(document);
                document
                    .convert_to_found(version, new_data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { value, mask } => {
                let results = self.local_transform_results(document.data(), local_write_time);
                let mut new_data = document.data().clone();
                new_data.apply_mask(value, &mask.to_vec());
                self.write_transform_results(&mut new_data, results);
                let version = document.version();
                document
                    .convert_to_found(version, new_data)
                    .set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous
                        .union_with(mask.fields())
                        .union_with(self.field_transforms.iter().map(FieldTransform::field_path))
                })
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    /// Applies the acknowledged form of this mutation, using server transform results.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationResult) {
        match &self.kind {
            MutationKind::Set { value } => {
                let results =
                    self.server_transform_results(document.data(), &result.transform_results);
                let mut new_data = value.clone();
                self.write_transform_results(&mut new_data, results);
                document
                    .convert_to_found(result.version, new_data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The backend accepted the patch, so the document exists there even though
                    // our cached copy says otherwise.
                    document.convert_to_unknown(result.version);
                    return;
                }
                let results =
                    self.server_transform_results(document.data(), &result.transform_results);
                let mut new_data = document.data().clone();
                new_data.apply_mask(value, &mask.to_vec());
                self.write_transform_results(&mut new_data, results);
                document
                    .convert_to_found(result.version, new_data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Base values for non-idempotent transforms, captured against the local view at write
    /// time.
    pub fn extract_transform_base_value(&self, document: &Document) -> Option<MapValue> {
        let mut base: Option<MapValue> = None;
        for transform in &self.field_transforms {
            let existing = document.field(transform.field_path());
            if let Some(value) = transform.operation().compute_base_value(existing) {
                base.get_or_insert_with(MapValue::empty)
                    .set(transform.field_path(), value);
            }
        }
        base
    }

    fn local_transform_results(
        &self,
        previous_data: &MapValue,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, FirestoreValue)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = previous_data.get(transform.field_path());
                (
                    transform.field_path().clone(),
                    transform
                        .operation()
                        .apply_to_local_view(previous, local_write_time),
                )
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        previous_data: &MapValue,
        server_results: &[FirestoreValue],
    ) -> Vec<(FieldPath, FirestoreValue)> {
        if !server_results.is_empty() && server_results.len() != self.field_transforms.len() {
            log::warn!(
                "server returned {} transform results for {} transforms on {}",
                server_results.len(),
                self.field_transforms.len(),
                self.key
            );
        }
        self.field_transforms
            .iter()
            .enumerate()
            .map(|(index, transform)| {
                let previous = previous_data.get(transform.field_path());
                (
                    transform.field_path().clone(),
                    transform
                        .operation()
                        .apply_to_remote_document(previous, server_results.get(index).cloned()),
                )
            })
            .collect()
    }

    fn write_transform_results(&self, data: &mut MapValue, results: Vec<(FieldPath, FirestoreValue)>) {
        for (path, value) in results {
            data.set(&path, value);
        }
    }
}

/// Mutation capturing the net local effect on `document`, used as its overlay.
///
/// Returns `None` when the document carries no local mutations or the mask is empty.
pub fn calculate_overlay_mutation(document: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let mask = match mask {
        Some(mask) if mask.is_empty() => return None,
        Some(mask) => mask,
        None => {
            let mutation = if document.is_no_document() {
                Mutation::delete(document.key().clone())
            } else {
                Mutation::set(document.key().clone(), document.data().clone())
            };
            return Some(mutation);
        }
    };

    let mut patch_value = MapValue::empty();
    let mut covered = FieldMask::empty();
    for path in mask.fields() {
        if covered.covers(path) {
            continue;
        }
        let mut path = path.clone();
        let mut value = document.field(&path).cloned();
        // A missing nested leaf means its parent changed shape, so patch the parent instead.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = document.field(&parent).cloned();
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value),
            None => patch_value.delete(&path),
        }
        covered.fields.insert(path);
    }

    Some(
        Mutation::patch(document.key().clone(), patch_value, covered)
            .with_precondition(Precondition::None),
    )
}

fn post_mutation_version(document: &Document) -> SnapshotVersion {
    if document.is_found_document() {
        document.version()
    } else {
        SnapshotVersion::min()
    }
}

fn numeric_add(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        (ValueKind::Integer(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + delta)
        }
        (ValueKind::Double(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (ValueKind::Double(current), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        _ => operand.clone(),
    }
}

fn existing_elements(existing: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    existing
        .and_then(FirestoreValue::as_array)
        .map(|values| values.to_vec())
        .unwrap_or_default()
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing_elements(existing);
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing_elements(existing)
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();
    FirestoreValue::from_array(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/a").unwrap()
    }

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn data(entries: &[(&str, FirestoreValue)]) -> MapValue {
        let mut map = MapValue::empty();
        for (field, value) in entries {
            map.set(&path(field), value.clone());
        }
        map
    }

    #[test]
    fn set_replaces_document_and_marks_local_mutations() {
        let mut doc = Document::new_found(
            key(),
            version(1),
            data(&[("old", FirestoreValue::from_integer(1))]),
        );
        let mutation = Mutation::set(key(), data(&[("new", FirestoreValue::from_bool(true))]));
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert!(mask.is_none());
        assert!(doc.has_local_mutations());
        assert!(doc.field(&path("old")).is_none());
        assert_eq!(doc.version(), version(1));
    }

    #[test]
    fn patch_requires_existing_document() {
        let mut doc = Document::new_no_document(key(), version(1));
        let mutation = Mutation::patch(
            key(),
            data(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new(vec![path("a")]),
        );
        let mask = mutation.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        assert_eq!(mask, Some(FieldMask::empty()));
        assert!(doc.is_no_document());
        assert!(!doc.has_local_mutations());
    }

    #[test]
    fn increment_uses_local_value_and_saturates() {
        let mut doc = Document::new_found(
            key(),
            version(1),
            data(&[("count", FirestoreValue::from_integer(i64::MAX - 1))]),
        );
        let mutation = Mutation::patch(key(), MapValue::empty(), FieldMask::empty()).with_transform(
            path("count"),
            TransformOperation::NumericIncrement(FirestoreValue::from_integer(5)),
        );
        let mask = mutation
            .apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now())
            .unwrap();
        assert!(mask.covers(&path("count")));
        assert_eq!(
            doc.field(&path("count")),
            Some(&FirestoreValue::from_integer(i64::MAX))
        );
    }

    #[test]
    fn acknowledged_transforms_use_server_results() {
        let mut doc = Document::new_found(key(), version(1), MapValue::empty());
        let server_time = Timestamp::new(99, 0);
        let mutation = Mutation::set(key(), MapValue::empty())
            .with_transform(path("at"), TransformOperation::ServerTimestamp)
            .with_transform(
                path("tags"),
                TransformOperation::ArrayUnion(vec![FirestoreValue::from_string("x")]),
            );
        let result = MutationResult::new(
            version(2),
            vec![FirestoreValue::from_timestamp(server_time), FirestoreValue::null()],
        );
        mutation.apply_to_remote_document(&mut doc, &result);
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.version(), version(2));
        assert_eq!(
            doc.field(&path("at")),
            Some(&FirestoreValue::from_timestamp(server_time))
        );
        assert_eq!(
            doc.field(&path("tags")),
            Some(&FirestoreValue::from_array(vec![FirestoreValue::from_string("x")]))
        );
    }

    #[test]
    fn acknowledged_patch_on_missing_document_becomes_unknown() {
        let mut doc = Document::new_invalid(key());
        let mutation = Mutation::patch(
            key(),
            data(&[("a", FirestoreValue::from_integer(1))]),
            FieldMask::new(vec![path("a")]),
        );
        mutation.apply_to_remote_document(&mut doc, &MutationResult::new(version(4), vec![]));
        assert!(doc.is_unknown_document());
        assert_eq!(doc.version(), version(4));
    }

    #[test]
    fn overlay_of_patch_only_carries_masked_fields() {
        let mut doc = Document::new_found(
            key(),
            version(1),
            data(&[
                ("a", FirestoreValue::from_integer(1)),
                ("b", FirestoreValue::from_integer(2)),
            ]),
        );
        let patch = Mutation::patch(
            key(),
            data(&[("b", FirestoreValue::from_integer(3))]),
            FieldMask::new(vec![path("b"), path("c")]),
        );
        let mask = patch.apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        match overlay.kind() {
            MutationKind::Patch { value, mask } => {
                assert_eq!(value.get(&path("b")), Some(&FirestoreValue::from_integer(3)));
                assert!(value.get(&path("a")).is_none());
                assert!(mask.covers(&path("c")));
            }
            other => panic!("unexpected overlay {other:?}"),
        }
        assert!(overlay.precondition().is_none());
    }

    #[test]
    fn overlay_of_delete_is_delete() {
        let mut doc = Document::new_found(key(), version(1), MapValue::empty());
        let mask = Mutation::delete(key()).apply_to_local_view(&mut doc, Some(FieldMask::empty()), Timestamp::now());
        let overlay = calculate_overlay_mutation(&doc, mask.as_ref()).unwrap();
        assert_eq!(overlay.kind(), &MutationKind::Delete);
    }
}
