use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::value::BytesValue;

/// One decoded message from the listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    DocumentChange(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetChangeState {
    NoChange,
    Add,
    Remove,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: TargetChangeState,
    /// Empty means the change applies to every target on the stream.
    pub target_ids: Vec<TargetId>,
    pub resume_token: BytesValue,
    /// Only meaningful for a global `NoChange` marking a consistent snapshot.
    pub read_time: SnapshotVersion,
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: TargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: BytesValue::empty(),
            read_time: SnapshotVersion::min(),
            cause: None,
        }
    }
}

/// Covers `documentChange`, `documentDelete` and `documentRemove`.
///
/// `new_document` is a found document for changes, a no-document tombstone for deletes and
/// `None` when the document merely left some targets.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_document: Option<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub filter: ExistenceFilter,
}

/// Server-side count of a target's documents, optionally with a bloom filter over the
/// names of the documents that did not change.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<BloomFilterSpec>,
}

/// Raw bloom filter as sent on the wire; validated when it is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct BloomFilterSpec {
    pub bitmap: BytesValue,
    pub padding: i32,
    pub hash_count: i32,
}

#[derive(Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

/// Decodes a `ListenResponse`. Returns `Ok(None)` for payloads carrying no known change.
pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(change) = value.get("targetChange") {
        return decode_target_change(serializer, change).map(Some);
    }
    if let Some(change) = value.get("documentChange") {
        return decode_document_change(serializer, change).map(Some);
    }
    if let Some(change) = value.get("documentDelete") {
        return decode_document_delete(serializer, change).map(Some);
    }
    if let Some(change) = value.get("documentRemove") {
        return decode_document_remove(serializer, change).map(Some);
    }
    if let Some(change) = value.get("filter") {
        return decode_filter_change(change).map(Some);
    }
    Ok(None)
}

fn decode_target_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let state = value
        .get("targetChangeType")
        .and_then(JsonValue::as_str)
        .map(target_state_from_str)
        .unwrap_or(TargetChangeState::NoChange);
    let target_ids = numeric_array(value.get("targetIds"));
    let resume_token = decode_bytes(value.get("resumeToken"))?;
    let read_time = optional_version(serializer, value.get("readTime"))?;
    let cause = value
        .get("cause")
        .cloned()
        .map(serde_json::from_value::<StatusCause>)
        .transpose()
        .map_err(|err| invalid_argument(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| {
            FirestoreError::new(
                FirestoreErrorCode::from_grpc_code(cause.code),
                cause.message.unwrap_or_else(|| "watch target error".to_string()),
            )
        });

    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids,
        resume_token,
        read_time,
        cause,
    }))
}

fn decode_document_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_document(document)?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        new_document: Some(document),
    }))
}

fn decode_document_delete(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_name(serializer, value, "documentDelete")?;
    let read_time = optional_version(serializer, value.get("readTime"))?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_document: Some(Document::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<WatchChange> {
    let key = document_name(serializer, value, "documentRemove")?;
    Ok(WatchChange::DocumentChange(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_document: None,
    }))
}

fn decode_filter_change(value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = value
        .get("unchangedNames")
        .map(decode_bloom_filter_spec)
        .transpose()?;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        filter: ExistenceFilter {
            count,
            unchanged_names,
        },
    }))
}

fn decode_bloom_filter_spec(value: &JsonValue) -> FirestoreResult<BloomFilterSpec> {
    let bits = value.get("bits");
    Ok(BloomFilterSpec {
        bitmap: decode_bytes(bits.and_then(|bits| bits.get("bitmap")))?,
        padding: bits
            .and_then(|bits| bits.get("padding"))
            .and_then(JsonValue::as_i64)
            .unwrap_or(0) as i32,
        hash_count: value
            .get("hashCount")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0) as i32,
    })
}

fn document_name(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
    context: &str,
) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{context} missing document")))?;
    serializer.document_key_from_name(name)
}

fn optional_version(
    serializer: &JsonProtoSerializer,
    value: Option<&JsonValue>,
) -> FirestoreResult<SnapshotVersion> {
    match value.and_then(JsonValue::as_str) {
        Some(timestamp) => serializer.decode_version(timestamp),
        None => Ok(SnapshotVersion::min()),
    }
}

fn decode_bytes(value: Option<&JsonValue>) -> FirestoreResult<BytesValue> {
    match value.and_then(JsonValue::as_str) {
        Some(encoded) => BytesValue::from_base64(encoded)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}"))),
        None => Ok(BytesValue::empty()),
    }
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn target_state_from_str(value: &str) -> TargetChangeState {
    match value {
        "ADD" => TargetChangeState::Add,
        "REMOVE" => TargetChangeState::Remove,
        "CURRENT" => TargetChangeState::Current,
        "RESET" => TargetChangeState::Reset,
        _ => TargetChangeState::NoChange,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, Timestamp};
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("project", "(default)"))
    }

    #[test]
    fn decodes_target_change() {
        let change = json!({
            "targetChange": {
                "targetIds": [2, 4],
                "resumeToken": BytesValue::new(vec![1, 2, 3]).to_base64(),
                "targetChangeType": "CURRENT"
            }
        });

        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        match decoded {
            WatchChange::TargetChange(change) => {
                assert_eq!(change.target_ids, vec![2, 4]);
                assert_eq!(change.resume_token.as_slice(), &[1, 2, 3]);
                assert_eq!(change.state, TargetChangeState::Current);
                assert!(change.cause.is_none());
            }
            other => panic!("unexpected change: {other:?}"),
        }
    }

    #[test]
    fn decodes_removal_cause() {
        let change = json!({
            "targetChange": {
                "targetIds": [2],
                "targetChangeType": "REMOVE",
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        let WatchChange::TargetChange(change) = decoded else {
            panic!("expected target change");
        };
        let cause = change.cause.unwrap();
        assert_eq!(cause.code, FirestoreErrorCode::PermissionDenied);
        assert_eq!(cause.message(), "denied");
    }

    #[test]
    fn document_delete_becomes_tombstone() {
        let change = json!({
            "documentDelete": {
                "document": "projects/project/databases/(default)/documents/rooms/a",
                "removedTargetIds": [2],
                "readTime": "1970-01-01T00:00:05Z"
            }
        });
        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        let WatchChange::DocumentChange(change) = decoded else {
            panic!("expected document change");
        };
        let document = change.new_document.unwrap();
        assert!(document.is_no_document());
        assert_eq!(document.version(), SnapshotVersion::new(Timestamp::new(5, 0)));
        assert_eq!(change.removed_target_ids, vec![2]);
    }

    #[test]
    fn decodes_existence_filter_with_bloom_filter() {
        let change = json!({
            "filter": {
                "targetId": 2,
                "count": 3,
                "unchangedNames": {
                    "bits": { "bitmap": BytesValue::new(vec![0xff]).to_base64(), "padding": 1 },
                    "hashCount": 2
                }
            }
        });
        let decoded = decode_watch_change(&serializer(), &change).unwrap().unwrap();
        let WatchChange::ExistenceFilter(change) = decoded else {
            panic!("expected existence filter");
        };
        assert_eq!(change.target_id, 2);
        assert_eq!(change.filter.count, 3);
        let bloom = change.filter.unchanged_names.unwrap();
        assert_eq!(bloom.padding, 1);
        assert_eq!(bloom.hash_count, 2);
    }

    #[test]
    fn unknown_payload_is_ignored() {
        assert!(decode_watch_change(&serializer(), &json!({ "heartbeat": {} }))
            .unwrap()
            .is_none());
    }
}
