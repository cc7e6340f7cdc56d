use std::collections::BTreeMap;
use std::str::FromStr;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::{Bound, FieldFilter, Operator, Target};
use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldPath, FieldTransform, GeoPoint, Mutation, MutationKind,
    MutationResult, Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::remote::messages::{ListenRequest, WriteRequest, WriteResponse};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

/// Converts between model types and the JSON form of the Firestore protos.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        self.database_id.database_name()
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    /// Parses `projects/{p}/databases/{d}/documents/{path}` for this database.
    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let prefix = format!("{}/documents/", self.database_name());
        let path = name.strip_prefix(&prefix).ok_or_else(|| {
            invalid_argument(format!(
                "Document name '{name}' does not belong to {}",
                self.database_name()
            ))
        })?;
        DocumentKey::from_string(path)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn decode_map_value(&self, value: &JsonValue) -> FirestoreResult<MapValue> {
        decode_map_value(value)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        version.timestamp().to_rfc3339()
    }

    pub fn decode_version(&self, value: &str) -> FirestoreResult<SnapshotVersion> {
        Timestamp::parse_rfc3339(value).map(SnapshotVersion::new)
    }

    /// Found documents only; the backend never sends fields for a missing document.
    pub fn encode_document(&self, document: &Document) -> JsonValue {
        let mut encoded = serde_json::Map::new();
        encoded.insert("name".into(), json!(self.document_name(document.key())));
        encoded.insert("fields".into(), encode_map_fields(document.data()));
        encoded.insert("updateTime".into(), json!(self.encode_version(document.version())));
        if !document.create_time().is_min() {
            encoded.insert(
                "createTime".into(),
                json!(self.encode_version(document.create_time())),
            );
        }
        JsonValue::Object(encoded)
    }

    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let version = match value.get("updateTime").and_then(JsonValue::as_str) {
            Some(update_time) => self.decode_version(update_time)?,
            None => return Err(invalid_argument(format!("Document '{name}' missing updateTime"))),
        };
        let data = decode_map_value(value)?;
        let mut document = Document::new_found(key, version, data);
        if let Some(create_time) = value.get("createTime").and_then(JsonValue::as_str) {
            document.set_create_time(self.decode_version(create_time)?);
        }
        Ok(document)
    }

    pub fn encode_listen_request(&self, request: &ListenRequest) -> JsonValue {
        match request {
            ListenRequest::AddTarget(target_data) => {
                let mut encoded = serde_json::Map::new();
                encoded.insert("database".into(), json!(self.database_name()));
                encoded.insert("addTarget".into(), self.encode_target(target_data));
                if let Some(tag) = target_data.purpose.listen_tag() {
                    encoded.insert("labels".into(), json!({ "goog-listen-tags": tag }));
                }
                JsonValue::Object(encoded)
            }
            ListenRequest::RemoveTarget(target_id) => json!({
                "database": self.database_name(),
                "removeTarget": target_id,
            }),
        }
    }

    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = serde_json::Map::new();
        if target.is_document_target() {
            encoded.insert(
                "documents".into(),
                json!({ "documents": [self.resource_name(target.path())] }),
            );
        } else {
            encoded.insert("query".into(), self.encode_query_target(target));
        }
        encoded.insert("targetId".into(), json!(target_data.target_id));

        if !target_data.resume_token.is_empty() {
            encoded.insert("resumeToken".into(), json!(target_data.resume_token.to_base64()));
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert(
                "readTime".into(),
                json!(self.encode_version(target_data.snapshot_version)),
            );
        }
        if let Some(expected_count) = target_data.expected_count {
            encoded.insert("expectedCount".into(), json!(expected_count));
        }
        JsonValue::Object(encoded)
    }

    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let (parent, collection_id, all_descendants) = match target.collection_group() {
            Some(group) => (target.path().clone(), group.to_string(), true),
            None => {
                let collection_id = target.path().last_segment().unwrap_or_default().to_string();
                (target.path().without_last(), collection_id, false)
            }
        };

        let mut query = serde_json::Map::new();
        query.insert(
            "from".into(),
            json!([{ "collectionId": collection_id, "allDescendants": all_descendants }]),
        );
        if let Some(filter) = self.encode_filters(target.filters()) {
            query.insert("where".into(), filter);
        }
        if !target.order_by().is_empty() {
            let orders: Vec<JsonValue> = target
                .order_by()
                .iter()
                .map(|order| {
                    json!({
                        "field": { "fieldPath": order.field.canonical_string() },
                        "direction": order.direction.wire_name(),
                    })
                })
                .collect();
            query.insert("orderBy".into(), JsonValue::Array(orders));
        }
        if let Some(limit) = target.limit() {
            query.insert("limit".into(), json!(limit));
        }
        if let Some(start) = target.start_at() {
            query.insert("startAt".into(), self.encode_cursor(start, start.inclusive));
        }
        if let Some(end) = target.end_at() {
            query.insert("endAt".into(), self.encode_cursor(end, !end.inclusive));
        }

        json!({
            "parent": self.resource_name(&parent),
            "structuredQuery": JsonValue::Object(query),
        })
    }

    pub fn encode_write_request(&self, request: &WriteRequest) -> JsonValue {
        match request {
            WriteRequest::Handshake => json!({ "database": self.database_name() }),
            WriteRequest::Mutations { stream_token, batch } => {
                let writes: Vec<JsonValue> = batch
                    .mutations
                    .iter()
                    .map(|mutation| self.encode_mutation(mutation))
                    .collect();
                json!({
                    "streamToken": stream_token.to_base64(),
                    "writes": writes,
                })
            }
        }
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let name = self.document_name(mutation.key());
        let mut write = serde_json::Map::new();
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert("update".into(), json!({ "name": name, "fields": encode_map_fields(value) }));
            }
            MutationKind::Patch { value, mask } => {
                write.insert("update".into(), json!({ "name": name, "fields": encode_map_fields(value) }));
                let paths: Vec<String> = mask.fields().map(FieldPath::canonical_string).collect();
                write.insert("updateMask".into(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".into(), json!(name));
            }
            MutationKind::Verify => {
                write.insert("verify".into(), json!(name));
            }
        }
        if !mutation.field_transforms().is_empty() {
            write.insert(
                "updateTransforms".into(),
                JsonValue::Array(self.encode_field_transforms(mutation.field_transforms())),
            );
        }
        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".into(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".into(),
                    json!({ "updateTime": self.encode_version(*version) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    /// Results without an `updateTime` were no-ops and take the commit version.
    pub fn decode_write_response(&self, value: &JsonValue) -> FirestoreResult<WriteResponse> {
        let stream_token = match value.get("streamToken").and_then(JsonValue::as_str) {
            Some(token) => BytesValue::from_base64(token)
                .map_err(|err| invalid_argument(format!("Invalid streamToken: {err}")))?,
            None => BytesValue::empty(),
        };
        let commit_version = match value.get("commitTime").and_then(JsonValue::as_str) {
            Some(commit_time) => self.decode_version(commit_time)?,
            None => SnapshotVersion::min(),
        };

        let mut mutation_results = Vec::new();
        if let Some(results) = value.get("writeResults").and_then(JsonValue::as_array) {
            for result in results {
                let version = match result.get("updateTime").and_then(JsonValue::as_str) {
                    Some(update_time) => self.decode_version(update_time)?,
                    None => commit_version,
                };
                let transform_results = match result.get("transformResults").and_then(JsonValue::as_array) {
                    Some(values) => values
                        .iter()
                        .map(decode_value)
                        .collect::<FirestoreResult<Vec<_>>>()?,
                    None => Vec::new(),
                };
                mutation_results.push(MutationResult::new(version, transform_results));
            }
        }

        Ok(WriteResponse {
            stream_token,
            commit_version,
            mutation_results,
        })
    }

    /// Stream-level status carried in an `error` envelope, if the message is one.
    pub fn decode_stream_error(&self, value: &JsonValue) -> Option<FirestoreError> {
        value.get("error").map(decode_status)
    }

    pub fn encode_stream_error(&self, error: &FirestoreError) -> JsonValue {
        json!({
            "error": {
                "code": error.code.grpc_code(),
                "message": error.message(),
            }
        })
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            format!("{}/documents", self.database_name())
        } else {
            format!("{}/documents/{}", self.database_name(), path.canonical_string())
        }
    }

    fn encode_filters(&self, filters: &[FieldFilter]) -> Option<JsonValue> {
        match filters {
            [] => None,
            [filter] => Some(self.encode_field_filter(filter)),
            _ => {
                let nested: Vec<JsonValue> = filters
                    .iter()
                    .map(|filter| self.encode_field_filter(filter))
                    .collect();
                Some(json!({
                    "compositeFilter": {
                        "op": "AND",
                        "filters": nested,
                    }
                }))
            }
        }
    }

    fn encode_field_filter(&self, filter: &FieldFilter) -> JsonValue {
        let field = json!({ "fieldPath": filter.field().canonical_string() });
        let unary = match filter.op() {
            Operator::Equal if filter.value().is_null() => Some("IS_NULL"),
            Operator::Equal if filter.value().is_nan() => Some("IS_NAN"),
            Operator::NotEqual if filter.value().is_null() => Some("IS_NOT_NULL"),
            Operator::NotEqual if filter.value().is_nan() => Some("IS_NOT_NAN"),
            _ => None,
        };
        match unary {
            Some(op) => json!({ "unaryFilter": { "field": field, "op": op } }),
            None => json!({
                "fieldFilter": {
                    "field": field,
                    "op": filter.op().wire_name(),
                    "value": encode_value(filter.value()),
                }
            }),
        }
    }

    fn encode_cursor(&self, bound: &Bound, before: bool) -> JsonValue {
        json!({
            "values": bound.position.iter().map(encode_value).collect::<Vec<_>>(),
            "before": before,
        })
    }

    fn encode_field_transforms(&self, transforms: &[FieldTransform]) -> Vec<JsonValue> {
        transforms
            .iter()
            .map(|transform| {
                let field_path = transform.field_path().canonical_string();
                match transform.operation() {
                    TransformOperation::ServerTimestamp => json!({
                        "fieldPath": field_path,
                        "setToServerValue": "REQUEST_TIME",
                    }),
                    TransformOperation::NumericIncrement(operand) => json!({
                        "fieldPath": field_path,
                        "increment": encode_value(operand),
                    }),
                    TransformOperation::ArrayUnion(elements) => json!({
                        "fieldPath": field_path,
                        "appendMissingElements": {
                            "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                        },
                    }),
                    TransformOperation::ArrayRemove(elements) => json!({
                        "fieldPath": field_path,
                        "removeAllFromArray": {
                            "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                        },
                    }),
                }
            })
            .collect()
    }
}

#[derive(Deserialize)]
struct StatusJson {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// Decodes a `google.rpc.Status`. Malformed statuses become `Unknown`.
pub(crate) fn decode_status(value: &JsonValue) -> FirestoreError {
    match StatusJson::deserialize(value) {
        Ok(status) => FirestoreError::new(FirestoreErrorCode::from_grpc_code(status.code), status.message),
        Err(err) => FirestoreError::new(FirestoreErrorCode::Unknown, format!("Malformed status: {err}")),
    }
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let fields: serde_json::Map<String, JsonValue> = map
        .fields()
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect();
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) if double.is_nan() => json!({ "doubleValue": "NaN" }),
        ValueKind::Double(double) if double.is_infinite() => {
            let encoded = if double.is_sign_positive() { "Infinity" } else { "-Infinity" };
            json!({ "doubleValue": encoded })
        }
        ValueKind::Double(double) => json!({ "doubleValue": double }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values: Vec<JsonValue> = array.values().iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({ "mapValue": { "fields": encode_map_fields(map) } }),
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let Some(fields_value) = map.get("fields") else {
        return Ok(MapValue::empty());
    };
    let fields_object = fields_value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;

    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(Timestamp::parse_rfc3339(timestamp)?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let encoded = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(encoded)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        let longitude = geo_point
            .get("longitude")
            .and_then(JsonValue::as_f64)
            .unwrap_or(0.0);
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(latitude, longitude)?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}
