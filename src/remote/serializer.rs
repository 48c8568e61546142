//! Conversion between model types and the proto3 JSON records exchanged
//! with the backend.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde_json::{json, Map as JsonMap, Value as JsonValue};

use crate::core::query::{Bound, Direction, FieldFilter, OrderBy, Operator};
use crate::core::target::Target;
use crate::error::{invalid_argument, FirestoreResult};
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{
    DatabaseId, Document, DocumentKey, FieldMask, FieldPath, FieldTransform, GeoPoint,
    MaybeDocument, Mutation, MutationResult, NoDocument, ObjectValue, Precondition, ResourcePath,
    SnapshotVersion, Timestamp, TransformOperation,
};
use crate::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

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

    pub fn encode_timestamp(&self, timestamp: &Timestamp) -> String {
        timestamp.to_rfc3339()
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        Timestamp::parse_rfc3339(value)
    }

    pub fn encode_version(&self, version: &SnapshotVersion) -> String {
        self.encode_timestamp(&version.timestamp())
    }

    /// Reads an optional timestamp field as a version; absent means `min()`.
    pub fn decode_version(&self, value: Option<&JsonValue>) -> FirestoreResult<SnapshotVersion> {
        match value.and_then(JsonValue::as_str) {
            Some(text) => Ok(SnapshotVersion::from_timestamp(
                self.decode_timestamp_string(text)?,
            )),
            None => Ok(SnapshotVersion::min()),
        }
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        crate::util::base64::encode(bytes)
    }

    pub fn decode_bytes(&self, value: &str) -> FirestoreResult<Vec<u8>> {
        crate::util::base64::decode(value)
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        self.resource_name(key.path())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            return self.database_id.documents_root();
        }
        format!(
            "{}/{}",
            self.database_id.documents_root(),
            path.canonical_string()
        )
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let (database_id, path) = parse_resource_name(name)?;
        if database_id != self.database_id {
            return Err(invalid_argument(format!(
                "Tried to deserialize key from different database: {name}"
            )));
        }
        DocumentKey::from_path(path)
    }

    fn path_from_name(&self, name: &str) -> FirestoreResult<ResourcePath> {
        parse_resource_name(name).map(|(_, path)| path)
    }

    pub fn encode_value(&self, value: &FirestoreValue) -> JsonValue {
        encode_value(value)
    }

    pub fn decode_value(&self, value: &JsonValue) -> FirestoreResult<FirestoreValue> {
        decode_value(value)
    }

    pub fn encode_fields(&self, data: &ObjectValue) -> JsonValue {
        encode_map_fields(data.map_value())
    }

    /// Reads the `fields` member of a document-like record.
    pub fn decode_fields(&self, value: &JsonValue) -> FirestoreResult<ObjectValue> {
        decode_map_value(value).map(ObjectValue::from_map_value)
    }

    pub fn encode_document(&self, doc: &Document) -> JsonValue {
        json!({
            "name": self.document_name(doc.key()),
            "fields": self.encode_fields(doc.data()),
            "updateTime": self.encode_version(&doc.version()),
        })
    }

    pub fn decode_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let version = self.decode_version(value.get("updateTime"))?;
        let data = self.decode_fields(value)?;
        Ok(Document::synced(key, version, data))
    }

    /// Decodes one entry of a batch-get response.
    pub fn decode_maybe_document(&self, value: &JsonValue) -> FirestoreResult<MaybeDocument> {
        if let Some(found) = value.get("found") {
            return self.decode_document(found).map(MaybeDocument::from);
        }
        if let Some(missing) = value.get("missing").and_then(JsonValue::as_str) {
            let key = self.document_key_from_name(missing)?;
            let version = self.decode_version(value.get("readTime"))?;
            return Ok(NoDocument::new(key, version, false).into());
        }
        Err(invalid_argument(
            "invalid batch get response: either found or missing must be set",
        ))
    }

    pub fn encode_precondition(&self, precondition: &Precondition) -> Option<JsonValue> {
        match precondition {
            Precondition::None => None,
            Precondition::Exists(exists) => Some(json!({ "exists": exists })),
            Precondition::UpdateTime(version) => {
                Some(json!({ "updateTime": self.encode_version(version) }))
            }
        }
    }

    pub fn decode_precondition(&self, value: Option<&JsonValue>) -> FirestoreResult<Precondition> {
        let Some(value) = value else {
            return Ok(Precondition::None);
        };
        if let Some(exists) = value.get("exists").and_then(JsonValue::as_bool) {
            return Ok(Precondition::Exists(exists));
        }
        if value.get("updateTime").is_some() {
            return Ok(Precondition::UpdateTime(
                self.decode_version(value.get("updateTime"))?,
            ));
        }
        Ok(Precondition::None)
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let mut write = JsonMap::new();
        match mutation {
            Mutation::Set { key, value, .. } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": self.document_name(key), "fields": self.encode_fields(value) }),
                );
            }
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => {
                write.insert(
                    "update".to_string(),
                    json!({ "name": self.document_name(key), "fields": self.encode_fields(data) }),
                );
                write.insert("updateMask".to_string(), encode_field_mask(field_mask));
            }
            Mutation::Transform {
                key,
                field_transforms,
                ..
            } => {
                write.insert(
                    "transform".to_string(),
                    json!({
                        "document": self.document_name(key),
                        "fieldTransforms": field_transforms
                            .iter()
                            .map(|transform| self.encode_field_transform(transform))
                            .collect::<Vec<_>>(),
                    }),
                );
            }
            Mutation::Delete { key, .. } => {
                write.insert("delete".to_string(), json!(self.document_name(key)));
            }
            Mutation::Verify { key, .. } => {
                write.insert("verify".to_string(), json!(self.document_name(key)));
            }
        }
        if let Some(precondition) = self.encode_precondition(&mutation.precondition()) {
            write.insert("currentDocument".to_string(), precondition);
        }
        JsonValue::Object(write)
    }

    pub fn decode_mutation(&self, value: &JsonValue) -> FirestoreResult<Mutation> {
        let precondition = self.decode_precondition(value.get("currentDocument"))?;
        if let Some(update) = value.get("update") {
            let name = update
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("update write missing name"))?;
            let key = self.document_key_from_name(name)?;
            let data = self.decode_fields(update)?;
            return Ok(match value.get("updateMask") {
                Some(mask) => Mutation::Patch {
                    key,
                    data,
                    field_mask: decode_field_mask(mask)?,
                    precondition,
                },
                None => Mutation::Set {
                    key,
                    value: data,
                    precondition,
                },
            });
        }
        if let Some(transform) = value.get("transform") {
            let name = transform
                .get("document")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| invalid_argument("transform write missing document"))?;
            let key = self.document_key_from_name(name)?;
            let field_transforms = transform
                .get("fieldTransforms")
                .and_then(JsonValue::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .map(|entry| self.decode_field_transform(entry))
                        .collect::<FirestoreResult<Vec<_>>>()
                })
                .transpose()?
                .unwrap_or_default();
            return Ok(Mutation::Transform {
                key,
                field_transforms,
                precondition,
            });
        }
        if let Some(name) = value.get("delete").and_then(JsonValue::as_str) {
            return Ok(Mutation::Delete {
                key: self.document_key_from_name(name)?,
                precondition,
            });
        }
        if let Some(name) = value.get("verify").and_then(JsonValue::as_str) {
            return Ok(Mutation::Verify {
                key: self.document_key_from_name(name)?,
                precondition,
            });
        }
        Err(invalid_argument(format!("Unknown mutation: {value}")))
    }

    pub fn encode_field_transform(&self, transform: &FieldTransform) -> JsonValue {
        let field_path = transform.field.canonical_string();
        match &transform.operation {
            TransformOperation::ServerTimestamp => json!({
                "fieldPath": field_path,
                "setToServerValue": "REQUEST_TIME"
            }),
            TransformOperation::ArrayUnion(elements) => json!({
                "fieldPath": field_path,
                "appendMissingElements": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::ArrayRemove(elements) => json!({
                "fieldPath": field_path,
                "removeAllFromArray": {
                    "values": elements.iter().map(encode_value).collect::<Vec<_>>()
                }
            }),
            TransformOperation::NumericIncrement(operand) => json!({
                "fieldPath": field_path,
                "increment": encode_value(operand)
            }),
        }
    }

    pub fn decode_field_transform(&self, value: &JsonValue) -> FirestoreResult<FieldTransform> {
        let field = value
            .get("fieldPath")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("field transform missing fieldPath"))
            .and_then(FieldPath::from_server_format)?;
        let operation = if value.get("setToServerValue").is_some() {
            TransformOperation::ServerTimestamp
        } else if let Some(union) = value.get("appendMissingElements") {
            TransformOperation::ArrayUnion(decode_array_values(union)?)
        } else if let Some(remove) = value.get("removeAllFromArray") {
            TransformOperation::ArrayRemove(decode_array_values(remove)?)
        } else if let Some(operand) = value.get("increment") {
            TransformOperation::NumericIncrement(decode_value(operand)?)
        } else {
            return Err(invalid_argument(format!("Unknown transform: {value}")));
        };
        Ok(FieldTransform::new(field, operation))
    }

    /// Results of a commit or write-stream response. Writes without an
    /// `updateTime` (deletes, verifies) take the commit version.
    pub fn decode_write_results(
        &self,
        value: Option<&JsonValue>,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<Vec<MutationResult>> {
        let Some(entries) = value.and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };
        entries
            .iter()
            .map(|entry| {
                let mut version = self.decode_version(entry.get("updateTime"))?;
                if version.is_min() {
                    version = commit_version;
                }
                let transform_results = entry
                    .get("transformResults")
                    .and_then(JsonValue::as_array)
                    .map(|results| results.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>())
                    .transpose()?;
                Ok(MutationResult::new(version, transform_results))
            })
            .collect()
    }

    pub fn encode_documents_target(&self, target: &Target) -> JsonValue {
        json!({ "documents": [self.resource_name(&target.path)] })
    }

    pub fn decode_documents_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let documents = value
            .get("documents")
            .and_then(JsonValue::as_array)
            .ok_or_else(|| invalid_argument("documents target missing documents"))?;
        if documents.len() != 1 {
            return Err(invalid_argument(format!(
                "DocumentsTarget contained other than 1 document: {}",
                documents.len()
            )));
        }
        let name = documents[0]
            .as_str()
            .ok_or_else(|| invalid_argument("document name must be a string"))?;
        Ok(Target::for_document(&self.document_key_from_name(name)?))
    }

    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let mut structured = JsonMap::new();
        let (parent, from) = match &target.collection_group {
            Some(group) => (
                target.path.clone(),
                json!([{ "collectionId": group, "allDescendants": true }]),
            ),
            None => (
                target.path.without_last(),
                json!([{ "collectionId": target.path.last_segment().unwrap_or_default() }]),
            ),
        };
        structured.insert("from".to_string(), from);
        if let Some(filter) = encode_filters(&target.filters) {
            structured.insert("where".to_string(), filter);
        }
        if !target.order_by.is_empty() {
            structured.insert(
                "orderBy".to_string(),
                JsonValue::Array(target.order_by.iter().map(encode_order_by).collect()),
            );
        }
        if let Some(limit) = target.limit {
            structured.insert("limit".to_string(), json!(limit));
        }
        if let Some(start) = &target.start_at {
            structured.insert("startAt".to_string(), encode_bound(start));
        }
        if let Some(end) = &target.end_at {
            structured.insert("endAt".to_string(), encode_bound(end));
        }
        json!({
            "parent": self.resource_name(&parent),
            "structuredQuery": JsonValue::Object(structured),
        })
    }

    pub fn decode_query_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        let parent = value
            .get("parent")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("query target missing parent"))?;
        let mut path = self.path_from_name(parent)?;
        let structured = value
            .get("structuredQuery")
            .ok_or_else(|| invalid_argument("query target missing structuredQuery"))?;

        let mut collection_group = None;
        if let Some(from) = structured.get("from").and_then(JsonValue::as_array) {
            if from.len() != 1 {
                return Err(invalid_argument(
                    "StructuredQuery.from with more than one collection is not supported.",
                ));
            }
            let collection_id = from[0]
                .get("collectionId")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string();
            if from[0]
                .get("allDescendants")
                .and_then(JsonValue::as_bool)
                .unwrap_or(false)
            {
                collection_group = Some(collection_id);
            } else {
                path = path.child([collection_id]);
            }
        }

        let filters = match structured.get("where") {
            Some(filter) => decode_filters(filter)?,
            None => Vec::new(),
        };
        let order_by = structured
            .get("orderBy")
            .and_then(JsonValue::as_array)
            .map(|entries| entries.iter().map(decode_order_by).collect::<FirestoreResult<Vec<_>>>())
            .transpose()?
            .unwrap_or_default();
        let limit = structured
            .get("limit")
            .and_then(|limit| limit.as_u64().or_else(|| limit.get("value").and_then(JsonValue::as_u64)))
            .map(|limit| limit as u32);
        let start_at = structured.get("startAt").map(decode_bound).transpose()?;
        let end_at = structured.get("endAt").map(decode_bound).transpose()?;

        Ok(Target {
            path,
            collection_group,
            order_by,
            filters,
            limit,
            start_at,
            end_at,
        })
    }

    /// `addTarget` payload of a listen request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut payload = JsonMap::new();
        if target.is_document_target() {
            payload.insert("documents".to_string(), self.encode_documents_target(target));
        } else {
            payload.insert("query".to_string(), self.encode_query_target(target));
        }
        payload.insert("targetId".to_string(), json!(target_data.target_id));
        if !target_data.resume_token.is_empty() {
            payload.insert(
                "resumeToken".to_string(),
                json!(self.encode_bytes(&target_data.resume_token)),
            );
        }
        JsonValue::Object(payload)
    }

    /// Decodes the `query` or `documents` member of an `addTarget` payload.
    pub fn decode_target(&self, value: &JsonValue) -> FirestoreResult<Target> {
        if let Some(documents) = value.get("documents") {
            return self.decode_documents_target(documents);
        }
        if let Some(query) = value.get("query") {
            return self.decode_query_target(query);
        }
        Err(invalid_argument(format!("Unknown target: {value}")))
    }

    /// Listen labels that tag non-default target purposes.
    pub fn encode_listen_request_labels(&self, purpose: TargetPurpose) -> Option<JsonValue> {
        let tag = match purpose {
            TargetPurpose::Listen => return None,
            TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
            TargetPurpose::LimboResolution => "limbo-document",
        };
        Some(json!({ "goog-listen-tags": tag }))
    }
}

fn parse_resource_name(name: &str) -> FirestoreResult<(DatabaseId, ResourcePath)> {
    let segments: Vec<&str> = name.split('/').collect();
    let valid = segments.len() >= 5
        && segments[0] == "projects"
        && segments[2] == "databases"
        && segments[4] == "documents";
    if !valid {
        return Err(invalid_argument(format!("Tried to parse an invalid resource name: {name}")));
    }
    let database_id = DatabaseId::new(segments[1], segments[3]);
    let path = ResourcePath::from_segments(segments[5..].iter().filter(|s| !s.is_empty()).copied());
    Ok((database_id, path))
}

fn encode_field_mask(mask: &FieldMask) -> JsonValue {
    json!({
        "fieldPaths": mask
            .fields()
            .iter()
            .map(FieldPath::canonical_string)
            .collect::<Vec<_>>()
    })
}

fn decode_field_mask(value: &JsonValue) -> FirestoreResult<FieldMask> {
    let paths = value
        .get("fieldPaths")
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .map(|entry| {
                    entry
                        .as_str()
                        .ok_or_else(|| invalid_argument("field path must be a string"))
                        .and_then(FieldPath::from_server_format)
                })
                .collect::<FirestoreResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    Ok(FieldMask::new(paths))
}

fn decode_array_values(value: &JsonValue) -> FirestoreResult<Vec<FirestoreValue>> {
    value
        .get("values")
        .and_then(JsonValue::as_array)
        .map(|entries| entries.iter().map(decode_value).collect())
        .unwrap_or_else(|| Ok(Vec::new()))
}

fn encode_filters(filters: &[FieldFilter]) -> Option<JsonValue> {
    match filters {
        [] => None,
        [single] => Some(encode_field_filter(single)),
        many => Some(json!({
            "compositeFilter": {
                "op": "AND",
                "filters": many.iter().map(encode_field_filter).collect::<Vec<_>>()
            }
        })),
    }
}

fn encode_field_filter(filter: &FieldFilter) -> JsonValue {
    let field = json!({ "fieldPath": filter.field.canonical_string() });
    if filter.op == Operator::Equal {
        if filter.value.is_null() {
            return json!({ "unaryFilter": { "field": field, "op": "IS_NULL" } });
        }
        if filter.value.is_nan() {
            return json!({ "unaryFilter": { "field": field, "op": "IS_NAN" } });
        }
    }
    json!({
        "fieldFilter": {
            "field": field,
            "op": filter.op.wire_name(),
            "value": encode_value(&filter.value)
        }
    })
}

fn decode_filters(value: &JsonValue) -> FirestoreResult<Vec<FieldFilter>> {
    if let Some(composite) = value.get("compositeFilter") {
        return composite
            .get("filters")
            .and_then(JsonValue::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .map(decode_filters)
                    .collect::<FirestoreResult<Vec<_>>>()
                    .map(|nested| nested.into_iter().flatten().collect())
            })
            .unwrap_or_else(|| Ok(Vec::new()));
    }
    if let Some(field_filter) = value.get("fieldFilter") {
        let field = decode_field_reference(field_filter.get("field"))?;
        let op_name = field_filter
            .get("op")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        let op = Operator::from_wire_name(op_name)
            .ok_or_else(|| invalid_argument(format!("Unknown filter operator: {op_name}")))?;
        let filter_value = field_filter
            .get("value")
            .ok_or_else(|| invalid_argument("field filter missing value"))?;
        return Ok(vec![FieldFilter::new(field, op, decode_value(filter_value)?)]);
    }
    if let Some(unary) = value.get("unaryFilter") {
        let field = decode_field_reference(unary.get("field"))?;
        let value = match unary.get("op").and_then(JsonValue::as_str) {
            Some("IS_NULL") => FirestoreValue::null(),
            Some("IS_NAN") => FirestoreValue::from_double(f64::NAN),
            other => {
                return Err(invalid_argument(format!("Unknown unary filter: {other:?}")));
            }
        };
        return Ok(vec![FieldFilter::new(field, Operator::Equal, value)]);
    }
    Err(invalid_argument(format!("Unknown filter: {value}")))
}

fn decode_field_reference(value: Option<&JsonValue>) -> FirestoreResult<FieldPath> {
    value
        .and_then(|field| field.get("fieldPath"))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument("filter missing fieldPath"))
        .and_then(FieldPath::from_server_format)
}

fn encode_order_by(order: &OrderBy) -> JsonValue {
    json!({
        "field": { "fieldPath": order.field.canonical_string() },
        "direction": order.direction.wire_name(),
    })
}

fn decode_order_by(value: &JsonValue) -> FirestoreResult<OrderBy> {
    let field = decode_field_reference(value.get("field"))?;
    let direction = match value.get("direction").and_then(JsonValue::as_str) {
        Some("DESCENDING") => Direction::Descending,
        _ => Direction::Ascending,
    };
    Ok(OrderBy::new(field, direction))
}

fn encode_bound(bound: &Bound) -> JsonValue {
    json!({
        "values": bound.position.iter().map(encode_value).collect::<Vec<_>>(),
        "before": bound.before,
    })
}

fn decode_bound(value: &JsonValue) -> FirestoreResult<Bound> {
    let position = decode_array_values(value)?;
    let before = value
        .get("before")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    Ok(Bound::new(position, before))
}

fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = JsonMap::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => {
            if double.is_finite() {
                json!({ "doubleValue": double })
            } else if double.is_nan() {
                json!({ "doubleValue": "NaN" })
            } else if *double > 0.0 {
                json!({ "doubleValue": "Infinity" })
            } else {
                json!({ "doubleValue": "-Infinity" })
            }
        }
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": timestamp.to_rfc3339() }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => json!({ "bytesValue": bytes.to_base64() }),
        ValueKind::Reference(reference) => json!({ "referenceValue": reference.resource_name() }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    let fields_object = match map.get("fields") {
        Some(fields_value) => fields_value
            .as_object()
            .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?,
        None => return Ok(MapValue::new(BTreeMap::new())),
    };

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
            JsonValue::String(value) => match value.as_str() {
                "NaN" => f64::NAN,
                "Infinity" => f64::INFINITY,
                "-Infinity" => f64::NEG_INFINITY,
                other => other
                    .parse::<f64>()
                    .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            },
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(Timestamp::parse_rfc3339(
            timestamp_str,
        )?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BytesValue::from_base64(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(decoded));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let name = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        let (database_id, path) = parse_resource_name(name)?;
        return Ok(FirestoreValue::from_reference(
            database_id,
            DocumentKey::from_path(path)?,
        ));
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
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
            latitude, longitude,
        )?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        return Ok(FirestoreValue::from_array(decode_array_values(array_value)?));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::default("project"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn documents_keep_fields_and_version() {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FirestoreValue::from_string("Ada"));
        fields.insert("age".to_string(), FirestoreValue::from_integer(42));
        let doc = Document::synced(
            key("rooms/eros"),
            SnapshotVersion::from_timestamp(Timestamp::new(12, 500)),
            ObjectValue::from_map(fields),
        );
        let encoded = serializer().encode_document(&doc);
        assert_eq!(
            encoded["name"],
            json!("projects/project/databases/(default)/documents/rooms/eros")
        );
        assert_eq!(encoded["fields"]["age"], json!({ "integerValue": "42" }));
        assert_eq!(serializer().decode_document(&encoded).unwrap(), doc);
    }

    #[test]
    fn patch_writes_carry_mask_and_precondition() {
        let mut fields = BTreeMap::new();
        fields.insert("a".to_string(), FirestoreValue::from(1));
        let mutation = Mutation::patch(
            key("c/1"),
            ObjectValue::from_map(fields),
            FieldMask::new(vec![field("a")]),
        );
        let encoded = serializer().encode_mutation(&mutation);
        assert_eq!(encoded["updateMask"], json!({ "fieldPaths": ["a"] }));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(serializer().decode_mutation(&encoded).unwrap(), mutation);
    }

    #[test]
    fn delete_and_verify_writes_name_the_document() {
        let delete = serializer().encode_mutation(&Mutation::delete(key("c/1")));
        assert_eq!(
            delete,
            json!({ "delete": "projects/project/databases/(default)/documents/c/1" })
        );
        let verify = Mutation::verify(
            key("c/1"),
            Precondition::UpdateTime(SnapshotVersion::from_timestamp(Timestamp::new(3, 0))),
        );
        let encoded = serializer().encode_mutation(&verify);
        assert!(encoded["currentDocument"]["updateTime"].is_string());
        assert_eq!(serializer().decode_mutation(&encoded).unwrap(), verify);
    }

    #[test]
    fn query_targets_survive_encoding() {
        let target = Query::new(ResourcePath::from_string("rooms/eros/messages").unwrap())
            .with_filter(FieldFilter::new(field("score"), Operator::GreaterThan, 3.into()))
            .with_filter(FieldFilter::new(field("tag"), Operator::Equal, FirestoreValue::null()))
            .with_limit_to_first(10)
            .to_target();
        let encoded = serializer().encode_query_target(&target);
        assert_eq!(
            encoded["parent"],
            json!("projects/project/databases/(default)/documents/rooms/eros")
        );
        assert_eq!(
            encoded["structuredQuery"]["from"],
            json!([{ "collectionId": "messages" }])
        );
        let decoded = serializer().decode_query_target(&encoded).unwrap();
        assert_eq!(decoded.canonical_id(), target.canonical_id());
    }

    #[test]
    fn listen_payload_includes_resume_token() {
        let target = Target::for_document(&key("c/1"));
        let data = TargetData::new(target, 4, TargetPurpose::LimboResolution, 1)
            .with_resume_token(vec![9, 9], SnapshotVersion::min());
        let encoded = serializer().encode_target(&data);
        assert_eq!(encoded["targetId"], json!(4));
        assert_eq!(encoded["resumeToken"], json!(crate::util::base64::encode(&[9, 9])));
        assert_eq!(
            encoded["documents"]["documents"],
            json!(["projects/project/databases/(default)/documents/c/1"])
        );
        assert_eq!(
            serializer().decode_target(&encoded).unwrap(),
            data.target
        );
        assert_eq!(
            serializer().encode_listen_request_labels(TargetPurpose::LimboResolution),
            Some(json!({ "goog-listen-tags": "limbo-document" }))
        );
    }

    #[test]
    fn write_results_default_to_commit_version() {
        let commit = SnapshotVersion::from_timestamp(Timestamp::new(20, 0));
        let results = serializer()
            .decode_write_results(
                Some(&json!([
                    { "updateTime": "1970-01-01T00:00:10Z" },
                    {}
                ])),
                commit,
            )
            .unwrap();
        assert_eq!(results[0].version, SnapshotVersion::from_timestamp(Timestamp::new(10, 0)));
        assert_eq!(results[1].version, commit);
    }
}
