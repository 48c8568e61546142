use serde_json::Value as JsonValue;

use crate::error::{invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::model::{DocumentKey, MaybeDocument, NoDocument, SnapshotVersion, TargetId};
use crate::remote::serializer::JsonProtoSerializer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// A change to the state of one or more targets. An empty `target_ids`
/// addresses every target.
#[derive(Clone, Debug, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    /// Set when the backend removed the targets because of an error.
    pub cause: Option<FirestoreError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> Self {
        Self {
            state,
            target_ids,
            resume_token: Vec::new(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Vec<u8>) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(mut self, cause: FirestoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// A document entered, changed in, or left some targets. `new_doc` is
/// `None` when the document merely left the targets without being deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<MaybeDocument>,
}

/// The number of documents the backend holds for a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub count: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WatchChange {
    Target(WatchTargetChange),
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

impl JsonProtoSerializer {
    /// Decodes one listen response.
    pub fn decode_watch_change(&self, value: &JsonValue) -> FirestoreResult<WatchChange> {
        if let Some(change) = value.get("targetChange") {
            return self.decode_target_change(change).map(WatchChange::Target);
        }
        if let Some(change) = value.get("documentChange") {
            let document = change
                .get("document")
                .ok_or_else(|| invalid_argument("documentChange missing document"))?;
            let doc = self.decode_document(document)?;
            return Ok(WatchChange::Document(DocumentWatchChange {
                updated_target_ids: target_ids(change.get("targetIds")),
                removed_target_ids: target_ids(change.get("removedTargetIds")),
                key: doc.key().clone(),
                new_doc: Some(doc.into()),
            }));
        }
        if let Some(change) = value.get("documentDelete") {
            let key = self.document_key_field(change, "documentDelete")?;
            let version = self.decode_version(change.get("readTime"))?;
            return Ok(WatchChange::Document(DocumentWatchChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: target_ids(change.get("removedTargetIds")),
                key: key.clone(),
                new_doc: Some(NoDocument::new(key, version, false).into()),
            }));
        }
        if let Some(change) = value.get("documentRemove") {
            let key = self.document_key_field(change, "documentRemove")?;
            return Ok(WatchChange::Document(DocumentWatchChange {
                updated_target_ids: Vec::new(),
                removed_target_ids: target_ids(change.get("removedTargetIds")),
                key,
                new_doc: None,
            }));
        }
        if let Some(filter) = value.get("filter") {
            let target_id = filter
                .get("targetId")
                .and_then(JsonValue::as_i64)
                .ok_or_else(|| invalid_argument("filter missing targetId"))?;
            let count = filter.get("count").and_then(JsonValue::as_u64).unwrap_or(0);
            return Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
                target_id: target_id as TargetId,
                count: count as usize,
            }));
        }
        Err(invalid_argument(format!("Unknown listen response: {value}")))
    }

    /// The global snapshot version carried by a listen response. Only target
    /// changes addressing every target carry one.
    pub fn version_from_listen_response(&self, value: &JsonValue) -> FirestoreResult<SnapshotVersion> {
        let Some(change) = value.get("targetChange") else {
            return Ok(SnapshotVersion::min());
        };
        if !target_ids(change.get("targetIds")).is_empty() {
            return Ok(SnapshotVersion::min());
        }
        self.decode_version(change.get("readTime"))
    }

    fn decode_target_change(&self, value: &JsonValue) -> FirestoreResult<WatchTargetChange> {
        let state = match value.get("targetChangeType").and_then(JsonValue::as_str) {
            None | Some("NO_CHANGE") => WatchTargetChangeState::NoChange,
            Some("ADD") => WatchTargetChangeState::Added,
            Some("REMOVE") => WatchTargetChangeState::Removed,
            Some("CURRENT") => WatchTargetChangeState::Current,
            Some("RESET") => WatchTargetChangeState::Reset,
            Some(other) => {
                return Err(invalid_argument(format!("Unknown target change type: {other}")))
            }
        };
        let resume_token = value
            .get("resumeToken")
            .and_then(JsonValue::as_str)
            .map(|token| self.decode_bytes(token))
            .transpose()?
            .unwrap_or_default();
        let cause = value.get("cause").map(|cause| {
            let code = cause.get("code").and_then(JsonValue::as_i64).unwrap_or(2);
            let message = cause
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("target removed by the backend");
            FirestoreError::new(FirestoreErrorCode::from_grpc_code(code as i32), message)
        });
        Ok(WatchTargetChange {
            state,
            target_ids: target_ids(value.get("targetIds")),
            resume_token,
            cause,
        })
    }

    fn document_key_field(&self, value: &JsonValue, kind: &str) -> FirestoreResult<DocumentKey> {
        let name = value
            .get("document")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument(format!("{kind} missing document")))?;
        self.document_key_from_name(name)
    }
}

fn target_ids(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|id| id as TargetId))
                .collect()
        })
        .unwrap_or_default()
}
