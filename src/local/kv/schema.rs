//! Tables and row records of the durable store.
//!
//! Keys are built with [`KeyBuilder`]; values are JSON-encoded records that
//! carry everything needed to rebuild the row, so keys never need decoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{internal_error, FirestoreResult};
use crate::local::kv::key_builder::KeyBuilder;
use crate::local::kv::{IterControl, KvTransaction};
use crate::model::{BatchId, ListenSequenceNumber, ResourcePath, TargetId};

pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_VERSION_TABLE: &str = "schemaVersion";
pub const MUTATION_QUEUES: &str = "mutationQueues";
pub const MUTATIONS: &str = "mutations";
pub const DOCUMENT_MUTATIONS: &str = "documentMutations";
pub const REMOTE_DOCUMENTS: &str = "remoteDocuments";
pub const REMOTE_DOCUMENTS_READ_TIME: &str = "remoteDocumentsReadTime";
pub const REMOTE_DOCUMENT_GLOBAL: &str = "remoteDocumentGlobal";
pub const TARGETS: &str = "targets";
pub const TARGET_CANONICAL_IDS: &str = "targetCanonicalIds";
pub const TARGET_DOCUMENTS: &str = "targetDocuments";
pub const DOCUMENT_TARGETS: &str = "documentTargets";
pub const TARGET_GLOBAL: &str = "targetGlobal";
pub const COLLECTION_PARENTS: &str = "collectionParents";
pub const OWNER: &str = "owner";
pub const CLIENT_METADATA: &str = "clientMetadata";

/// Target id of the rows that only record a document's last use.
pub const SENTINEL_TARGET_ID: TargetId = 0;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationQueueRecord {
    pub user_id: String,
    pub last_acknowledged_batch_id: BatchId,
    /// Highest batch id ever assigned, so ids are never reused.
    pub highest_batch_id: BatchId,
    /// Base64 write-stream token.
    pub last_stream_token: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MutationBatchRecord {
    pub user_id: String,
    pub batch_id: BatchId,
    pub local_write_time_seconds: i64,
    pub local_write_time_nanos: i32,
    pub base_mutations: Vec<JsonValue>,
    pub mutations: Vec<JsonValue>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentMutationRecord {
    pub path: String,
    pub batch_id: BatchId,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RemoteDocumentRecord {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub document: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub no_document: Option<NoDocumentRecord>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub unknown_document: Option<NoDocumentRecord>,
    #[serde(default)]
    pub has_committed_mutations: bool,
    pub read_time_micros: i64,
}

/// Path and version of a missing or unknown document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoDocumentRecord {
    pub path: String,
    pub version_micros: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadTimeRecord {
    pub path: String,
    pub read_time_micros: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteDocumentGlobalRecord {
    pub byte_size: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TargetRecord {
    pub target_id: TargetId,
    pub canonical_id: String,
    /// Listen `addTarget` payload describing the target.
    pub target: JsonValue,
    pub purpose: String,
    pub resume_token: String,
    pub snapshot_version_micros: i64,
    pub last_limbo_free_snapshot_version_micros: i64,
    pub sequence_number: ListenSequenceNumber,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetDocumentRecord {
    pub target_id: TargetId,
    pub path: String,
    /// Set on sentinel rows only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub sequence_number: Option<ListenSequenceNumber>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetGlobalRecord {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version_micros: i64,
    pub target_count: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectionParentRecord {
    pub collection_id: String,
    pub parent: String,
}

/// The primary lease. At most one row exists.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PrimaryLeaseRecord {
    pub owner_id: String,
    pub allow_tab_synchronization: bool,
    pub lease_timestamp_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientMetadataRecord {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

pub fn schema_version_key() -> Vec<u8> {
    KeyBuilder::new(SCHEMA_VERSION_TABLE).build()
}

pub fn mutation_queue_key(user_id: &str) -> Vec<u8> {
    KeyBuilder::new(MUTATION_QUEUES).string(user_id).build()
}

pub fn mutations_prefix(user_id: &str) -> KeyBuilder {
    KeyBuilder::new(MUTATIONS).string(user_id)
}

pub fn mutation_key(user_id: &str, batch_id: BatchId) -> Vec<u8> {
    mutations_prefix(user_id).number(batch_id as i64).build()
}

pub fn document_mutation_prefix(user_id: &str) -> KeyBuilder {
    KeyBuilder::new(DOCUMENT_MUTATIONS).string(user_id)
}

pub fn document_mutation_key(user_id: &str, path: &ResourcePath, batch_id: BatchId) -> Vec<u8> {
    document_mutation_prefix(user_id)
        .path(path)
        .number(batch_id as i64)
        .build()
}

pub fn remote_document_key(path: &ResourcePath) -> Vec<u8> {
    KeyBuilder::new(REMOTE_DOCUMENTS).path(path).build()
}

pub fn read_time_key(read_time_micros: i64, path: &ResourcePath) -> Vec<u8> {
    KeyBuilder::new(REMOTE_DOCUMENTS_READ_TIME)
        .number(read_time_micros)
        .path(path)
        .build()
}

pub fn remote_document_global_key() -> Vec<u8> {
    KeyBuilder::new(REMOTE_DOCUMENT_GLOBAL).build()
}

pub fn target_key(target_id: TargetId) -> Vec<u8> {
    KeyBuilder::new(TARGETS).number(target_id as i64).build()
}

pub fn target_canonical_id_key(canonical_id: &str, target_id: TargetId) -> Vec<u8> {
    KeyBuilder::new(TARGET_CANONICAL_IDS)
        .string(canonical_id)
        .number(target_id as i64)
        .build()
}

pub fn target_document_key(target_id: TargetId, path: &ResourcePath) -> Vec<u8> {
    KeyBuilder::new(TARGET_DOCUMENTS)
        .number(target_id as i64)
        .path(path)
        .build()
}

pub fn document_target_key(path: &ResourcePath, target_id: TargetId) -> Vec<u8> {
    KeyBuilder::new(DOCUMENT_TARGETS)
        .path(path)
        .number(target_id as i64)
        .build()
}

pub fn target_global_key() -> Vec<u8> {
    KeyBuilder::new(TARGET_GLOBAL).build()
}

pub fn collection_parent_key(collection_id: &str, parent: &ResourcePath) -> Vec<u8> {
    KeyBuilder::new(COLLECTION_PARENTS)
        .string(collection_id)
        .path(parent)
        .build()
}

pub fn owner_key() -> Vec<u8> {
    KeyBuilder::new(OWNER).build()
}

pub fn client_metadata_key(client_id: &str) -> Vec<u8> {
    KeyBuilder::new(CLIENT_METADATA).string(client_id).build()
}

pub fn decode_record<T: DeserializeOwned>(bytes: &[u8]) -> FirestoreResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|err| internal_error(format!("Corrupt persisted record: {err}")))
}

pub fn read_record<T: DeserializeOwned>(
    txn: &dyn KvTransaction,
    key: &[u8],
) -> FirestoreResult<Option<T>> {
    txn.get(key)?.map(|bytes| decode_record(&bytes)).transpose()
}

pub fn write_record<T: Serialize>(txn: &dyn KvTransaction, key: &[u8], record: &T) -> FirestoreResult<()> {
    let bytes = serde_json::to_vec(record)
        .map_err(|err| internal_error(format!("Failed to encode record: {err}")))?;
    txn.put(key, &bytes)
}

/// Decodes and visits every record in `[start, end)`.
pub fn scan_records<T: DeserializeOwned>(
    txn: &dyn KvTransaction,
    range: &(Vec<u8>, Vec<u8>),
    visitor: &mut dyn FnMut(T) -> FirestoreResult<IterControl>,
) -> FirestoreResult<()> {
    txn.scan(&range.0, &range.1, &mut |_, value| visitor(decode_record(value)?))
}

/// Collects every record in `[start, end)`.
pub fn collect_records<T: DeserializeOwned>(
    txn: &dyn KvTransaction,
    range: &(Vec<u8>, Vec<u8>),
) -> FirestoreResult<Vec<T>> {
    let mut records = Vec::new();
    scan_records(txn, range, &mut |record| {
        records.push(record);
        Ok(IterControl::Continue)
    })?;
    Ok(records)
}

pub fn parse_path(path: &str) -> FirestoreResult<ResourcePath> {
    ResourcePath::from_string(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::kv::{KvStore, MemoryKvStore};

    #[test]
    fn records_round_trip_through_the_store() {
        let store = MemoryKvStore::new();
        let txn = store.begin(false).unwrap();
        let record = ClientMetadataRecord {
            client_id: "tab-1".to_string(),
            update_time_ms: 42,
            network_enabled: true,
            in_foreground: false,
        };
        write_record(txn.as_ref(), &client_metadata_key("tab-1"), &record).unwrap();
        let read: Option<ClientMetadataRecord> =
            read_record(txn.as_ref(), &client_metadata_key("tab-1")).unwrap();
        assert_eq!(read, Some(record));
        let missing: Option<ClientMetadataRecord> =
            read_record(txn.as_ref(), &client_metadata_key("tab-2")).unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn sentinel_rows_sort_first_per_document() {
        let path = ResourcePath::from_string("c/1").unwrap();
        assert!(document_target_key(&path, SENTINEL_TARGET_ID) < document_target_key(&path, 2));
    }
}
