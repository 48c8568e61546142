use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value as JsonValue};

use crate::error::{internal_error, FirestoreErrorCode, FirestoreResult};
use crate::model::{DocumentKey, MaybeDocument, Mutation, MutationResult, SnapshotVersion};
use crate::remote::connection::{Connection, StreamHandle};
use crate::remote::credentials::TokenProvider;
use crate::remote::serializer::JsonProtoSerializer;

pub const LISTEN_RPC: &str = "Listen";
pub const WRITE_RPC: &str = "Write";
pub const COMMIT_RPC: &str = "Commit";
pub const BATCH_GET_DOCUMENTS_RPC: &str = "BatchGetDocuments";

/// Authenticated access to the backend RPCs.
pub struct Datastore {
    connection: Arc<dyn Connection>,
    token_provider: Arc<dyn TokenProvider>,
    serializer: Arc<JsonProtoSerializer>,
}

impl Datastore {
    pub fn new(
        connection: Arc<dyn Connection>,
        token_provider: Arc<dyn TokenProvider>,
        serializer: Arc<JsonProtoSerializer>,
    ) -> Self {
        Self {
            connection,
            token_provider,
            serializer,
        }
    }

    pub fn serializer(&self) -> &Arc<JsonProtoSerializer> {
        &self.serializer
    }

    pub fn invalidate_token(&self) {
        self.token_provider.invalidate_token();
    }

    /// Commits `mutations` atomically outside the write stream.
    pub async fn commit(&self, mutations: &[Mutation]) -> FirestoreResult<(SnapshotVersion, Vec<MutationResult>)> {
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let response = self
            .invoke(COMMIT_RPC, json!({ "writes": writes }))
            .await?;
        let commit_version = self.serializer.decode_version(response.get("commitTime"))?;
        let results = self
            .serializer
            .decode_write_results(response.get("writeResults"), commit_version)?;
        Ok((commit_version, results))
    }

    /// Reads the current backend state of `keys`, in request order.
    pub async fn lookup(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MaybeDocument>> {
        let names: Vec<String> = keys
            .iter()
            .map(|key| self.serializer.document_name(key))
            .collect();
        let response = self
            .invoke(BATCH_GET_DOCUMENTS_RPC, json!({ "documents": names }))
            .await?;
        let entries = match &response {
            JsonValue::Array(entries) => entries.as_slice(),
            other => other
                .get("responses")
                .and_then(JsonValue::as_array)
                .map(Vec::as_slice)
                .unwrap_or(&[]),
        };

        let mut by_key = HashMap::new();
        for entry in entries {
            let doc = self.serializer.decode_maybe_document(entry)?;
            by_key.insert(doc.key().clone(), doc);
        }
        keys.iter()
            .map(|key| {
                by_key
                    .remove(key)
                    .ok_or_else(|| internal_error(format!("missing document in lookup response: {key}")))
            })
            .collect()
    }

    /// Opens a stream of `rpc_name` with a fresh token.
    pub async fn open_stream(&self, rpc_name: &str) -> FirestoreResult<StreamHandle> {
        let token = self.token_provider.get_token().await?;
        self.connection.open_stream(rpc_name, token).await
    }

    async fn invoke(&self, rpc_name: &str, request: JsonValue) -> FirestoreResult<JsonValue> {
        let token = self.token_provider.get_token().await?;
        let path = self.serializer.database_name();
        let result = self
            .connection
            .invoke_rpc(rpc_name, &path, request, token)
            .await;
        if let Err(err) = &result {
            if err.code == FirestoreErrorCode::Unauthenticated {
                log::debug!("{rpc_name} was rejected as unauthenticated; invalidating token");
                self.token_provider.invalidate_token();
            }
        }
        result
    }
}
