use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{aborted, failed_precondition, invalid_argument, FirestoreError, FirestoreResult};
use crate::model::{DocumentKey, FieldMask, MaybeDocument, Mutation, ObjectValue, Precondition, SnapshotVersion};
use crate::remote::Datastore;
use crate::util::assert::fail;

#[derive(Default)]
struct TransactionState {
    /// Version of every document read, `SnapshotVersion::min()` for documents
    /// that did not exist.
    read_versions: BTreeMap<DocumentKey, SnapshotVersion>,
    mutations: Vec<Mutation>,
    committed: bool,
    /// A failed write is reported when the transaction commits.
    last_write_error: Option<FirestoreError>,
    written_docs: BTreeSet<DocumentKey>,
}

/// One attempt of a read-write transaction against the backend.
///
/// All reads go straight to the backend and must happen before the first
/// write. Writes are buffered and sent in a single commit, preconditioned on
/// the versions read, so a concurrent change makes the commit fail.
pub struct Transaction {
    datastore: Arc<Datastore>,
    state: Mutex<TransactionState>,
}

impl Transaction {
    pub fn new(datastore: Arc<Datastore>) -> Self {
        Self {
            datastore,
            state: Mutex::new(TransactionState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransactionState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Reads `keys` from the backend and records their versions.
    pub async fn lookup(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MaybeDocument>> {
        {
            let state = self.lock();
            ensure_commit_not_called(&state)?;
            if !state.mutations.is_empty() {
                return Err(invalid_argument(
                    "Firestore transactions require all reads to be executed before all writes.",
                ));
            }
        }
        let docs = self.datastore.lookup(keys).await?;
        let mut state = self.lock();
        for doc in &docs {
            record_version(&mut state, doc)?;
        }
        Ok(docs)
    }

    pub fn set(&self, key: DocumentKey, value: ObjectValue) -> FirestoreResult<()> {
        let mut state = self.lock();
        let precondition = precondition(&state, &key);
        write(&mut state, Mutation::set(key.clone(), value).with_precondition(precondition))?;
        state.written_docs.insert(key);
        Ok(())
    }

    /// Patches the fields in `field_mask`. Updating a document the
    /// transaction saw as missing fails the commit.
    pub fn update(&self, key: DocumentKey, data: ObjectValue, field_mask: FieldMask) -> FirestoreResult<()> {
        let mut state = self.lock();
        match precondition_for_update(&state, &key) {
            Ok(precondition) => {
                write(
                    &mut state,
                    Mutation::patch(key.clone(), data, field_mask).with_precondition(precondition),
                )?;
            }
            Err(err) => state.last_write_error = Some(err),
        }
        state.written_docs.insert(key);
        Ok(())
    }

    pub fn delete(&self, key: DocumentKey) -> FirestoreResult<()> {
        let mut state = self.lock();
        let precondition = precondition(&state, &key);
        write(&mut state, Mutation::delete(key.clone()).with_precondition(precondition))?;
        state.written_docs.insert(key);
        Ok(())
    }

    /// Sends the buffered writes plus a verification of every document that
    /// was read but not written.
    pub async fn commit(&self) -> FirestoreResult<()> {
        let mutations = {
            let mut state = self.lock();
            ensure_commit_not_called(&state)?;
            if let Some(err) = state.last_write_error.take() {
                return Err(err);
            }
            let unwritten: Vec<DocumentKey> = state
                .read_versions
                .keys()
                .filter(|key| !state.written_docs.contains(*key))
                .cloned()
                .collect();
            for key in unwritten {
                let precondition = precondition(&state, &key);
                state.mutations.push(Mutation::verify(key, precondition));
            }
            state.committed = true;
            std::mem::take(&mut state.mutations)
        };
        self.datastore.commit(&mutations).await?;
        Ok(())
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }
}

fn ensure_commit_not_called(state: &TransactionState) -> FirestoreResult<()> {
    if state.committed {
        return Err(failed_precondition("A transaction can only be committed once."));
    }
    Ok(())
}

fn write(state: &mut TransactionState, mutation: Mutation) -> FirestoreResult<()> {
    ensure_commit_not_called(state)?;
    state.mutations.push(mutation);
    Ok(())
}

fn record_version(state: &mut TransactionState, doc: &MaybeDocument) -> FirestoreResult<()> {
    let doc_version = match doc {
        MaybeDocument::Document(doc) => doc.version(),
        MaybeDocument::NoDocument(_) => SnapshotVersion::min(),
        MaybeDocument::Unknown(_) => {
            fail(format!("Document in a transaction was an unknown document: {}", doc.key()))
        }
    };
    match state.read_versions.get(doc.key()) {
        Some(existing) if *existing != doc_version => {
            // Both reads must see the same version for the commit to be
            // consistent.
            Err(aborted("Document version changed between two reads."))
        }
        Some(_) => Ok(()),
        None => {
            state.read_versions.insert(doc.key().clone(), doc_version);
            Ok(())
        }
    }
}

/// Precondition for a write to `key`: the version read, unless the
/// transaction already wrote the document.
fn precondition(state: &TransactionState, key: &DocumentKey) -> Precondition {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            if version.is_min() {
                Precondition::Exists(false)
            } else {
                Precondition::UpdateTime(*version)
            }
        }
        _ => Precondition::None,
    }
}

fn precondition_for_update(state: &TransactionState, key: &DocumentKey) -> FirestoreResult<Precondition> {
    match state.read_versions.get(key) {
        Some(version) if !state.written_docs.contains(key) => {
            if version.is_min() {
                // The backend would reject the patch with a less helpful
                // error.
                Err(invalid_argument("Can't update a document that doesn't exist."))
            } else {
                Ok(Precondition::UpdateTime(*version))
            }
        }
        _ => Ok(Precondition::Exists(true)),
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Transaction")
            .field("reads", &state.read_versions.len())
            .field("mutations", &state.mutations.len())
            .field("committed", &state.committed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirestoreErrorCode;
    use crate::model::DatabaseId;
    use crate::remote::{InMemoryConnection, JsonProtoSerializer, NoopTokenProvider};
    use serde_json::json;

    fn datastore(connection: &InMemoryConnection) -> Arc<Datastore> {
        Arc::new(Datastore::new(
            Arc::new(connection.clone()),
            Arc::new(NoopTokenProvider),
            Arc::new(JsonProtoSerializer::new(DatabaseId::default("p"))),
        ))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn serve_lookups_and_commits(connection: &InMemoryConnection) {
        connection.set_rpc_handler(|rpc, _| match rpc {
            "BatchGetDocuments" => Ok(json!([
                { "found": { "name": "projects/p/databases/(default)/documents/c/1",
                             "fields": {},
                             "updateTime": "2024-01-01T00:00:01Z" } },
                { "missing": "projects/p/databases/(default)/documents/c/2",
                  "readTime": "2024-01-01T00:00:01Z" }
            ])),
            _ => Ok(json!({ "commitTime": "2024-01-01T00:00:02Z", "writeResults": [] })),
        });
    }

    #[tokio::test]
    async fn commit_verifies_documents_read_but_not_written() {
        let connection = InMemoryConnection::new();
        serve_lookups_and_commits(&connection);
        let transaction = Transaction::new(datastore(&connection));
        transaction.lookup(&[key("c/1"), key("c/2")]).await.unwrap();
        transaction.set(key("c/2"), ObjectValue::empty()).unwrap();

        let mutations = transaction.mutations();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].precondition(), Precondition::Exists(false));

        transaction.commit().await.unwrap();
        let commit = connection
            .recorded_rpcs()
            .into_iter()
            .find(|rpc| rpc.rpc_name == "Commit")
            .unwrap();
        assert_eq!(commit.request["writes"].as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn reads_after_writes_are_rejected() {
        let connection = InMemoryConnection::new();
        serve_lookups_and_commits(&connection);
        let transaction = Transaction::new(datastore(&connection));
        transaction.delete(key("c/1")).unwrap();
        let err = transaction.lookup(&[key("c/1")]).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn updating_a_missing_document_fails_at_commit() {
        let connection = InMemoryConnection::new();
        serve_lookups_and_commits(&connection);
        let transaction = Transaction::new(datastore(&connection));
        transaction.lookup(&[key("c/1"), key("c/2")]).await.unwrap();
        transaction
            .update(key("c/2"), ObjectValue::empty(), FieldMask::default())
            .unwrap();
        let err = transaction.commit().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
        assert!(connection.recorded_rpcs().iter().all(|rpc| rpc.rpc_name != "Commit"));
    }

    #[tokio::test]
    async fn a_transaction_commits_once() {
        let connection = InMemoryConnection::new();
        serve_lookups_and_commits(&connection);
        let transaction = Transaction::new(datastore(&connection));
        transaction.set(key("c/3"), ObjectValue::empty()).unwrap();
        transaction.commit().await.unwrap();
        let err = transaction.commit().await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }
}
