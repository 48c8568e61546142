use crate::model::{
    document_key_set, BatchId, DocumentKey, DocumentKeySet, DocumentVersionMap, MaybeDocument,
    MaybeDocumentMap, Mutation, MutationResult, SnapshotVersion, Timestamp,
};
use crate::util::assert::hard_assert;

pub const BATCH_ID_UNKNOWN: BatchId = -1;

/// Mutations written atomically by one user operation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Locally computed seeds for non-idempotent transforms. Never sent to
    /// the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Applies the acknowledged batch to `maybe_doc`, pairing each mutation
    /// for `key` with its backend result.
    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
        batch_result: &MutationBatchResult,
    ) -> Option<MaybeDocument> {
        if let Some(doc) = &maybe_doc {
            hard_assert(doc.key() == key, "apply_to_remote_document: key mismatch");
        }
        let results = &batch_result.mutation_results;
        hard_assert(
            results.len() == self.mutations.len(),
            format!(
                "Mismatch between mutations length ({}) and results length ({})",
                self.mutations.len(),
                results.len()
            ),
        );
        let mut current = maybe_doc;
        for (mutation, result) in self.mutations.iter().zip(results) {
            if mutation.key() == key {
                current = Some(mutation.apply_to_remote_document(current.as_ref(), result));
            }
        }
        current
    }

    /// Optimistic view of `key` after the base mutations and mutations of
    /// this batch.
    pub fn apply_to_local_view(
        &self,
        key: &DocumentKey,
        maybe_doc: Option<MaybeDocument>,
    ) -> Option<MaybeDocument> {
        let mut current = maybe_doc;
        for mutation in self.base_mutations.iter().filter(|m| m.key() == key) {
            current = mutation.apply_to_local_view(
                current.as_ref(),
                current.as_ref(),
                self.local_write_time,
            );
        }
        let base_doc = current.clone();
        for mutation in self.mutations.iter().filter(|m| m.key() == key) {
            current = mutation.apply_to_local_view(
                current.as_ref(),
                base_doc.as_ref(),
                self.local_write_time,
            );
        }
        current
    }

    pub fn apply_to_local_document_set(&self, docs: &MaybeDocumentMap) -> MaybeDocumentMap {
        let mut mutated = docs.clone();
        for mutation in &self.mutations {
            let key = mutation.key();
            if let Some(doc) = self.apply_to_local_view(key, docs.get(key).cloned()) {
                mutated = mutated.insert(key.clone(), doc);
            }
        }
        mutated
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .fold(document_key_set(), |keys, m| keys.insert(m.key().clone()))
    }
}

/// A batch together with what the backend reported when committing it.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document reached, keyed by document.
    pub doc_versions: DocumentVersionMap,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            ),
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .fold(DocumentVersionMap::default(), |versions, (mutation, result)| {
                versions.insert(mutation.key().clone(), result.version)
            });
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        numeric_increment, Document, FieldMask, FieldPath, ObjectValue, TransformOperation,
    };
    use crate::model::FieldTransform;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn version(s: i64) -> SnapshotVersion {
        SnapshotVersion::from_timestamp(Timestamp::new(s, 0))
    }

    #[test]
    fn local_view_applies_only_matching_mutations_in_order() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            vec![],
            vec![
                Mutation::set(key("c/a"), ObjectValue::empty().set(&field("x"), 1.into())),
                Mutation::set(key("c/b"), ObjectValue::empty()),
                Mutation::patch(
                    key("c/a"),
                    ObjectValue::empty().set(&field("y"), 2.into()),
                    FieldMask::new(vec![field("y")]),
                ),
            ],
        );
        let doc = batch.apply_to_local_view(&key("c/a"), None).unwrap();
        let doc = doc.as_document().unwrap();
        assert_eq!(doc.field(&field("x")), Some(&1.into()));
        assert_eq!(doc.field(&field("y")), Some(&2.into()));
        assert!(doc.has_local_mutations());
        assert_eq!(batch.keys().len(), 2);
    }

    #[test]
    fn base_mutations_freeze_increment_seed() {
        let doc: MaybeDocument = Document::synced(
            key("c/a"),
            version(1),
            ObjectValue::empty().set(&field("n"), 10.into()),
        )
        .into();
        let seed = ObjectValue::empty().set(&field("n"), 10.into());
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            vec![Mutation::patch(key("c/a"), seed.clone(), seed.field_mask())],
            vec![Mutation::transform(key("c/a"), vec![numeric_increment(field("n"), 5.into())])],
        );
        let remote_bump: MaybeDocument = Document::synced(
            key("c/a"),
            version(2),
            ObjectValue::empty().set(&field("n"), 100.into()),
        )
        .into();
        let first = batch.apply_to_local_view(&key("c/a"), Some(doc)).unwrap();
        let second = batch.apply_to_local_view(&key("c/a"), Some(remote_bump)).unwrap();
        assert_eq!(first.as_document().unwrap().field(&field("n")), Some(&15.into()));
        assert_eq!(second.as_document().unwrap().field(&field("n")), Some(&15.into()));
    }

    #[test]
    fn remote_application_pairs_results() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(1, 0),
            vec![],
            vec![
                Mutation::set(key("c/a"), ObjectValue::empty()),
                Mutation::transform(
                    key("c/a"),
                    vec![FieldTransform::new(field("t"), TransformOperation::ServerTimestamp)],
                ),
            ],
        );
        let server_time = crate::value::FirestoreValue::from_timestamp(Timestamp::new(7, 0));
        let result = MutationBatchResult::from(
            batch.clone(),
            version(7),
            vec![
                MutationResult::new(version(7), None),
                MutationResult::new(version(7), Some(vec![server_time.clone()])),
            ],
            vec![1],
        );
        let doc = batch
            .apply_to_remote_document(&key("c/a"), None, &result)
            .unwrap();
        assert_eq!(doc.version(), version(7));
        assert_eq!(doc.as_document().unwrap().field(&field("t")), Some(&server_time));
        assert_eq!(result.doc_versions.get(&key("c/a")), Some(&version(7)));
    }
}
