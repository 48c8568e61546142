use serde_json::json;

use crate::error::{invalid_argument, FirestoreResult};
use crate::local::kv::schema::{
    parse_path, MutationBatchRecord, NoDocumentRecord, RemoteDocumentRecord, TargetRecord,
};
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{
    BatchId, Document, DocumentKey, DocumentState, MaybeDocument, Mutation, MutationBatch,
    NoDocument, SnapshotVersion, Timestamp, UnknownDocument,
};
use crate::remote::serializer::JsonProtoSerializer;

/// Converts model types into the records stored by the durable persistence.
#[derive(Clone, Debug)]
pub struct LocalSerializer {
    remote: JsonProtoSerializer,
}

impl LocalSerializer {
    pub fn new(remote: JsonProtoSerializer) -> Self {
        Self { remote }
    }

    pub fn to_remote_document(
        &self,
        doc: &MaybeDocument,
        read_time: SnapshotVersion,
    ) -> RemoteDocumentRecord {
        let mut record = RemoteDocumentRecord {
            document: None,
            no_document: None,
            unknown_document: None,
            has_committed_mutations: false,
            read_time_micros: read_time.to_micros(),
        };
        match doc {
            MaybeDocument::Document(doc) => {
                record.document = Some(self.remote.encode_document(doc));
                record.has_committed_mutations = doc.has_committed_mutations();
            }
            MaybeDocument::NoDocument(doc) => {
                record.no_document = Some(NoDocumentRecord {
                    path: doc.key().path().canonical_string(),
                    version_micros: doc.version().to_micros(),
                });
                record.has_committed_mutations = doc.has_committed_mutations();
            }
            MaybeDocument::Unknown(doc) => {
                record.unknown_document = Some(NoDocumentRecord {
                    path: doc.key().path().canonical_string(),
                    version_micros: doc.version().to_micros(),
                });
                record.has_committed_mutations = true;
            }
        }
        record
    }

    pub fn from_remote_document(&self, record: &RemoteDocumentRecord) -> FirestoreResult<MaybeDocument> {
        if let Some(document) = &record.document {
            let doc = self.remote.decode_document(document)?;
            if record.has_committed_mutations {
                return Ok(Document::new(
                    doc.key().clone(),
                    doc.version(),
                    doc.data().clone(),
                    DocumentState::CommittedMutations,
                )
                .into());
            }
            return Ok(doc.into());
        }
        if let Some(missing) = &record.no_document {
            let key = DocumentKey::from_path(parse_path(&missing.path)?)?;
            let version = SnapshotVersion::from_micros(missing.version_micros);
            return Ok(NoDocument::new(key, version, record.has_committed_mutations).into());
        }
        if let Some(unknown) = &record.unknown_document {
            let key = DocumentKey::from_path(parse_path(&unknown.path)?)?;
            let version = SnapshotVersion::from_micros(unknown.version_micros);
            return Ok(UnknownDocument::new(key, version).into());
        }
        Err(invalid_argument("Unexpected remote document record"))
    }

    pub fn to_mutation_batch(&self, user_id: &str, batch: &MutationBatch) -> MutationBatchRecord {
        MutationBatchRecord {
            user_id: user_id.to_string(),
            batch_id: batch.batch_id,
            local_write_time_seconds: batch.local_write_time.seconds,
            local_write_time_nanos: batch.local_write_time.nanos,
            base_mutations: batch
                .base_mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
            mutations: batch
                .mutations
                .iter()
                .map(|mutation| self.remote.encode_mutation(mutation))
                .collect(),
        }
    }

    pub fn from_mutation_batch(&self, record: &MutationBatchRecord) -> FirestoreResult<MutationBatch> {
        let decode = |values: &[serde_json::Value]| -> FirestoreResult<Vec<Mutation>> {
            values
                .iter()
                .map(|value| self.remote.decode_mutation(value))
                .collect()
        };
        Ok(MutationBatch::new(
            record.batch_id as BatchId,
            Timestamp::new(record.local_write_time_seconds, record.local_write_time_nanos),
            decode(&record.base_mutations)?,
            decode(&record.mutations)?,
        ))
    }

    pub fn to_target(&self, data: &TargetData) -> TargetRecord {
        let target = if data.target.is_document_target() {
            json!({ "documents": self.remote.encode_documents_target(&data.target) })
        } else {
            json!({ "query": self.remote.encode_query_target(&data.target) })
        };
        TargetRecord {
            target_id: data.target_id,
            canonical_id: data.target.canonical_id(),
            target,
            purpose: purpose_name(data.purpose).to_string(),
            resume_token: self.remote.encode_bytes(&data.resume_token),
            snapshot_version_micros: data.snapshot_version.to_micros(),
            last_limbo_free_snapshot_version_micros: data
                .last_limbo_free_snapshot_version
                .to_micros(),
            sequence_number: data.sequence_number,
        }
    }

    pub fn from_target(&self, record: &TargetRecord) -> FirestoreResult<TargetData> {
        let target = self.remote.decode_target(&record.target)?;
        let purpose = purpose_from_name(&record.purpose)?;
        Ok(TargetData::new(target, record.target_id, purpose, record.sequence_number)
            .with_resume_token(
                self.remote.decode_bytes(&record.resume_token)?,
                SnapshotVersion::from_micros(record.snapshot_version_micros),
            )
            .with_last_limbo_free_snapshot_version(SnapshotVersion::from_micros(
                record.last_limbo_free_snapshot_version_micros,
            )))
    }
}

fn purpose_name(purpose: TargetPurpose) -> &'static str {
    match purpose {
        TargetPurpose::Listen => "listen",
        TargetPurpose::ExistenceFilterMismatch => "existence-filter-mismatch",
        TargetPurpose::LimboResolution => "limbo-resolution",
    }
}

fn purpose_from_name(name: &str) -> FirestoreResult<TargetPurpose> {
    match name {
        "listen" => Ok(TargetPurpose::Listen),
        "existence-filter-mismatch" => Ok(TargetPurpose::ExistenceFilterMismatch),
        "limbo-resolution" => Ok(TargetPurpose::LimboResolution),
        other => Err(invalid_argument(format!("Unknown target purpose: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Query;
    use crate::model::{DatabaseId, ObjectValue, ResourcePath};
    use crate::value::FirestoreValue;
    use std::collections::BTreeMap;

    fn serializer() -> LocalSerializer {
        LocalSerializer::new(JsonProtoSerializer::new(DatabaseId::default("p")))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(micros: i64) -> SnapshotVersion {
        SnapshotVersion::from_micros(micros)
    }

    #[test]
    fn committed_documents_keep_their_state() {
        let mut fields = BTreeMap::new();
        fields.insert("n".to_string(), FirestoreValue::from_integer(1));
        let doc: MaybeDocument = Document::new(
            key("c/1"),
            version(5_000_000),
            ObjectValue::from_map(fields),
            DocumentState::CommittedMutations,
        )
        .into();
        let record = serializer().to_remote_document(&doc, version(6_000_000));
        assert_eq!(record.read_time_micros, 6_000_000);
        assert_eq!(serializer().from_remote_document(&record).unwrap(), doc);
    }

    #[test]
    fn missing_and_unknown_documents_are_stored_by_path() {
        let missing: MaybeDocument = NoDocument::new(key("c/2"), version(7), true).into();
        let record = serializer().to_remote_document(&missing, version(8));
        assert_eq!(serializer().from_remote_document(&record).unwrap(), missing);

        let unknown: MaybeDocument = UnknownDocument::new(key("c/3"), version(9)).into();
        let record = serializer().to_remote_document(&unknown, version(9));
        assert_eq!(serializer().from_remote_document(&record).unwrap(), unknown);
    }

    #[test]
    fn target_metadata_survives_storage() {
        let target = Query::new(ResourcePath::from_string("rooms").unwrap()).to_target();
        let data = TargetData::new(target, 2, TargetPurpose::Listen, 11)
            .with_resume_token(vec![1, 2, 3], version(1_000_000))
            .with_last_limbo_free_snapshot_version(version(500_000));
        let record = serializer().to_target(&data);
        assert_eq!(record.canonical_id, data.target.canonical_id());
        assert_eq!(serializer().from_target(&record).unwrap(), data);
    }
}
