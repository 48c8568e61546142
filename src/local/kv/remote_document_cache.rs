use std::sync::Arc;

use crate::core::query::Query;
use crate::error::{internal_error, FirestoreResult};
use crate::local::kv::key_builder::{prefix_range, table_range, KeyBuilder};
use crate::local::kv::local_serializer::LocalSerializer;
use crate::local::kv::schema::{
    decode_record, parse_path, read_record, read_time_key, remote_document_global_key,
    remote_document_key, write_record, NoDocumentRecord, ReadTimeRecord, RemoteDocumentGlobalRecord,
    RemoteDocumentRecord, REMOTE_DOCUMENTS, REMOTE_DOCUMENTS_READ_TIME,
};
use crate::local::kv::{IterControl, KvTransaction};
use crate::local::persistence::{IndexManager, PersistenceTransaction, RemoteDocumentCache};
use crate::model::{
    document_map, maybe_document_map, DocumentKey, DocumentMap, MaybeDocument, MaybeDocumentMap,
    NoDocument, SnapshotVersion,
};

/// Remote documents stored under their path, with a read-time index for
/// incremental change scans.
pub struct KvRemoteDocumentCache {
    serializer: LocalSerializer,
    index_manager: Arc<dyn IndexManager>,
}

/// Removals kept so that other tabs can observe them.
fn is_tombstone(record: &RemoteDocumentRecord) -> bool {
    record
        .no_document
        .as_ref()
        .is_some_and(|missing| missing.version_micros == 0)
}

impl KvRemoteDocumentCache {
    pub fn new(serializer: LocalSerializer, index_manager: Arc<dyn IndexManager>) -> Self {
        Self {
            serializer,
            index_manager,
        }
    }

    fn read_entry(
        &self,
        store: &dyn KvTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<(RemoteDocumentRecord, i64)>> {
        let Some(bytes) = store.get(&remote_document_key(key.path()))? else {
            return Ok(None);
        };
        let record: RemoteDocumentRecord = decode_record(&bytes)?;
        Ok(Some((record, bytes.len() as i64)))
    }

    fn write_entry(
        &self,
        store: &dyn KvTransaction,
        key: &DocumentKey,
        record: &RemoteDocumentRecord,
    ) -> FirestoreResult<i64> {
        self.remove_read_time_index(store, key)?;
        let bytes = serde_json::to_vec(record)
            .map_err(|err| internal_error(format!("Failed to encode document: {err}")))?;
        store.put(&remote_document_key(key.path()), &bytes)?;
        write_record(
            store,
            &read_time_key(record.read_time_micros, key.path()),
            &ReadTimeRecord {
                path: key.path().canonical_string(),
                read_time_micros: record.read_time_micros,
            },
        )?;
        Ok(bytes.len() as i64)
    }

    fn remove_read_time_index(&self, store: &dyn KvTransaction, key: &DocumentKey) -> FirestoreResult<()> {
        if let Some((previous, _)) = self.read_entry(store, key)? {
            store.delete(&read_time_key(previous.read_time_micros, key.path()))?;
        }
        Ok(())
    }

    fn global(&self, store: &dyn KvTransaction) -> FirestoreResult<RemoteDocumentGlobalRecord> {
        Ok(read_record(store, &remote_document_global_key())?.unwrap_or_default())
    }
}

impl RemoteDocumentCache for KvRemoteDocumentCache {
    fn get_sized_entry(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Option<(MaybeDocument, i64)>> {
        match self.read_entry(txn.store()?, key)? {
            Some((record, size)) if !is_tombstone(&record) => Ok(Some((
                self.serializer.from_remote_document(&record)?,
                size,
            ))),
            _ => Ok(None),
        }
    }

    fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let immediate_children_len = query.path.len() + 1;
        let since_micros = since_read_time.to_micros();
        let (start, end) =
            prefix_range(KeyBuilder::new(REMOTE_DOCUMENTS).path_prefix(&query.path));
        let mut results = document_map();
        txn.store()?.scan(&start, &end, &mut |_, value| {
            let record: RemoteDocumentRecord = decode_record(value)?;
            if record.read_time_micros <= since_micros || record.document.is_none() {
                return Ok(IterControl::Continue);
            }
            if let MaybeDocument::Document(doc) = self.serializer.from_remote_document(&record)? {
                if doc.key().path().len() == immediate_children_len {
                    results = results.insert(doc.key().clone(), doc);
                }
            }
            Ok(IterControl::Continue)
        })?;
        Ok(results)
    }

    fn get_new_document_changes(
        &self,
        txn: &PersistenceTransaction,
        since_read_time: SnapshotVersion,
    ) -> FirestoreResult<(MaybeDocumentMap, SnapshotVersion)> {
        let store = txn.store()?;
        let start = KeyBuilder::new(REMOTE_DOCUMENTS_READ_TIME)
            .number(since_read_time.to_micros() + 1)
            .build();
        let (_, end) = table_range(REMOTE_DOCUMENTS_READ_TIME);
        let mut index_rows: Vec<ReadTimeRecord> = Vec::new();
        store.scan(&start, &end, &mut |_, value| {
            index_rows.push(decode_record(value)?);
            Ok(IterControl::Continue)
        })?;

        let mut changes = maybe_document_map();
        let mut latest = since_read_time;
        for row in index_rows {
            let key = DocumentKey::from_path(parse_path(&row.path)?)?;
            let Some((record, _)) = self.read_entry(store, &key)? else {
                continue;
            };
            let doc = if is_tombstone(&record) {
                NoDocument::new(key.clone(), SnapshotVersion::min(), false).into()
            } else {
                self.serializer.from_remote_document(&record)?
            };
            changes = changes.insert(key, doc);
            latest = latest.max(SnapshotVersion::from_micros(row.read_time_micros));
        }
        Ok((changes, latest))
    }

    fn get_last_read_time(&self, txn: &PersistenceTransaction) -> FirestoreResult<SnapshotVersion> {
        let (start, end) = table_range(REMOTE_DOCUMENTS_READ_TIME);
        let mut last = SnapshotVersion::min();
        txn.store()?.scan_reverse(&start, &end, &mut |_, value| {
            let row: ReadTimeRecord = decode_record(value)?;
            last = SnapshotVersion::from_micros(row.read_time_micros);
            Ok(IterControl::Stop)
        })?;
        Ok(last)
    }

    fn get_size(&self, txn: &PersistenceTransaction) -> FirestoreResult<i64> {
        Ok(self.global(txn.store()?)?.byte_size)
    }

    fn put_entry(
        &self,
        txn: &PersistenceTransaction,
        doc: &MaybeDocument,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<i64> {
        let record = self.serializer.to_remote_document(doc, read_time);
        let size = self.write_entry(txn.store()?, doc.key(), &record)?;
        self.index_manager
            .add_to_collection_parent_index(txn, &doc.key().collection_path())?;
        Ok(size)
    }

    fn put_removal(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<i64> {
        let record = RemoteDocumentRecord {
            document: None,
            no_document: Some(NoDocumentRecord {
                path: key.path().canonical_string(),
                version_micros: 0,
            }),
            unknown_document: None,
            has_committed_mutations: false,
            read_time_micros: read_time.to_micros(),
        };
        // Tombstones read as absent, so they do not count towards the size.
        self.write_entry(txn.store()?, key, &record)?;
        Ok(0)
    }

    fn delete_entry(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<()> {
        let store = txn.store()?;
        self.remove_read_time_index(store, key)?;
        store.delete(&remote_document_key(key.path()))
    }

    fn update_size(&self, txn: &PersistenceTransaction, delta: i64) -> FirestoreResult<()> {
        let store = txn.store()?;
        let mut global = self.global(store)?;
        global.byte_size += delta;
        write_record(store, &remote_document_global_key(), &global)
    }
}
