mod database_id;
mod document;
mod document_change;
mod document_key;
mod document_set;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod object_value;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod transform;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState, MaybeDocument, NoDocument, UnknownDocument};
pub use document_change::{ChangeType, DocumentChangeSet, DocumentViewChange};
pub use document_key::DocumentKey;
pub use document_set::{DocumentComparator, DocumentSet};
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{numeric_increment, Mutation, MutationResult, Precondition};
pub use mutation_batch::{MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use object_value::{FieldMask, ObjectValue};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use transform::{FieldTransform, TransformOperation};

use crate::collections::{SortedMap, SortedSet};

pub type TargetId = i32;
pub type BatchId = i32;
pub type ListenSequenceNumber = i64;

pub type DocumentKeySet = SortedSet<DocumentKey>;
pub type MaybeDocumentMap = SortedMap<DocumentKey, MaybeDocument>;
/// Entries are `None` for keys that were looked up but are absent.
pub type NullableMaybeDocumentMap = SortedMap<DocumentKey, Option<MaybeDocument>>;
pub type DocumentMap = SortedMap<DocumentKey, Document>;
pub type DocumentVersionMap = SortedMap<DocumentKey, SnapshotVersion>;

pub fn document_key_set() -> DocumentKeySet {
    SortedSet::default()
}

pub fn maybe_document_map() -> MaybeDocumentMap {
    SortedMap::with_ord()
}

pub fn nullable_maybe_document_map() -> NullableMaybeDocumentMap {
    SortedMap::with_ord()
}

pub fn document_map() -> DocumentMap {
    SortedMap::with_ord()
}
