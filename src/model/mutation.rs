use crate::model::{
    Document, DocumentKey, DocumentState, FieldMask, FieldTransform, MaybeDocument, NoDocument,
    ObjectValue, SnapshotVersion, Timestamp, TransformOperation, UnknownDocument,
};
use crate::util::assert::{fail, hard_assert};
use crate::value::FirestoreValue;

/// Condition the stored document must satisfy for a mutation to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, maybe_doc: Option<&MaybeDocument>) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => {
                *exists == matches!(maybe_doc, Some(MaybeDocument::Document(_)))
            }
            Precondition::UpdateTime(version) => matches!(
                maybe_doc,
                Some(MaybeDocument::Document(doc)) if doc.version() == *version
            ),
        }
    }
}

/// Backend outcome for one mutation of a committed batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    /// Version of the document after the write; the commit version for
    /// deletes.
    pub version: SnapshotVersion,
    /// One entry per field transform, present only for transform mutations.
    pub transform_results: Option<Vec<FirestoreValue>>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Option<Vec<FirestoreValue>>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mutation {
    Set {
        key: DocumentKey,
        value: ObjectValue,
        precondition: Precondition,
    },
    Patch {
        key: DocumentKey,
        data: ObjectValue,
        field_mask: FieldMask,
        precondition: Precondition,
    },
    Transform {
        key: DocumentKey,
        field_transforms: Vec<FieldTransform>,
        precondition: Precondition,
    },
    Delete {
        key: DocumentKey,
        precondition: Precondition,
    },
    /// Transaction-only check that the document is unchanged.
    Verify {
        key: DocumentKey,
        precondition: Precondition,
    },
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Mutation::Set {
            key,
            value,
            precondition: Precondition::None,
        }
    }

    /// Patch applied only if the document exists.
    pub fn patch(key: DocumentKey, data: ObjectValue, field_mask: FieldMask) -> Self {
        Mutation::Patch {
            key,
            data,
            field_mask,
            precondition: Precondition::Exists(true),
        }
    }

    pub fn transform(key: DocumentKey, field_transforms: Vec<FieldTransform>) -> Self {
        Mutation::Transform {
            key,
            field_transforms,
            precondition: Precondition::Exists(true),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Mutation::Delete {
            key,
            precondition: Precondition::None,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Mutation::Verify { key, precondition }
    }

    pub fn with_precondition(mut self, new_precondition: Precondition) -> Self {
        match &mut self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Transform { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition = new_precondition,
        }
        self
    }

    pub fn key(&self) -> &DocumentKey {
        match self {
            Mutation::Set { key, .. }
            | Mutation::Patch { key, .. }
            | Mutation::Transform { key, .. }
            | Mutation::Delete { key, .. }
            | Mutation::Verify { key, .. } => key,
        }
    }

    pub fn precondition(&self) -> Precondition {
        match self {
            Mutation::Set { precondition, .. }
            | Mutation::Patch { precondition, .. }
            | Mutation::Transform { precondition, .. }
            | Mutation::Delete { precondition, .. }
            | Mutation::Verify { precondition, .. } => *precondition,
        }
    }

    /// Replaying the mutation against its own output changes nothing.
    pub fn is_idempotent(&self) -> bool {
        match self {
            Mutation::Transform {
                field_transforms, ..
            } => field_transforms
                .iter()
                .all(|transform| transform.operation.is_idempotent()),
            _ => true,
        }
    }

    /// Optimistic result of the mutation, used until the backend confirms.
    ///
    /// `base_doc` is the document before the enclosing batch started; a
    /// transform falls back to it when an earlier patch in the batch cleared
    /// the transformed field.
    pub fn apply_to_local_view(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        base_doc: Option<&MaybeDocument>,
        local_write_time: Timestamp,
    ) -> Option<MaybeDocument> {
        self.verify_key(maybe_doc);
        if !self.precondition().is_valid_for(maybe_doc) {
            return maybe_doc.cloned();
        }
        match self {
            Mutation::Set { key, value, .. } => Some(
                Document::new(
                    key.clone(),
                    post_mutation_version(maybe_doc),
                    value.clone(),
                    DocumentState::LocalMutations,
                )
                .into(),
            ),
            Mutation::Patch {
                key,
                data,
                field_mask,
                ..
            } => Some(
                Document::new(
                    key.clone(),
                    post_mutation_version(maybe_doc),
                    patch_object(maybe_doc, field_mask, data),
                    DocumentState::LocalMutations,
                )
                .into(),
            ),
            Mutation::Transform {
                key,
                field_transforms,
                ..
            } => {
                let Some(doc) = transform_base(maybe_doc) else {
                    return maybe_doc.cloned();
                };
                let mut data = doc.data().clone();
                for transform in field_transforms {
                    let previous = doc.field(&transform.field).or_else(|| {
                        base_doc
                            .and_then(MaybeDocument::as_document)
                            .and_then(|base| base.field(&transform.field))
                    });
                    let value = transform
                        .operation
                        .apply_to_local_view(previous, local_write_time);
                    data = data.set(&transform.field, value);
                }
                Some(
                    Document::new(key.clone(), doc.version(), data, DocumentState::LocalMutations)
                        .into(),
                )
            }
            Mutation::Delete { key, .. } => {
                Some(NoDocument::new(key.clone(), SnapshotVersion::min(), false).into())
            }
            Mutation::Verify { .. } => fail("Verify mutations are only used in transactions"),
        }
    }

    /// Result after the backend acknowledged the write. A failed local
    /// precondition yields an [`UnknownDocument`] because the backend accepted
    /// a write whose outcome the client cannot reproduce.
    pub fn apply_to_remote_document(
        &self,
        maybe_doc: Option<&MaybeDocument>,
        result: &MutationResult,
    ) -> MaybeDocument {
        self.verify_key(maybe_doc);
        match self {
            Mutation::Set { key, value, .. } => Document::new(
                key.clone(),
                result.version,
                value.clone(),
                DocumentState::CommittedMutations,
            )
            .into(),
            Mutation::Patch {
                key,
                data,
                field_mask,
                precondition,
            } => {
                if !precondition.is_valid_for(maybe_doc) {
                    return UnknownDocument::new(key.clone(), result.version).into();
                }
                Document::new(
                    key.clone(),
                    result.version,
                    patch_object(maybe_doc, field_mask, data),
                    DocumentState::CommittedMutations,
                )
                .into()
            }
            Mutation::Transform {
                key,
                field_transforms,
                precondition,
            } => {
                let Some(server_results) = &result.transform_results else {
                    fail("Transform results missing for a transform mutation")
                };
                if !precondition.is_valid_for(maybe_doc) {
                    return UnknownDocument::new(key.clone(), result.version).into();
                }
                hard_assert(
                    server_results.len() == field_transforms.len(),
                    "Server transform result count does not match the transforms",
                );
                let Some(doc) = transform_base(maybe_doc) else {
                    return UnknownDocument::new(key.clone(), result.version).into();
                };
                let mut data = doc.data().clone();
                for (transform, server_result) in field_transforms.iter().zip(server_results) {
                    let value = transform
                        .operation
                        .apply_to_remote_document(doc.field(&transform.field), Some(server_result));
                    data = data.set(&transform.field, value);
                }
                Document::new(key.clone(), result.version, data, DocumentState::CommittedMutations)
                    .into()
            }
            Mutation::Delete { key, .. } => {
                NoDocument::new(key.clone(), result.version, true).into()
            }
            Mutation::Verify { .. } => fail("Verify mutations are only used in transactions"),
        }
    }

    /// Values non-idempotent transforms need frozen across replays, or
    /// `None` when the mutation can be replayed freely.
    pub fn extract_base_value(&self, maybe_doc: Option<&MaybeDocument>) -> Option<ObjectValue> {
        let Mutation::Transform {
            field_transforms, ..
        } = self
        else {
            return None;
        };
        let doc = maybe_doc.and_then(MaybeDocument::as_document);
        let mut base = None::<ObjectValue>;
        for transform in field_transforms {
            let existing = doc.and_then(|doc| doc.field(&transform.field));
            if let Some(value) = transform.operation.compute_base_value(existing) {
                base = Some(base.unwrap_or_default().set(&transform.field, value));
            }
        }
        base
    }

    fn verify_key(&self, maybe_doc: Option<&MaybeDocument>) {
        if let Some(doc) = maybe_doc {
            hard_assert(
                doc.key() == self.key(),
                "Can only apply a mutation to a document with the same key",
            );
        }
    }
}

fn post_mutation_version(maybe_doc: Option<&MaybeDocument>) -> SnapshotVersion {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.version(),
        _ => SnapshotVersion::min(),
    }
}

fn patch_object(maybe_doc: Option<&MaybeDocument>, mask: &FieldMask, data: &ObjectValue) -> ObjectValue {
    let current = match maybe_doc {
        Some(MaybeDocument::Document(doc)) => doc.data().clone(),
        _ => ObjectValue::empty(),
    };
    current.apply_mask(mask, data)
}

/// Document a transform applies to. A transform that passed its
/// precondition always sees an existing document; anything else is logged and
/// left to the caller's fallback.
fn transform_base(maybe_doc: Option<&MaybeDocument>) -> Option<&Document> {
    match maybe_doc {
        Some(MaybeDocument::Document(doc)) => Some(doc),
        other => {
            log::warn!("transform applied to a non-existent document: {other:?}");
            None
        }
    }
}

/// Convenience for increment transforms used by writers.
pub fn numeric_increment(field: crate::model::FieldPath, operand: FirestoreValue) -> FieldTransform {
    FieldTransform::new(field, TransformOperation::NumericIncrement(operand))
}
