use std::collections::BTreeSet;
use std::ops::Bound::{Excluded, Included, Unbounded};

use crate::model::{document_key_set, DocumentKey, DocumentKeySet};

/// Two-way index between document keys and the ids (target or batch ids)
/// holding a reference to them.
///
/// Used for the local view references that pin documents while a view
/// shows them, and by the in-memory mutation queue.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: BTreeSet<(DocumentKey, i32)>,
    by_id: BTreeSet<(i32, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        self.by_key.insert((key.clone(), id));
        self.by_id.insert((id, key));
    }

    pub fn add_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: i32) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references(&mut self, keys: &DocumentKeySet, id: i32) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the released keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let keys: Vec<DocumentKey> = self.id_range(id).map(|(_, key)| key.clone()).collect();
        for key in &keys {
            self.remove_reference(key, id);
        }
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        self.id_range(id)
            .fold(document_key_set(), |keys, (_, key)| keys.insert(key.clone()))
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .range((Included((key.clone(), i32::MIN)), Unbounded))
            .next()
            .is_some_and(|(candidate, _)| candidate == key)
    }

    fn id_range(&self, id: i32) -> impl Iterator<Item = &(i32, DocumentKey)> {
        let upper = match id.checked_add(1) {
            Some(next) => Excluded((next, DocumentKey::empty())),
            None => Unbounded,
        };
        self.by_id
            .range((Included((id, DocumentKey::empty())), upper))
    }
}
