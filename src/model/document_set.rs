use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use crate::collections::{SortedMap, SortedSet, SortedSetIter};
use crate::model::{Document, DocumentKey};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents ordered by a query comparator, with the key as tie-breaker so
/// the order is total.
#[derive(Clone)]
pub struct DocumentSet {
    key_index: SortedMap<DocumentKey, Document>,
    sorted: SortedSet<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        let by_query_then_key: DocumentComparator = Arc::new(move |left, right| {
            comparator(left, right).then_with(|| left.key().cmp(right.key()))
        });
        Self {
            key_index: SortedMap::with_ord(),
            sorted: SortedSet::new(by_query_then_key),
        }
    }

    pub fn empty_by_key() -> Self {
        Self::new(Arc::new(|left: &Document, right: &Document| left.key().cmp(right.key())))
    }

    /// Same ordering, no documents.
    pub fn cleared(&self) -> Self {
        Self {
            key_index: SortedMap::with_ord(),
            sorted: SortedSet::new(Arc::clone(self.sorted.comparator())),
        }
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.key_index.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.key_index.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let doc = self.key_index.get(key)?;
        self.sorted.index_of(doc)
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn iter(&self) -> SortedSetIter<'_, Document> {
        self.sorted.iter()
    }

    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        (self.sorted.comparator())(left, right)
    }

    /// Inserts `doc`, replacing any document with the same key.
    pub fn add(&self, doc: Document) -> Self {
        let without = self.delete(doc.key());
        Self {
            key_index: without.key_index.insert(doc.key().clone(), doc.clone()),
            sorted: without.sorted.insert(doc),
        }
    }

    pub fn delete(&self, key: &DocumentKey) -> Self {
        match self.key_index.get(key) {
            Some(doc) => Self {
                key_index: self.key_index.remove(key),
                sorted: self.sorted.remove(doc),
            },
            None => self.clone(),
        }
    }

    pub fn to_vec(&self) -> Vec<Document> {
        self.iter().cloned().collect()
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl Debug for DocumentSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.iter().map(|doc| doc.key().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldPath, ObjectValue, SnapshotVersion};
    use crate::value::compare_values;

    fn doc(path: &str, sort: i64) -> Document {
        Document::synced(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            ObjectValue::empty().set(&FieldPath::from_dot_separated("sort").unwrap(), sort.into()),
        )
    }

    fn by_sort_field() -> DocumentComparator {
        let field = FieldPath::from_dot_separated("sort").unwrap();
        Arc::new(move |a: &Document, b: &Document| {
            match (a.field(&field), b.field(&field)) {
                (Some(x), Some(y)) => compare_values(x, y),
                _ => Ordering::Equal,
            }
        })
    }

    #[test]
    fn orders_by_comparator_then_key() {
        let set = DocumentSet::new(by_sort_field())
            .add(doc("c/b", 1))
            .add(doc("c/a", 1))
            .add(doc("c/z", 0));
        let keys: Vec<_> = set.iter().map(|d| d.key().to_string()).collect();
        assert_eq!(keys, vec!["c/z", "c/a", "c/b"]);
        assert_eq!(set.index_of(&DocumentKey::from_string("c/b").unwrap()), Some(2));
    }

    #[test]
    fn add_replaces_existing_key() {
        let set = DocumentSet::new(by_sort_field())
            .add(doc("c/a", 5))
            .add(doc("c/b", 3))
            .add(doc("c/a", 1));
        assert_eq!(set.len(), 2);
        assert_eq!(set.first().unwrap().key().id(), "a");
        let removed = set.delete(&DocumentKey::from_string("c/a").unwrap());
        assert_eq!(removed.len(), 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn equality_compares_contents_in_order() {
        let a = DocumentSet::empty_by_key().add(doc("c/a", 1));
        let b = DocumentSet::empty_by_key().add(doc("c/a", 1));
        let c = DocumentSet::empty_by_key().add(doc("c/a", 2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
