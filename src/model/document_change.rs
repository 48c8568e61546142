use crate::collections::SortedMap;
use crate::model::{Document, DocumentKey};
use crate::util::assert::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeType {
    Removed,
    Added,
    Modified,
    /// Only the pending-writes or from-cache state of the document changed.
    Metadata,
}

impl ChangeType {
    /// Sort rank used when emitting changes: removals first.
    pub fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added | ChangeType::Modified | ChangeType::Metadata => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: Document,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, doc: Document) -> Self {
        Self { change_type, doc }
    }
}

/// Accumulates per-document changes, collapsing successive changes to the
/// same key into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: SortedMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key).cloned() else {
            self.changes = self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (change.change_type, old.change_type) {
            (new_type, Metadata) if new_type != Added => Some(change),
            (Metadata, old_type) if old_type != Removed => {
                Some(DocumentViewChange::new(old_type, change.doc))
            }
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Modified, Added) => Some(DocumentViewChange::new(Added, change.doc)),
            (Removed, Added) => None,
            (Removed, Modified) => Some(DocumentViewChange::new(Removed, old.doc)),
            (Added, Removed) => Some(DocumentViewChange::new(Modified, change.doc)),
            _ => fail(format!(
                "unsupported combination of changes: {change:?} after {old:?}"
            )),
        };

        self.changes = match merged {
            Some(merged) => self.changes.insert(key, merged),
            None => self.changes.remove(&key),
        };
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ObjectValue, SnapshotVersion};

    fn doc(path: &str) -> Document {
        Document::synced(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            ObjectValue::empty(),
        )
    }

    fn change(change_type: ChangeType, path: &str) -> DocumentViewChange {
        DocumentViewChange::new(change_type, doc(path))
    }

    fn types(set: &DocumentChangeSet) -> Vec<ChangeType> {
        set.changes().into_iter().map(|c| c.change_type).collect()
    }

    #[test]
    fn collapses_successive_changes() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "c/a"));
        set.track(change(ChangeType::Modified, "c/a"));
        set.track(change(ChangeType::Metadata, "c/a"));
        assert_eq!(types(&set), vec![ChangeType::Added]);

        set.track(change(ChangeType::Modified, "c/b"));
        set.track(change(ChangeType::Removed, "c/b"));
        assert_eq!(types(&set), vec![ChangeType::Added, ChangeType::Removed]);

        set.track(change(ChangeType::Added, "c/b"));
        assert_eq!(types(&set), vec![ChangeType::Added, ChangeType::Modified]);
    }

    #[test]
    fn add_then_remove_cancels_out() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "c/a"));
        set.track(change(ChangeType::Removed, "c/a"));
        assert!(set.is_empty());
    }

    #[test]
    fn metadata_is_superseded() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Metadata, "c/a"));
        set.track(change(ChangeType::Removed, "c/a"));
        assert_eq!(types(&set), vec![ChangeType::Removed]);
    }

    #[test]
    #[should_panic(expected = "unsupported combination")]
    fn added_twice_is_rejected() {
        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, "c/a"));
        set.track(change(ChangeType::Added, "c/a"));
    }
}
