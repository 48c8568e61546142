use std::collections::BTreeMap;

use crate::model::FieldPath;
use crate::value::{FirestoreValue, MapValue, ValueKind};

/// Top-level document data with path-based accessors. Updates return new
/// values and leave the receiver untouched.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ObjectValue {
    fields: MapValue,
}

/// Set of field paths touched by a patch.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct FieldMask {
    fields: Vec<FieldPath>,
}

impl FieldMask {
    pub fn new(mut fields: Vec<FieldPath>) -> Self {
        fields.sort();
        fields.dedup();
        Self { fields }
    }

    pub fn fields(&self) -> &[FieldPath] {
        &self.fields
    }

    /// Whether `path` equals or is nested under a masked field.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_map(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self {
            fields: MapValue::new(fields),
        }
    }

    pub fn from_map_value(fields: MapValue) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        self.fields.fields()
    }

    pub fn map_value(&self) -> &MapValue {
        &self.fields
    }

    pub fn to_value(&self) -> FirestoreValue {
        FirestoreValue::from_map_value(self.fields.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    pub fn set(&self, path: &FieldPath, value: FirestoreValue) -> Self {
        let mut fields = self.fields.clone().into_fields();
        set_path(&mut fields, path.segments(), value);
        Self::from_map(fields)
    }

    pub fn delete(&self, path: &FieldPath) -> Self {
        let mut fields = self.fields.clone().into_fields();
        delete_path(&mut fields, path.segments());
        Self::from_map(fields)
    }

    /// Leaf paths of this object; empty nested maps count as leaves.
    pub fn field_mask(&self) -> FieldMask {
        let mut paths = Vec::new();
        collect_leaf_paths(self.fields.fields(), &[], &mut paths);
        FieldMask::new(paths)
    }

    /// Copies every masked field of `source` into this object, deleting the
    /// ones `source` does not define.
    pub fn apply_mask(&self, mask: &FieldMask, source: &ObjectValue) -> Self {
        let mut fields = self.fields.clone().into_fields();
        for path in mask.fields() {
            match source.field(path) {
                Some(value) => set_path(&mut fields, path.segments(), value.clone()),
                None => delete_path(&mut fields, path.segments()),
            }
        }
        Self::from_map(fields)
    }
}

fn set_path(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String], value: FirestoreValue) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }
    let mut child = match fields.remove(first).map(FirestoreValue::into_kind) {
        Some(ValueKind::Map(map)) => map.into_fields(),
        _ => BTreeMap::new(),
    };
    set_path(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_path(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    if let Some(ValueKind::Map(_)) = fields.get(first).map(FirestoreValue::kind) {
        if let Some(ValueKind::Map(map)) = fields.remove(first).map(FirestoreValue::into_kind) {
            let mut child = map.into_fields();
            delete_path(&mut child, rest);
            fields.insert(first.clone(), FirestoreValue::from_map(child));
        }
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &[String],
    out: &mut Vec<FieldPath>,
) {
    for (key, value) in fields {
        let mut segments = prefix.to_vec();
        segments.push(key.clone());
        match value.as_map() {
            Some(map) if !map.is_empty() => collect_leaf_paths(map.fields(), &segments, out),
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.push(path);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let object = ObjectValue::empty().set(&path("a.b.c"), 1.into());
        assert_eq!(object.field(&path("a.b.c")), Some(&FirestoreValue::from_integer(1)));
        assert!(object.field(&path("a.b")).unwrap().as_map().is_some());
    }

    #[test]
    fn set_overwrites_non_map_parent() {
        let object = ObjectValue::empty()
            .set(&path("a"), "leaf".into())
            .set(&path("a.b"), 2.into());
        assert_eq!(object.field(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn delete_keeps_siblings_and_original() {
        let original = ObjectValue::empty()
            .set(&path("a.b"), 1.into())
            .set(&path("a.c"), 2.into());
        let deleted = original.delete(&path("a.b"));
        assert!(deleted.field(&path("a.b")).is_none());
        assert!(deleted.field(&path("a.c")).is_some());
        assert!(original.field(&path("a.b")).is_some());
        assert_eq!(original.delete(&path("x.y")), original);
    }

    #[test]
    fn field_mask_lists_leaves() {
        let object = ObjectValue::empty()
            .set(&path("a.b"), 1.into())
            .set(&path("c"), FirestoreValue::from_map(BTreeMap::new()))
            .set(&path("d"), true.into());
        let mask = object.field_mask();
        assert_eq!(mask.fields(), &[path("a.b"), path("c"), path("d")]);
        assert!(mask.covers(&path("a.b")));
        assert!(!mask.covers(&path("a")));
    }

    #[test]
    fn apply_mask_sets_and_deletes() {
        let base = ObjectValue::empty()
            .set(&path("keep"), 1.into())
            .set(&path("drop"), 2.into());
        let patch = ObjectValue::empty().set(&path("new"), 3.into());
        let mask = FieldMask::new(vec![path("new"), path("drop")]);
        let result = base.apply_mask(&mask, &patch);
        assert!(result.field(&path("keep")).is_some());
        assert!(result.field(&path("drop")).is_none());
        assert_eq!(result.field(&path("new")), Some(&FirestoreValue::from_integer(3)));
    }
}
