use std::fmt::{Display, Formatter};

use crate::core::query::{Bound, FieldFilter, OrderBy};
use crate::model::{DocumentKey, ResourcePath};

/// Canonical form of a listened query, as sent to the watch protocol.
///
/// Two targets are equal iff their canonical ids match.
#[derive(Clone, Debug)]
pub struct Target {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub order_by: Vec<OrderBy>,
    pub filters: Vec<FieldFilter>,
    pub limit: Option<u32>,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Target {
    /// Target listening to a single document.
    pub fn for_document(key: &DocumentKey) -> Self {
        crate::core::query::Query::new(key.path().clone()).to_target()
    }

    pub fn is_document_target(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            id.push_str("|cg:");
            id.push_str(group);
        }
        id.push_str("|f:");
        id.push_str(
            &self
                .filters
                .iter()
                .map(FieldFilter::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        id.push_str("|ob:");
        id.push_str(
            &self
                .order_by
                .iter()
                .map(OrderBy::canonical_id)
                .collect::<Vec<_>>()
                .join(","),
        );
        if let Some(limit) = self.limit {
            id.push_str("|l:");
            id.push_str(&limit.to_string());
        }
        if let Some(start) = &self.start_at {
            id.push_str("|lb:");
            id.push_str(if start.before { "b:" } else { "a:" });
            id.push_str(&start.canonical_position());
        }
        if let Some(end) = &self.end_at {
            id.push_str("|ub:");
            id.push_str(if end.before { "a:" } else { "b:" });
            id.push_str(&end.canonical_position());
        }
        id
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Target {}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target({})", self.canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::{Direction, Operator, Query};
    use crate::model::FieldPath;
    use crate::value::FirestoreValue;
    use std::collections::BTreeMap;

    fn field(path: &str) -> FieldPath {
        FieldPath::from_dot_separated(path).unwrap()
    }

    #[test]
    fn canonical_id_lists_every_component() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap())
            .with_filter(FieldFilter::new(field("age"), Operator::GreaterThan, 21.into()))
            .with_order_by(OrderBy::new(field("age"), Direction::Descending))
            .with_limit_to_first(5)
            .with_start_at(Bound::new(vec![30.into()], true));
        assert_eq!(
            query.to_target().canonical_id(),
            "rooms|f:age>21|ob:agedesc,__name__desc|l:5|lb:b:30"
        );
    }

    #[test]
    fn canonical_id_ignores_map_insertion_order() {
        let mut first = BTreeMap::new();
        first.insert("b".to_string(), FirestoreValue::from(1));
        first.insert("a".to_string(), FirestoreValue::from(2));
        let mut second = BTreeMap::new();
        second.insert("a".to_string(), FirestoreValue::from(2));
        second.insert("b".to_string(), FirestoreValue::from(1));
        let base = Query::new(ResourcePath::from_string("c").unwrap());
        let left = base
            .clone()
            .with_filter(FieldFilter::new(field("m"), Operator::Equal, FirestoreValue::from_map(first)));
        let right = base
            .with_filter(FieldFilter::new(field("m"), Operator::Equal, FirestoreValue::from_map(second)));
        assert_eq!(left.to_target(), right.to_target());
        assert_eq!(left.to_target().canonical_id(), left.to_target().canonical_id());
    }

    #[test]
    fn document_targets_are_detected() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let target = Target::for_document(&key);
        assert!(target.is_document_target());
        assert_eq!(target.canonical_id(), "rooms/a|f:|ob:__name__asc");
        assert!(!Query::new(ResourcePath::from_string("rooms").unwrap())
            .to_target()
            .is_document_target());
    }
}
