use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::core::target::Target;
use crate::model::{Document, DocumentComparator, DocumentKey, FieldPath, ResourcePath};
use crate::util::assert::fail;
use crate::value::{canonical_id, compare_values, type_order, FirestoreValue};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operator {
    LessThan,
    LessThanOrEqual,
    Equal,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    In,
    ArrayContainsAny,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Equal => "==",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::ArrayContains => "array-contains",
            Operator::In => "in",
            Operator::ArrayContainsAny => "array-contains-any",
        }
    }

    /// Name used by the structured query wire format.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Operator::LessThan => "LESS_THAN",
            Operator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Operator::Equal => "EQUAL",
            Operator::GreaterThan => "GREATER_THAN",
            Operator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Operator::ArrayContains => "ARRAY_CONTAINS",
            Operator::In => "IN",
            Operator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Some(match name {
            "LESS_THAN" => Operator::LessThan,
            "LESS_THAN_OR_EQUAL" => Operator::LessThanOrEqual,
            "EQUAL" => Operator::Equal,
            "GREATER_THAN" => Operator::GreaterThan,
            "GREATER_THAN_OR_EQUAL" => Operator::GreaterThanOrEqual,
            "ARRAY_CONTAINS" => Operator::ArrayContains,
            "IN" => Operator::In,
            "ARRAY_CONTAINS_ANY" => Operator::ArrayContainsAny,
            _ => return None,
        })
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            Operator::LessThan
                | Operator::LessThanOrEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
        )
    }

    fn matches_comparison(&self, comparison: Ordering) -> bool {
        match self {
            Operator::LessThan => comparison == Ordering::Less,
            Operator::LessThanOrEqual => comparison != Ordering::Greater,
            Operator::Equal => comparison == Ordering::Equal,
            Operator::GreaterThan => comparison == Ordering::Greater,
            Operator::GreaterThanOrEqual => comparison != Ordering::Less,
            _ => fail(format!("unknown comparison operator {}", self.as_str())),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldFilter {
    pub field: FieldPath,
    pub op: Operator,
    pub value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, op: Operator, value: FirestoreValue) -> Self {
        Self { field, op, value }
    }

    pub fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.op.as_str(),
            canonical_id(&self.value)
        )
    }

    pub fn is_inequality(&self) -> bool {
        self.op.is_inequality()
    }

    pub fn matches(&self, doc: &Document) -> bool {
        if self.field.is_key_field() {
            return self.matches_key(doc.key());
        }
        let Some(other) = doc.field(&self.field) else {
            return false;
        };
        match self.op {
            Operator::ArrayContains => other
                .as_array()
                .map(|array| array.contains(&self.value))
                .unwrap_or(false),
            Operator::In => self
                .value
                .as_array()
                .map(|candidates| candidates.contains(other))
                .unwrap_or(false),
            Operator::ArrayContainsAny => match (other.as_array(), self.value.as_array()) {
                (Some(values), Some(candidates)) => {
                    values.values().iter().any(|value| candidates.contains(value))
                }
                _ => false,
            },
            op => {
                type_order(other) == type_order(&self.value)
                    && op.matches_comparison(compare_values(other, &self.value))
            }
        }
    }

    fn matches_key(&self, key: &DocumentKey) -> bool {
        match self.op {
            Operator::In => self
                .value
                .as_array()
                .map(|candidates| {
                    candidates
                        .values()
                        .iter()
                        .any(|candidate| reference_key(candidate) == Some(key))
                })
                .unwrap_or(false),
            Operator::ArrayContains | Operator::ArrayContainsAny => false,
            op => match reference_key(&self.value) {
                Some(filter_key) => op.matches_comparison(key.cmp(filter_key)),
                None => false,
            },
        }
    }
}

fn reference_key(value: &FirestoreValue) -> Option<&DocumentKey> {
    value.as_reference().map(|reference| &reference.key)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Ascending => "asc",
            Direction::Descending => "desc",
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            Direction::Ascending => "ASCENDING",
            Direction::Descending => "DESCENDING",
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Ascending => Direction::Descending,
            Direction::Descending => Direction::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub field: FieldPath,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: Direction) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: FieldPath) -> Self {
        Self::new(field, Direction::Ascending)
    }

    pub fn canonical_id(&self) -> String {
        format!("{}{}", self.field.canonical_string(), self.direction.as_str())
    }

    fn compare(&self, left: &Document, right: &Document) -> Ordering {
        let comparison = if self.field.is_key_field() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => compare_values(l, r),
                _ => fail(format!(
                    "trying to compare documents on fields that don't exist: {}",
                    self.field
                )),
            }
        };
        match self.direction {
            Direction::Ascending => comparison,
            Direction::Descending => comparison.reverse(),
        }
    }
}

/// Cursor position. `before` means the cursor sits just before the
/// documents matching `position`.
#[derive(Clone, Debug, PartialEq)]
pub struct Bound {
    pub position: Vec<FirestoreValue>,
    pub before: bool,
}

impl Bound {
    pub fn new(position: Vec<FirestoreValue>, before: bool) -> Self {
        Self { position, before }
    }

    pub(crate) fn canonical_position(&self) -> String {
        self.position
            .iter()
            .map(canonical_id)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Whether this bound sorts before `doc` under `order_by`.
    pub fn sorts_before_document(&self, order_by: &[OrderBy], doc: &Document) -> bool {
        let mut comparison = Ordering::Equal;
        for (component, order) in self.position.iter().zip(order_by) {
            comparison = if order.field.is_key_field() {
                match reference_key(component) {
                    Some(key) => key.cmp(doc.key()),
                    None => fail("bound on the key field must be a reference value"),
                }
            } else {
                match doc.field(&order.field) {
                    Some(value) => compare_values(component, value),
                    None => fail("field must exist in the document to compare with a bound"),
                }
            };
            if order.direction == Direction::Descending {
                comparison = comparison.reverse();
            }
            if comparison != Ordering::Equal {
                break;
            }
        }
        if self.before {
            comparison != Ordering::Greater
        } else {
            comparison == Ordering::Less
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LimitType {
    First,
    Last,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::First => "F",
            LimitType::Last => "L",
        }
    }
}

/// A query as the local engine sees it: a path plus the constraints the
/// builder layer already validated.
#[derive(Clone, Debug)]
pub struct Query {
    pub path: ResourcePath,
    pub collection_group: Option<String>,
    pub explicit_order_by: Vec<OrderBy>,
    pub filters: Vec<FieldFilter>,
    pub limit: Option<u32>,
    pub limit_type: LimitType,
    pub start_at: Option<Bound>,
    pub end_at: Option<Bound>,
}

impl Query {
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            explicit_order_by: Vec::new(),
            filters: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        Self {
            collection_group: Some(collection_id.into()),
            ..Self::new(ResourcePath::root())
        }
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn with_start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn with_end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    /// Same constraints rooted at a single collection, used to expand
    /// collection group queries.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            ..self.clone()
        }
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    pub fn has_limit_to_first(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::First
    }

    pub fn has_limit_to_last(&self) -> bool {
        self.limit.is_some() && self.limit_type == LimitType::Last
    }

    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field.is_key_field()))
    }

    pub fn inequality_filter_field(&self) -> Option<&FieldPath> {
        self.filters
            .iter()
            .find(|filter| filter.is_inequality())
            .map(|filter| &filter.field)
    }

    /// Explicit orderings completed so the result order is total: an
    /// inequality field leads when nothing else is given, and the key
    /// ordering always comes last.
    pub fn order_by(&self) -> Vec<OrderBy> {
        if self.explicit_order_by.is_empty() {
            if let Some(inequality) = self.inequality_filter_field() {
                if inequality.is_key_field() {
                    return vec![OrderBy::ascending(FieldPath::key_path())];
                }
                return vec![
                    OrderBy::ascending(inequality.clone()),
                    OrderBy::ascending(FieldPath::key_path()),
                ];
            }
        }
        let mut order_by = self.explicit_order_by.clone();
        if !order_by.iter().any(|order| order.field.is_key_field()) {
            let direction = order_by
                .last()
                .map(|order| order.direction)
                .unwrap_or(Direction::Ascending);
            order_by.push(OrderBy::new(FieldPath::key_path(), direction));
        }
        order_by
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.matches_path_and_collection_group(doc)
            && self.matches_order_by(doc)
            && self.filters.iter().all(|filter| filter.matches(doc))
            && self.matches_bounds(doc)
    }

    fn matches_path_and_collection_group(&self, doc: &Document) -> bool {
        let doc_path = doc.key().path();
        if let Some(group) = &self.collection_group {
            doc.key().has_collection_id(group) && self.path.is_prefix_of(doc_path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == doc_path
        } else {
            self.path.is_immediate_parent_of(doc_path)
        }
    }

    fn matches_order_by(&self, doc: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field.is_key_field() || doc.field(&order.field).is_some())
    }

    fn matches_bounds(&self, doc: &Document) -> bool {
        let order_by = self.order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if end.sorts_before_document(&order_by, doc) {
                return false;
            }
        }
        true
    }

    /// Comparator ordering documents the way the query results are ordered.
    pub fn doc_comparator(&self) -> DocumentComparator {
        let order_by = self.order_by();
        Arc::new(move |left: &Document, right: &Document| {
            for order in &order_by {
                let comparison = order.compare(left, right);
                if comparison != Ordering::Equal {
                    return comparison;
                }
            }
            Ordering::Equal
        })
    }

    /// Backend target for this query. Limit-to-last queries are sent with the
    /// ordering and cursors inverted; the view re-applies the original order.
    pub fn to_target(&self) -> Target {
        let order_by = self.order_by();
        if self.limit_type == LimitType::First {
            return Target {
                path: self.path.clone(),
                collection_group: self.collection_group.clone(),
                order_by,
                filters: self.filters.clone(),
                limit: self.limit,
                start_at: self.start_at.clone(),
                end_at: self.end_at.clone(),
            };
        }
        Target {
            path: self.path.clone(),
            collection_group: self.collection_group.clone(),
            order_by: order_by
                .into_iter()
                .map(|order| OrderBy::new(order.field, order.direction.flipped()))
                .collect(),
            filters: self.filters.clone(),
            limit: self.limit,
            start_at: self
                .end_at
                .as_ref()
                .map(|end| Bound::new(end.position.clone(), !end.before)),
            end_at: self
                .start_at
                .as_ref()
                .map(|start| Bound::new(start.position.clone(), !start.before)),
        }
    }

    pub fn canonical_id(&self) -> String {
        format!("{}|lt:{}", self.to_target().canonical_id(), self.limit_type.as_str())
    }

    /// Query reconstructed from a target found in the target cache.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path.clone(),
            collection_group: target.collection_group.clone(),
            explicit_order_by: target.order_by.clone(),
            filters: target.filters.clone(),
            limit: target.limit,
            limit_type: LimitType::First,
            start_at: target.start_at.clone(),
            end_at: target.end_at.clone(),
        }
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.canonical_id() == other.canonical_id()
    }
}

impl Eq for Query {}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Query({})", self.canonical_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DatabaseId, ObjectValue, SnapshotVersion};

    fn path(p: &str) -> ResourcePath {
        ResourcePath::from_string(p).unwrap()
    }

    fn field(p: &str) -> FieldPath {
        FieldPath::from_dot_separated(p).unwrap()
    }

    fn doc(key: &str, fields: &[(&str, FirestoreValue)]) -> Document {
        let data = fields
            .iter()
            .fold(ObjectValue::empty(), |data, (name, value)| data.set(&field(name), value.clone()));
        Document::synced(DocumentKey::from_string(key).unwrap(), SnapshotVersion::min(), data)
    }

    #[test]
    fn collection_query_matches_immediate_children_only() {
        let query = Query::new(path("rooms/eros/messages"));
        assert!(query.matches(&doc("rooms/eros/messages/1", &[])));
        assert!(!query.matches(&doc("rooms/eros/messages/1/replies/2", &[])));
        assert!(!query.matches(&doc("rooms/other/messages/1", &[])));
    }

    #[test]
    fn collection_group_matches_any_depth() {
        let query = Query::collection_group("messages");
        assert!(query.matches(&doc("rooms/eros/messages/1", &[])));
        assert!(query.matches(&doc("messages/2", &[])));
        assert!(!query.matches(&doc("rooms/eros", &[])));
    }

    #[test]
    fn filters_require_matching_type_order() {
        let query = Query::new(path("c")).with_filter(FieldFilter::new(
            field("n"),
            Operator::GreaterThan,
            5.into(),
        ));
        assert!(query.matches(&doc("c/a", &[("n", 6.into())])));
        assert!(query.matches(&doc("c/a", &[("n", FirestoreValue::from_double(5.5))])));
        assert!(!query.matches(&doc("c/a", &[("n", "zzz".into())])));
        assert!(!query.matches(&doc("c/a", &[])));
    }

    #[test]
    fn array_and_in_filters() {
        let tags = FirestoreValue::from_array(vec!["a".into(), "b".into()]);
        let contains = Query::new(path("c")).with_filter(FieldFilter::new(
            field("tags"),
            Operator::ArrayContains,
            "b".into(),
        ));
        assert!(contains.matches(&doc("c/1", &[("tags", tags.clone())])));

        let any = Query::new(path("c")).with_filter(FieldFilter::new(
            field("tags"),
            Operator::ArrayContainsAny,
            FirestoreValue::from_array(vec!["x".into(), "a".into()]),
        ));
        assert!(any.matches(&doc("c/1", &[("tags", tags)])));

        let within = Query::new(path("c")).with_filter(FieldFilter::new(
            field("n"),
            Operator::In,
            FirestoreValue::from_array(vec![1.into(), 2.into()]),
        ));
        assert!(within.matches(&doc("c/1", &[("n", 2.into())])));
        assert!(!within.matches(&doc("c/1", &[("n", 3.into())])));
    }

    #[test]
    fn key_filters_compare_reference_keys() {
        let db = DatabaseId::default("p");
        let reference =
            FirestoreValue::from_reference(db, DocumentKey::from_string("c/m").unwrap());
        let query = Query::new(path("c")).with_filter(FieldFilter::new(
            FieldPath::key_path(),
            Operator::LessThan,
            reference,
        ));
        assert!(query.matches(&doc("c/a", &[])));
        assert!(!query.matches(&doc("c/z", &[])));
    }

    #[test]
    fn order_by_is_normalized() {
        let query = Query::new(path("c")).with_filter(FieldFilter::new(
            field("n"),
            Operator::LessThan,
            1.into(),
        ));
        assert_eq!(
            query.order_by(),
            vec![OrderBy::ascending(field("n")), OrderBy::ascending(FieldPath::key_path())]
        );
        let query = Query::new(path("c")).with_order_by(OrderBy::new(field("n"), Direction::Descending));
        assert_eq!(
            query.order_by().last(),
            Some(&OrderBy::new(FieldPath::key_path(), Direction::Descending))
        );
    }

    #[test]
    fn explicit_order_by_excludes_documents_missing_the_field() {
        let query = Query::new(path("c")).with_order_by(OrderBy::ascending(field("n")));
        assert!(!query.matches(&doc("c/a", &[])));
        assert!(query.matches(&doc("c/a", &[("n", 1.into())])));
    }

    #[test]
    fn bounds_limit_the_range() {
        let query = Query::new(path("c"))
            .with_order_by(OrderBy::ascending(field("n")))
            .with_start_at(Bound::new(vec![2.into()], true))
            .with_end_at(Bound::new(vec![4.into()], false));
        let matches: Vec<i64> = (0..6)
            .filter(|n| query.matches(&doc("c/a", &[("n", (*n as i64).into())])))
            .collect();
        assert_eq!(matches, vec![2, 3, 4]);

        let exclusive = Query::new(path("c"))
            .with_order_by(OrderBy::ascending(field("n")))
            .with_start_at(Bound::new(vec![2.into()], false))
            .with_end_at(Bound::new(vec![4.into()], true));
        assert!(!exclusive.matches(&doc("c/a", &[("n", 2.into())])));
        assert!(exclusive.matches(&doc("c/a", &[("n", 3.into())])));
        assert!(!exclusive.matches(&doc("c/a", &[("n", 4.into())])));
    }

    #[test]
    fn comparator_orders_by_fields_then_key() {
        let query = Query::new(path("c")).with_order_by(OrderBy::new(field("n"), Direction::Descending));
        let comparator = query.doc_comparator();
        let a = doc("c/a", &[("n", 1.into())]);
        let b = doc("c/b", &[("n", 2.into())]);
        let c = doc("c/c", &[("n", 2.into())]);
        assert_eq!(comparator(&a, &b), Ordering::Greater);
        assert_eq!(comparator(&b, &c), Ordering::Greater);
    }

    #[test]
    fn limit_to_last_inverts_target() {
        let query = Query::new(path("c"))
            .with_order_by(OrderBy::ascending(field("n")))
            .with_start_at(Bound::new(vec![1.into()], true))
            .with_limit_to_last(2);
        let target = query.to_target();
        assert_eq!(target.order_by[0].direction, Direction::Descending);
        assert!(target.start_at.is_none());
        assert_eq!(target.end_at, Some(Bound::new(vec![1.into()], false)));
        assert_ne!(
            query.canonical_id(),
            query.clone().with_limit_to_first(2).canonical_id()
        );
        assert!(query.canonical_id().ends_with("|lt:L"));
    }

    #[test]
    fn matches_all_documents_only_for_plain_queries() {
        assert!(Query::new(path("c")).matches_all_documents());
        assert!(!Query::new(path("c")).with_limit_to_first(1).matches_all_documents());
        assert!(Query::new(path("c"))
            .with_order_by(OrderBy::ascending(FieldPath::key_path()))
            .matches_all_documents());
    }
}
