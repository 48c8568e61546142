use crate::model::{FieldPath, Timestamp};
use crate::value::server_timestamp::server_timestamp;
use crate::value::{FirestoreValue, ValueKind};

/// Server-side field operations carried by a transform mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    pub field: FieldPath,
    pub operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }
}

impl TransformOperation {
    /// Optimistic value computed before the backend has seen the write.
    pub fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ServerTimestamp => server_timestamp(local_write_time, previous),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                let base = numeric_base_value(previous);
                increment(&base, operand)
            }
        }
    }

    /// Final value once the backend returned `transform_result`.
    ///
    /// Array operations are recomputed locally since the backend reports no
    /// result for them.
    pub fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        transform_result: Option<&FirestoreValue>,
    ) -> FirestoreValue {
        match self {
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::ServerTimestamp | TransformOperation::NumericIncrement(_) => {
                transform_result.cloned().unwrap_or_else(FirestoreValue::null)
            }
        }
    }

    /// Value to freeze in a base mutation so replays stay deterministic.
    /// `None` for operations that are safe to replay.
    pub fn compute_base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self {
            TransformOperation::NumericIncrement(_) => Some(numeric_base_value(previous)),
            _ => None,
        }
    }

    pub fn is_idempotent(&self) -> bool {
        !matches!(self, TransformOperation::NumericIncrement(_))
    }
}

fn coerced_array(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn array_union(previous: Option<&FirestoreValue>, elements: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerced_array(previous);
    for element in elements {
        if !values.iter().any(|existing| existing == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, elements: &[FirestoreValue]) -> FirestoreValue {
    let mut values = coerced_array(previous);
    values.retain(|existing| !elements.iter().any(|element| element == existing));
    FirestoreValue::from_array(values)
}

fn numeric_base_value(previous: Option<&FirestoreValue>) -> FirestoreValue {
    match previous {
        Some(value) if value.is_number() => value.clone(),
        _ => FirestoreValue::from_integer(0),
    }
}

fn increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(left), ValueKind::Integer(right)) => {
            FirestoreValue::from_integer(left.saturating_add(*right))
        }
        _ => {
            let sum = base.as_f64().unwrap_or(0.0) + operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(sum)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::server_timestamp::{is_server_timestamp, previous_value};

    #[test]
    fn increment_on_missing_field_starts_from_zero() {
        let op = TransformOperation::NumericIncrement(5.into());
        let value = op.apply_to_local_view(None, Timestamp::new(0, 0));
        assert_eq!(value, FirestoreValue::from_integer(5));
        let value = op.apply_to_local_view(Some(&"text".into()), Timestamp::new(0, 0));
        assert_eq!(value, FirestoreValue::from_integer(5));
    }

    #[test]
    fn increment_mixes_to_double_and_saturates() {
        let op = TransformOperation::NumericIncrement(FirestoreValue::from_double(0.5));
        assert_eq!(
            op.apply_to_local_view(Some(&1.into()), Timestamp::new(0, 0)),
            FirestoreValue::from_double(1.5)
        );
        let op = TransformOperation::NumericIncrement(1.into());
        assert_eq!(
            op.apply_to_local_view(Some(&FirestoreValue::from_integer(i64::MAX)), Timestamp::new(0, 0)),
            FirestoreValue::from_integer(i64::MAX)
        );
    }

    #[test]
    fn array_ops_are_idempotent() {
        let union = TransformOperation::ArrayUnion(vec![1.into(), 2.into()]);
        let once = union.apply_to_local_view(Some(&FirestoreValue::from_array(vec![2.into()])), Timestamp::new(0, 0));
        let twice = union.apply_to_local_view(Some(&once), Timestamp::new(0, 0));
        assert_eq!(once, twice);
        assert_eq!(once, FirestoreValue::from_array(vec![2.into(), 1.into()]));

        let remove = TransformOperation::ArrayRemove(vec![2.into()]);
        let removed = remove.apply_to_remote_document(Some(&once), None);
        assert_eq!(removed, FirestoreValue::from_array(vec![1.into()]));
        assert!(union.is_idempotent());
        assert!(!TransformOperation::NumericIncrement(1.into()).is_idempotent());
    }

    #[test]
    fn server_timestamp_keeps_previous_value_locally() {
        let op = TransformOperation::ServerTimestamp;
        let previous = FirestoreValue::from_string("old");
        let local = op.apply_to_local_view(Some(&previous), Timestamp::new(9, 0));
        assert!(is_server_timestamp(&local));
        assert_eq!(previous_value(&local), Some(&previous));
        let committed = FirestoreValue::from_timestamp(Timestamp::new(10, 0));
        assert_eq!(op.apply_to_remote_document(Some(&local), Some(&committed)), committed);
    }

    #[test]
    fn only_increments_have_base_values() {
        assert!(TransformOperation::ServerTimestamp.compute_base_value(None).is_none());
        assert_eq!(
            TransformOperation::NumericIncrement(1.into()).compute_base_value(Some(&FirestoreValue::from_double(2.5))),
            Some(FirestoreValue::from_double(2.5))
        );
    }
}
