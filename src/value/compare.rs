//! Backend ordering, equality and canonical string forms for values.

use std::cmp::Ordering;

use crate::value::server_timestamp::{is_server_timestamp, local_write_time};
use crate::value::{FirestoreValue, MapValue, ReferenceValue, ValueKind};

/// Cross-type sort precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeOrder {
    Null,
    Boolean,
    Number,
    Timestamp,
    ServerTimestamp,
    String,
    Blob,
    Reference,
    GeoPoint,
    Array,
    Object,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Blob,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(_) if is_server_timestamp(value) => TypeOrder::ServerTimestamp,
        ValueKind::Map(_) => TypeOrder::Object,
    }
}

pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    if type_order(left) != type_order(right) {
        return false;
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            (l.is_nan() && r.is_nan()) || l == r
        }
        (ValueKind::Integer(_), ValueKind::Double(_))
        | (ValueKind::Double(_), ValueKind::Integer(_)) => false,
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
        (ValueKind::String(l), ValueKind::String(r)) => l == r,
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.len() == r.len()
                && l
                    .values()
                    .iter()
                    .zip(r.values())
                    .all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Map(_), ValueKind::Map(_)) if is_server_timestamp(left) => {
            local_write_time(left) == local_write_time(right)
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => maps_equal(l, r),
        _ => false,
    }
}

fn maps_equal(left: &MapValue, right: &MapValue) -> bool {
    left.len() == right.len()
        && left.fields().iter().all(|(key, value)| {
            right
                .get(key)
                .map_or(false, |other| values_equal(value, other))
        })
}

pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let left_type = type_order(left);
    let right_type = type_order(right);
    if left_type != right_type {
        return left_type.cmp(&right_type);
    }
    match (left.kind(), right.kind()) {
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_mixed(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_mixed(*r, *l).reverse(),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            for (a, b) in l.values().iter().zip(r.values()) {
                match compare_values(a, b) {
                    Ordering::Equal => continue,
                    other => return other,
                }
            }
            l.len().cmp(&r.len())
        }
        (ValueKind::Map(_), ValueKind::Map(_)) if left_type == TypeOrder::ServerTimestamp => {
            local_write_time(left).cmp(&local_write_time(right))
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => compare_maps(l, r),
        _ => Ordering::Equal,
    }
}

/// NaN sorts before every other number and equals itself.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    match (integer as f64).partial_cmp(&double) {
        Some(Ordering::Equal) => {
            if double >= i64::MAX as f64 {
                Ordering::Less
            } else if double < i64::MIN as f64 {
                Ordering::Greater
            } else {
                integer.cmp(&(double as i64))
            }
        }
        Some(ordering) => ordering,
        None => Ordering::Equal,
    }
}

fn compare_references(left: &ReferenceValue, right: &ReferenceValue) -> Ordering {
    left.database_id
        .compare(&right.database_id)
        .then_with(|| left.key.cmp(&right.key))
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((left_key, left_value), (right_key, right_value)) in
        left.fields().iter().zip(right.fields().iter())
    {
        match left_key.cmp(right_key) {
            Ordering::Equal => {}
            other => return other,
        }
        match compare_values(left_value, right_value) {
            Ordering::Equal => {}
            other => return other,
        }
    }
    left.len().cmp(&right.len())
}

/// Deterministic string form; map keys are emitted in sorted order.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        ValueKind::Integer(i) => out.push_str(&i.to_string()),
        ValueKind::Double(d) => out.push_str(&d.to_string()),
        ValueKind::Timestamp(ts) => out.push_str(&format!("time({},{})", ts.seconds, ts.nanos)),
        ValueKind::String(s) => out.push_str(s),
        ValueKind::Bytes(bytes) => out.push_str(&bytes.to_base64()),
        ValueKind::Reference(reference) => out.push_str(&reference.key.to_string()),
        ValueKind::GeoPoint(point) => {
            out.push_str(&format!("geo({},{})", point.latitude(), point.longitude()))
        }
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, field)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical(field, out);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::{DatabaseId, DocumentKey, GeoPoint, Timestamp};
    use crate::value::server_timestamp::server_timestamp;
    use crate::value::BytesValue;

    fn map(entries: &[(&str, FirestoreValue)]) -> FirestoreValue {
        FirestoreValue::from_map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn type_precedence_is_respected() {
        let ordered = vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_integer(-5),
            FirestoreValue::from_timestamp(Timestamp::new(1, 0)),
            server_timestamp(Timestamp::new(0, 0), None),
            FirestoreValue::from_string(""),
            FirestoreValue::from_bytes(BytesValue::new(vec![0])),
            FirestoreValue::from_reference(
                DatabaseId::default("p"),
                DocumentKey::from_string("a/b").unwrap(),
            ),
            FirestoreValue::from_geo_point(GeoPoint::new(0.0, 0.0).unwrap()),
            FirestoreValue::from_array(vec![]),
            map(&[]),
        ];
        for window in ordered.windows(2) {
            assert_eq!(
                compare_values(&window[0], &window[1]),
                Ordering::Less,
                "{:?} < {:?}",
                window[0],
                window[1]
            );
        }
    }

    #[test]
    fn nan_equals_nan_but_sorts_lowest() {
        let nan = FirestoreValue::from_double(f64::NAN);
        assert_eq!(nan, FirestoreValue::from_double(f64::NAN));
        assert_eq!(
            compare_values(&nan, &FirestoreValue::from_double(f64::NEG_INFINITY)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&nan, &FirestoreValue::from_integer(i64::MIN)),
            Ordering::Less
        );
    }

    #[test]
    fn integers_and_doubles_compare_but_are_not_equal() {
        let one = FirestoreValue::from_integer(1);
        let one_double = FirestoreValue::from_double(1.0);
        assert_eq!(compare_values(&one, &one_double), Ordering::Equal);
        assert_ne!(one, one_double);
        assert_eq!(
            compare_values(&FirestoreValue::from_double(1.5), &one),
            Ordering::Greater
        );
        assert_eq!(
            FirestoreValue::from_double(-0.0),
            FirestoreValue::from_double(0.0)
        );
    }

    #[test]
    fn arrays_and_maps_compare_element_wise() {
        let short = FirestoreValue::from_array(vec![1.into()]);
        let long = FirestoreValue::from_array(vec![1.into(), 0.into()]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);

        let a = map(&[("a", 2.into())]);
        let b = map(&[("b", 1.into())]);
        assert_eq!(compare_values(&a, &b), Ordering::Less);
    }

    #[test]
    fn canonical_id_sorts_map_keys() {
        let first = map(&[("z", 1.into()), ("a", "x".into())]);
        let second = map(&[("a", "x".into()), ("z", 1.into())]);
        assert_eq!(canonical_id(&first), "{a:x,z:1}");
        assert_eq!(canonical_id(&first), canonical_id(&second));
        let nested = FirestoreValue::from_array(vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_timestamp(Timestamp::new(3, 4)),
        ]);
        assert_eq!(canonical_id(&nested), "[null,true,time(3,4)]");
    }

    #[test]
    fn server_timestamps_compare_by_local_write_time() {
        let early = server_timestamp(Timestamp::new(1, 0), None);
        let late = server_timestamp(Timestamp::new(2, 0), Some(&FirestoreValue::from_integer(3)));
        assert_eq!(compare_values(&early, &late), Ordering::Less);
        assert_ne!(early, late);
    }
}
