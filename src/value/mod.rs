mod array_value;
mod bytes_value;
pub mod compare;
mod map_value;
pub mod server_timestamp;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use compare::{canonical_id, compare_values, type_order, values_equal, TypeOrder};
pub use map_value::MapValue;
pub use value::{FirestoreValue, ReferenceValue, ValueKind};
