mod array_value;
mod bytes_value;
mod map_value;
mod ordering;
mod server_timestamp;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use ordering::{array_contains, type_order, value_compare, value_equals, TypeOrder};
pub use server_timestamp::{
    get_local_write_time, get_previous_value, is_server_timestamp, server_timestamp_value,
};
pub use value::{FirestoreValue, ValueKind};
