//! Heap-side data structures: values, managed cells, classes, properties.

pub mod error;
pub mod heap;
pub mod identifier;
pub mod internal_class;
pub mod lookup;
pub mod managed;
pub mod object;
pub mod property;
pub mod sparse_array;
pub mod value;
