//! Persistent ordered collections shared by every layer of the engine.

pub mod sorted_map;
pub mod sorted_set;

pub use sorted_map::{Comparator, SortedMap, SortedMapIter};
pub use sorted_set::{SortedSet, SortedSetIter};
