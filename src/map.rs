//! A concurrent, segmented, lock-striped hash map with accessor handles.
//!
//! The map is the substrate both the mount table and the tom table are
//! built on; it is exported because its accessor-based surface is useful on
//! its own.

mod accessor;
mod bucket;
mod segmented;

pub use accessor::{ExclusiveAccessor, SharedAccessor};
pub use segmented::SegmentedHashMap;

/// The default hashing algorithm is the one used by
/// `std::collections::HashMap`, which provides resistance against HashDoS
/// attacks.
pub type DefaultHashBuilder = std::collections::hash_map::RandomState;
