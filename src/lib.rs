#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A concurrent, in-memory key-value storage layer whose entries live in
//! external XML-backed hierarchical documents ("toms") attached at virtual
//! mount points.
//!
//! The crate has two layers:
//!
//! - [`SegmentedHashMap`], a lock-striped concurrent hash map whose
//!   operations hand out accessor handles holding a per-bucket
//!   shared/exclusive lock.
//! - [`Storage`], a façade over two such maps: a mount table binding
//!   virtual path prefixes to `(tom, sub-path, priority)` records, and a
//!   tom table coordinating lazy document loads, serialized mutation and
//!   flush-on-quiescence per tom. Reads fan out over every record of a
//!   mount and merge results by per-key priority; entries may carry a
//!   lifetime after which they expire.
//!
//! # Example
//!
//! ```rust
//! use tomstore::{create_empty_tom, Storage};
//!
//! let tom = std::env::temp_dir()
//!     .join("tomstore-readme-example.xml")
//!     .to_string_lossy()
//!     .into_owned();
//! let _ = std::fs::remove_file(&tom);
//! create_empty_tom(&tom).unwrap();
//!
//! let storage: Storage<u64, String> = Storage::new();
//! storage.mount("mnt", &tom, "inventory");
//!
//! assert!(storage.insert("mnt/reel", (17, "tape".to_owned())).unwrap());
//! assert_eq!(
//!     storage.value("mnt/reel").unwrap(),
//!     vec![(17, "tape".to_owned())]
//! );
//!
//! storage.set_mapped("mnt/reel", &"film".to_owned()).unwrap();
//! assert_eq!(storage.mapped("mnt/reel").unwrap(), vec!["film".to_owned()]);
//!
//! std::fs::remove_file(&tom).unwrap();
//! ```

pub(crate) mod common;
pub mod map;
pub mod store;

pub use common::error::{DocumentError, StorageError};
pub use map::{DefaultHashBuilder, ExclusiveAccessor, SegmentedHashMap, SharedAccessor};
pub use store::{create_empty_tom, read_tom, remove_tom, write_tom, Storage, TomTree};
