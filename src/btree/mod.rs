//! # Typed B-Tree Index
//!
//! A copy-on-append B+ tree keyed by `(value, row)` pairs, used for every
//! secondary field index and (row-only keyed) for the table's row-removal
//! tree.
//!
//! - [`node`]: node byte layout, key serialization and ordering
//! - [`manager`]: node storage, free chain, bounded node cache
//! - [`tree`]: insert / remove / range scan / pop-smallest

mod manager;
mod node;
mod tree;

pub use manager::{NodeManager, INDEX_HEADER_SIZE, INDEX_MAGIC};
pub use node::{BTreeKey, KeyLayout, Node, NIL_NODE};
pub use tree::BTree;
