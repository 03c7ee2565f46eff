//! # Engine Configuration
//!
//! All tunables live in [`DbSettings`], which is injected when a database is
//! opened and threaded through to every component that needs it. Nothing in
//! the engine reads configuration from a global or from the environment.
//!
//! ## Constant Relationships
//!
//! ```text
//! DEFAULT_MAX_UNIT_FILE_SIZE (512 MiB)
//!       │
//!       └─> every striped container allocates unit files of exactly this
//!           size except the last; a table refuses to open if its recorded
//!           value differs from the configured one
//!
//! RM_NODE_SIZE (16 KiB)
//!       │
//!       ├─> row-removal B-tree node size; the descriptor area of a table
//!       │   container is padded up to a multiple of it
//!       └─> must be a power of two
//!
//! Cache block geometry
//!       block sizes are doubled until they hold at least one item (a
//!       64-byte heap entry, or one full row for the row cache)
//! ```

mod settings;

pub use settings::DbSettings;

/// Unit-file size used when the caller does not override it.
pub const DEFAULT_MAX_UNIT_FILE_SIZE: u64 = 512 * 1024 * 1024;

/// Raw size of one row-removal B-tree node.
pub const RM_NODE_SIZE: usize = 16384;

/// Default block geometry for the row cache.
pub const DEFAULT_ROW_CACHE_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_ROW_CACHE_BLOCK_COUNT: usize = 1024;

/// Default block geometry for the variable-size heap cache.
pub const DEFAULT_HEAP_CACHE_BLOCK_SIZE: usize = 4096;
pub const DEFAULT_HEAP_CACHE_BLOCK_COUNT: usize = 1024;

/// RAM reserved by each temporal container before it spills to disk.
pub const DEFAULT_TEMPORAL_RESERVED: usize = 512 * 1024;

/// Per-index budget for cached B-tree nodes.
pub const DEFAULT_INDEX_CACHE_BUDGET: usize = 4 * 1024 * 1024;

const _: () = assert!(RM_NODE_SIZE.is_power_of_two());
const _: () = assert!(DEFAULT_ROW_CACHE_BLOCK_SIZE.is_power_of_two());
const _: () = assert!(DEFAULT_HEAP_CACHE_BLOCK_SIZE.is_power_of_two());
