//! Injected database settings.

use std::path::PathBuf;

use super::{
    DEFAULT_HEAP_CACHE_BLOCK_COUNT, DEFAULT_HEAP_CACHE_BLOCK_SIZE, DEFAULT_INDEX_CACHE_BUDGET,
    DEFAULT_MAX_UNIT_FILE_SIZE, DEFAULT_ROW_CACHE_BLOCK_COUNT, DEFAULT_ROW_CACHE_BLOCK_SIZE,
    DEFAULT_TEMPORAL_RESERVED,
};

/// Settings handed to [`crate::Database::open`] and propagated to every
/// container, cache, and index the database creates.
#[derive(Debug, Clone)]
pub struct DbSettings {
    /// Directory for temporal-container spill files.
    pub temp_dir: PathBuf,
    /// Maximum size of one unit file in a striped container family.
    pub max_unit_file_size: u64,
    /// Row cache geometry: block byte size (rounded up to fit one row)
    /// and block count.
    pub row_cache_block_size: usize,
    pub row_cache_block_count: usize,
    /// Variable-size heap cache geometry.
    pub heap_cache_block_size: usize,
    pub heap_cache_block_count: usize,
    /// RAM reserved by each temporal container before spilling.
    pub temporal_reserved: usize,
    /// Byte budget for cached nodes of one field index.
    pub index_cache_budget: usize,
}

impl DbSettings {
    /// Settings rooted at the given temp directory, everything else default.
    pub fn with_temp_dir<P: Into<PathBuf>>(temp_dir: P) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir(),
            max_unit_file_size: DEFAULT_MAX_UNIT_FILE_SIZE,
            row_cache_block_size: DEFAULT_ROW_CACHE_BLOCK_SIZE,
            row_cache_block_count: DEFAULT_ROW_CACHE_BLOCK_COUNT,
            heap_cache_block_size: DEFAULT_HEAP_CACHE_BLOCK_SIZE,
            heap_cache_block_count: DEFAULT_HEAP_CACHE_BLOCK_COUNT,
            temporal_reserved: DEFAULT_TEMPORAL_RESERVED,
            index_cache_budget: DEFAULT_INDEX_CACHE_BUDGET,
        }
    }
}
