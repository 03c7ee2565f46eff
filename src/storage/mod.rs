//! # Storage Module
//!
//! This module provides the byte-container layer the rest of the engine is
//! built on. A container is an addressable byte sequence that can grow at
//! its end and shrink anywhere via `collapse`; everything above it (heap
//! entries, B-tree nodes, row slots) addresses plain byte offsets and never
//! sees file boundaries.
//!
//! ## Container Variants
//!
//! ```text
//! Container (trait)
//! ├── FileContainer      striped family of unit files on disk
//! └── TemporalContainer  two RAM caches, spills to a FileContainer
//! ```
//!
//! A [`FileContainer`] stripes its logical bytes over numbered unit files
//! of a fixed maximum size. A [`TemporalContainer`] holds everything in RAM
//! until it outgrows its reservation, then transparently promotes itself to
//! a marked-for-removal spill family while keeping both RAM buffers as a
//! two-way write-back cache.
//!
//! ## Block Cache
//!
//! [`BlockCache`] layers fixed-size write-back blocks over any item-backed
//! store. The variable-size heap and the row store both use it so that hot
//! entries are served from RAM and flushed in block-sized writes.
//!
//! ## Safety Model
//!
//! Containers hand out no references into their storage; reads copy into
//! caller buffers and writes copy out of them. The block cache returns
//! item references that borrow the cache mutably, so the borrow checker
//! prevents holding one across an operation that could move its block.

mod block_cache;
mod file_container;
mod temporal;

pub use block_cache::{container_cache, BlockCache, BlockStore, ContainerStore, ItemRef};
pub use file_container::FileContainer;
pub use temporal::TemporalContainer;

use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

/// Bounce-buffer size used when shifting container content during collapse.
pub const COLLAPSE_STEP: usize = 1024;

/// An addressable byte sequence backed by RAM, disk, or both.
pub trait Container: Send {
    /// Copies `buf.len()` bytes starting at `offset` into `buf`.
    ///
    /// Fails with `InvalidAccessPosition` when the range extends past the
    /// container's end.
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` at `offset`, growing the container when the write ends
    /// past the current size. Writing strictly past the end (leaving a gap)
    /// fails with `InvalidAccessPosition`.
    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Removes bytes `[from, to)`, shifting the suffix down.
    fn collapse(&mut self, from: u64, to: u64) -> Result<()>;

    /// Current logical size in bytes.
    fn size(&self) -> u64;

    /// Defers deletion of the backing files until drop.
    fn mark_for_removal(&mut self);

    /// Forces durable storage of everything written so far.
    fn flush(&mut self) -> Result<()>;
}

/// A container shared between an owner and the components it lends storage
/// to (e.g. a table container also hosting row-removal B-tree nodes).
pub type SharedContainer = Arc<Mutex<dyn Container>>;

/// Wraps a container for shared use.
pub fn share<C: Container + 'static>(container: C) -> SharedContainer {
    Arc::new(Mutex::new(container))
}
