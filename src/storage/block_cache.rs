//! # Write-Back Block Cache
//!
//! [`BlockCache`] keeps a fixed number of equally sized blocks over an
//! item-addressed backing store. The variable-size heap caches its 64-byte
//! entries through it, and every table caches its row slots through it.
//!
//! ## Geometry
//!
//! A block holds an integral number of items. The configured block size is
//! doubled until at least one item fits, so callers can hand the same
//! default geometry to caches with very different item sizes.
//!
//! ```text
//! item index i  ──>  block covering [i - i % items_per_block, …)
//! ```
//!
//! ## Item Limit
//!
//! The cache clamps flushes to the owner-maintained item limit so a
//! block-aligned write-back never grows the backing past the last real
//! item. Owners bump the limit before touching a freshly appended item.
//!
//! ## Pinning
//!
//! [`BlockCache::retrieve`] returns an [`ItemRef`] that borrows the cache
//! mutably; while it lives no other cache call can run, so the underlying
//! block cannot move or be evicted. Dropping a ref written through
//! `as_mut` marks the block dirty, and in write-through mode stores it
//! immediately.

use std::ops::{Deref, DerefMut};

use eyre::{ensure, Result};
use tracing::warn;

use super::SharedContainer;

/// Backing store addressed in fixed-size items.
pub trait BlockStore {
    /// Writes `count` items starting at `first_item` from `buf`.
    fn store_items(&mut self, first_item: u64, count: usize, buf: &[u8]) -> Result<()>;

    /// Reads up to `count` items starting at `first_item` into `buf`.
    /// Items past the end of the store are left zeroed.
    fn retrieve_items(&mut self, first_item: u64, count: usize, buf: &mut [u8]) -> Result<()>;
}

/// A [`BlockStore`] over a shared byte container. Item *i* lives at byte
/// offset `i * item_size`; a store that lands past the container's end
/// zero-fills the gap first so block flush order does not matter.
pub struct ContainerStore {
    container: SharedContainer,
    item_size: usize,
}

impl ContainerStore {
    pub fn new(container: SharedContainer, item_size: usize) -> Self {
        Self {
            container,
            item_size,
        }
    }

    pub fn container(&self) -> &SharedContainer {
        &self.container
    }
}

impl BlockStore for ContainerStore {
    fn store_items(&mut self, first_item: u64, count: usize, buf: &[u8]) -> Result<()> {
        let mut container = self.container.lock();
        let offset = first_item * self.item_size as u64;

        let size = container.size();
        if offset > size {
            let zeroes = vec![0u8; (offset - size) as usize];
            container.write(size, &zeroes)?;
        }

        container.write(offset, &buf[..count * self.item_size])
    }

    fn retrieve_items(&mut self, first_item: u64, count: usize, buf: &mut [u8]) -> Result<()> {
        let mut container = self.container.lock();
        let offset = first_item * self.item_size as u64;

        let avail = container.size().saturating_sub(offset) as usize;
        let to_read = avail.min(count * self.item_size);
        if to_read > 0 {
            container.read(offset, &mut buf[..to_read])?;
        }
        buf[to_read..].fill(0);
        Ok(())
    }
}

struct Block {
    first_item: u64,
    data: Vec<u8>,
    dirty: bool,
    visited: bool,
}

pub struct BlockCache<S: BlockStore> {
    store: S,
    item_size: usize,
    items_per_block: usize,
    block_count: usize,
    write_through: bool,
    item_limit: u64,
    blocks: Vec<Block>,
    hand: usize,
}

impl<S: BlockStore> BlockCache<S> {
    pub fn new(
        store: S,
        item_size: usize,
        block_size: usize,
        block_count: usize,
        write_through: bool,
    ) -> Result<Self> {
        ensure!(item_size > 0, "cache item size cannot be zero");
        ensure!(block_count > 0, "cache block count cannot be zero");

        let mut block_size = block_size.max(1);
        while block_size < item_size {
            block_size *= 2;
        }

        Ok(Self {
            store,
            item_size,
            items_per_block: block_size / item_size,
            block_count,
            write_through,
            item_limit: 0,
            blocks: Vec::new(),
            hand: 0,
        })
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    pub fn item_limit(&self) -> u64 {
        self.item_limit
    }

    /// Raises or lowers the index bound used to clamp write-backs.
    pub fn set_item_limit(&mut self, limit: u64) {
        self.item_limit = limit;
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    fn block_base(&self, item: u64) -> u64 {
        item - item % self.items_per_block as u64
    }

    fn find_block(&self, first_item: u64) -> Option<usize> {
        self.blocks.iter().position(|b| b.first_item == first_item)
    }

    fn flush_block(store: &mut S, item_limit: u64, item_size: usize, block: &mut Block) -> Result<()> {
        if !block.dirty {
            return Ok(());
        }

        let items = (block.data.len() / item_size) as u64;
        let count = items.min(item_limit.saturating_sub(block.first_item)) as usize;
        if count > 0 {
            store.store_items(block.first_item, count, &block.data)?;
        }
        block.dirty = false;
        Ok(())
    }

    /// Returns the slot of the loaded block covering `item`, loading (and
    /// possibly evicting) as needed.
    fn load_block(&mut self, item: u64) -> Result<usize> {
        let first_item = self.block_base(item);

        if let Some(slot) = self.find_block(first_item) {
            self.blocks[slot].visited = true;
            return Ok(slot);
        }

        let slot = if self.blocks.len() < self.block_count {
            self.blocks.push(Block {
                first_item,
                data: vec![0; self.items_per_block * self.item_size],
                dirty: false,
                visited: false,
            });
            self.blocks.len() - 1
        } else {
            // Second-chance clock over the resident blocks.
            loop {
                self.hand = (self.hand + 1) % self.blocks.len();
                let block = &mut self.blocks[self.hand];
                if block.visited {
                    block.visited = false;
                    continue;
                }
                break;
            }
            let slot = self.hand;
            Self::flush_block(
                &mut self.store,
                self.item_limit,
                self.item_size,
                &mut self.blocks[slot],
            )?;
            self.blocks[slot].first_item = first_item;
            slot
        };

        let block = &mut self.blocks[slot];
        self.store
            .retrieve_items(first_item, self.items_per_block, &mut block.data)?;
        block.dirty = false;
        block.visited = true;
        Ok(slot)
    }

    /// Returns a pinned reference to item `item`.
    pub fn retrieve(&mut self, item: u64) -> Result<ItemRef<'_, S>> {
        ensure!(
            item < self.item_limit,
            "item {item} outside cache limit {}",
            self.item_limit
        );

        let slot = self.load_block(item)?;
        let offset = (item - self.blocks[slot].first_item) as usize * self.item_size;

        Ok(ItemRef {
            cache: self,
            slot,
            offset,
            wrote: false,
        })
    }

    /// Copies item `item` into `buf`.
    pub fn read_item(&mut self, item: u64, buf: &mut [u8]) -> Result<()> {
        let r = self.retrieve(item)?;
        buf.copy_from_slice(&r);
        Ok(())
    }

    /// Overwrites item `item` from `buf`.
    pub fn write_item(&mut self, item: u64, buf: &[u8]) -> Result<()> {
        let mut r = self.retrieve(item)?;
        r.copy_from_slice(buf);
        drop(r);
        Ok(())
    }

    /// Writes every dirty block back and clears the dirty marks.
    pub fn flush(&mut self) -> Result<()> {
        for block in &mut self.blocks {
            Self::flush_block(&mut self.store, self.item_limit, self.item_size, block)?;
        }
        Ok(())
    }

    /// Flushes just the block containing `item`, if resident and dirty.
    pub fn flush_item(&mut self, item: u64) -> Result<()> {
        let first_item = self.block_base(item);
        if let Some(slot) = self.find_block(first_item) {
            Self::flush_block(
                &mut self.store,
                self.item_limit,
                self.item_size,
                &mut self.blocks[slot],
            )?;
        }
        Ok(())
    }

    /// Re-reads the block containing `item` from the backing store,
    /// discarding any cached content for it.
    pub fn refresh_item(&mut self, item: u64) -> Result<()> {
        let first_item = self.block_base(item);
        if let Some(slot) = self.find_block(first_item) {
            let block = &mut self.blocks[slot];
            self.store
                .retrieve_items(first_item, self.items_per_block, &mut block.data)?;
            block.dirty = false;
        }
        Ok(())
    }
}

/// Pinned view of one cached item. Obtaining mutable bytes marks the
/// containing block dirty; in write-through mode the block is stored as
/// soon as the reference drops.
pub struct ItemRef<'a, S: BlockStore> {
    cache: &'a mut BlockCache<S>,
    slot: usize,
    offset: usize,
    wrote: bool,
}

impl<S: BlockStore> Deref for ItemRef<'_, S> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        let item_size = self.cache.item_size;
        &self.cache.blocks[self.slot].data[self.offset..self.offset + item_size]
    }
}

impl<S: BlockStore> DerefMut for ItemRef<'_, S> {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.wrote = true;
        let item_size = self.cache.item_size;
        let block = &mut self.cache.blocks[self.slot];
        block.dirty = true;
        &mut block.data[self.offset..self.offset + item_size]
    }
}

impl<S: BlockStore> Drop for ItemRef<'_, S> {
    fn drop(&mut self) {
        if self.wrote && self.cache.write_through {
            let cache = &mut *self.cache;
            if let Err(e) = BlockCache::flush_block(
                &mut cache.store,
                cache.item_limit,
                cache.item_size,
                &mut cache.blocks[self.slot],
            ) {
                warn!(error = %e, "write-through store of cache block failed");
            }
        }
    }
}

/// Convenience constructor for the common container-backed cache.
pub fn container_cache(
    container: SharedContainer,
    item_size: usize,
    block_size: usize,
    block_count: usize,
    write_through: bool,
) -> Result<BlockCache<ContainerStore>> {
    let initial_items = container.lock().size() / item_size as u64;
    let store = ContainerStore::new(container, item_size);
    let mut cache = BlockCache::new(store, item_size, block_size, block_count, write_through)?;
    cache.set_item_limit(initial_items);
    Ok(cache)
}
