//! # B-Tree Node Manager
//!
//! A [`NodeManager`] owns the storage side of one B-tree: a byte
//! container region holding fixed-size node slots, a free-node chain, the
//! root id, and a bounded RAM cache of hot nodes.
//!
//! Two flavors share the code:
//!
//! - **Field index managers** own a dedicated container whose slot 0 is
//!   the index header; tree nodes start at slot 1. The root and free-head
//!   ids persist in that header.
//! - The **row-removal manager** borrows a region of the table container
//!   (after the descriptor area); its root and free-head persist in the
//!   table header, so the manager is handed them at construction and the
//!   table reads them back at flush time.
//!
//! ## Index Header (one node slot)
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Magic: "STRABTIX"
//! 8       4     Root node id (NIL when empty)
//! 12      4     Free-chain head node id
//! 16      4     Node slot size in bytes
//! 20      2     Key value type id (0 for row-only keys)
//! 22      2     Zeroed
//! ```

use eyre::Result;
use hashbrown::HashMap;

use super::node::{KeyLayout, Node, NIL_NODE};
use crate::error::{fail, ErrorKind};
use crate::storage::SharedContainer;
use crate::types::FieldType;

pub const INDEX_MAGIC: &[u8; 8] = b"STRABTIX";
pub const INDEX_HEADER_SIZE: usize = 24;

/// Minimum node-cache size; below this, splits would thrash the
/// container on every step.
const MIN_CACHED_NODES: usize = 8;

pub struct NodeManager {
    container: SharedContainer,
    base_offset: u64,
    node_size: usize,
    layout: KeyLayout,
    root: u32,
    free_head: u32,
    node_count: u32,
    has_header: bool,
    cache: HashMap<u32, Node>,
    dirty: HashMap<u32, bool>,
    max_cached: usize,
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("base_offset", &self.base_offset)
            .field("node_size", &self.node_size)
            .field("root", &self.root)
            .field("free_head", &self.free_head)
            .field("node_count", &self.node_count)
            .field("has_header", &self.has_header)
            .finish()
    }
}

impl NodeManager {
    /// Manager over a borrowed container region (the row-removal tree).
    pub fn new(
        container: SharedContainer,
        base_offset: u64,
        node_size: usize,
        layout: KeyLayout,
        root: u32,
        free_head: u32,
        cache_budget: usize,
    ) -> Result<Self> {
        if !node_size.is_power_of_two() {
            fail!(
                ErrorKind::InvalidParameters,
                "node size {node_size} is not a power of two"
            );
        }

        let content = container.lock().size().saturating_sub(base_offset);
        let node_count = (content / node_size as u64) as u32;

        Ok(Self {
            container,
            base_offset,
            node_size,
            layout,
            root,
            free_head,
            node_count,
            has_header: false,
            cache: HashMap::new(),
            dirty: HashMap::new(),
            max_cached: (cache_budget / node_size).max(MIN_CACHED_NODES),
        })
    }

    /// Creates a fresh field index in an (empty) dedicated container.
    pub fn create_index(
        container: SharedContainer,
        node_size: usize,
        key_type: FieldType,
        cache_budget: usize,
    ) -> Result<Self> {
        let mut mgr = Self::new(
            container,
            node_size as u64,
            node_size,
            KeyLayout::for_field(key_type),
            NIL_NODE,
            NIL_NODE,
            cache_budget,
        )?;
        mgr.has_header = true;
        mgr.write_header()?;
        Ok(mgr)
    }

    /// Opens a field index container, validating its header.
    pub fn open_index(
        container: SharedContainer,
        expected_type: FieldType,
        cache_budget: usize,
    ) -> Result<Self> {
        let mut header = [0u8; INDEX_HEADER_SIZE];
        container.lock().read(0, &mut header)?;

        if &header[0..8] != INDEX_MAGIC {
            fail!(
                ErrorKind::ContainerInvalid,
                "index container has a bad signature"
            );
        }

        let root = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let free_head = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let node_size = u32::from_le_bytes(header[16..20].try_into().unwrap()) as usize;
        let type_id = u16::from_le_bytes(header[20..22].try_into().unwrap());

        if type_id != expected_type.id() {
            fail!(
                ErrorKind::ContainerInvalid,
                "index keyed by type {type_id} but field expects {}",
                expected_type.id()
            );
        }

        let mut mgr = Self::new(
            container,
            node_size as u64,
            node_size,
            KeyLayout::for_field(expected_type),
            root,
            free_head,
            cache_budget,
        )?;
        mgr.has_header = true;
        Ok(mgr)
    }

    fn write_header(&mut self) -> Result<()> {
        let key_type = self.layout.value_type.map_or(0, FieldType::id);

        let mut header = [0u8; INDEX_HEADER_SIZE];
        header[0..8].copy_from_slice(INDEX_MAGIC);
        header[8..12].copy_from_slice(&self.root.to_le_bytes());
        header[12..16].copy_from_slice(&self.free_head.to_le_bytes());
        header[16..20].copy_from_slice(&(self.node_size as u32).to_le_bytes());
        header[20..22].copy_from_slice(&key_type.to_le_bytes());

        let mut container = self.container.lock();
        if container.size() == 0 {
            // Reserve the whole header slot so node 0 starts aligned.
            let slot = vec![0u8; self.node_size];
            container.write(0, &slot)?;
        }
        container.write(0, &header)
    }

    pub fn layout(&self) -> KeyLayout {
        self.layout
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn max_cached_nodes(&self) -> usize {
        self.max_cached
    }

    pub fn root_id(&self) -> u32 {
        self.root
    }

    pub fn set_root_id(&mut self, id: u32) {
        self.root = id;
    }

    pub fn free_head(&self) -> u32 {
        self.free_head
    }

    /// Raw byte size of the index content (header slot included for field
    /// indices). Drives the descriptor's unit count.
    pub fn raw_size(&self) -> u64 {
        self.base_offset + self.node_count as u64 * self.node_size as u64
    }

    pub fn container(&self) -> &SharedContainer {
        &self.container
    }

    pub fn mark_for_removal(&self) {
        self.container.lock().mark_for_removal();
    }

    fn node_offset(&self, id: u32) -> u64 {
        self.base_offset + id as u64 * self.node_size as u64
    }

    /// Pops a node off the free chain or appends a new slot. The returned
    /// node is a zeroed leaf; callers re-shape it as needed.
    pub fn allocate_node(&mut self) -> Result<Node> {
        let id = if self.free_head != NIL_NODE {
            let free = self.load_node(self.free_head)?;
            debug_assert!(free.is_free());
            self.free_head = free.free_next();
            free.id
        } else {
            let id = self.node_count;
            self.node_count += 1;
            id
        };

        Ok(Node::new_leaf(id, self.node_size))
    }

    /// Pushes a node onto the free chain.
    pub fn free_node(&mut self, id: u32) -> Result<()> {
        let mut node = Node::new_leaf(id, self.node_size);
        node.set_free(true);
        node.set_free_next(self.free_head);
        self.free_head = id;
        self.save_node(node)
    }

    /// Reads a node, served from the cache when hot.
    pub fn load_node(&mut self, id: u32) -> Result<Node> {
        if id == NIL_NODE || id >= self.node_count {
            fail!(ErrorKind::GeneralControlError, "bad node id {id}");
        }

        if let Some(node) = self.cache.get(&id) {
            return Ok(node.clone());
        }

        let offset = self.node_offset(id);
        let mut data = vec![0u8; self.node_size];
        {
            let mut container = self.container.lock();
            if offset + self.node_size as u64 <= container.size() {
                container.read(offset, &mut data)?;
            }
            // A slot past the container's end is a node that was
            // allocated but never persisted; serve it zeroed.
        }

        let node = Node::from_raw(id, data);
        self.install(node.clone(), false)?;
        Ok(node)
    }

    /// Caches a modified node; it reaches the container at eviction or
    /// flush time.
    pub fn save_node(&mut self, node: Node) -> Result<()> {
        self.install(node, true)
    }

    fn install(&mut self, node: Node, dirty: bool) -> Result<()> {
        let id = node.id;
        let was_dirty = self.dirty.get(&id).copied().unwrap_or(false);
        self.cache.insert(id, node);
        self.dirty.insert(id, dirty || was_dirty);

        if self.cache.len() > self.max_cached {
            let victim = self
                .cache
                .keys()
                .copied()
                .find(|&k| k != id)
                .expect("cache holds more than one node");
            self.evict(victim)?;
        }
        Ok(())
    }

    fn evict(&mut self, id: u32) -> Result<()> {
        let Some(node) = self.cache.remove(&id) else {
            return Ok(());
        };
        if self.dirty.remove(&id).unwrap_or(false) {
            self.write_node(&node)?;
        }
        Ok(())
    }

    fn write_node(&mut self, node: &Node) -> Result<()> {
        let offset = self.node_offset(node.id);
        let mut container = self.container.lock();

        let size = container.size();
        if offset > size {
            // Nodes flush in arbitrary order; pad intervening slots.
            let zeroes = vec![0u8; (offset - size) as usize];
            container.write(size, &zeroes)?;
        }
        container.write(offset, &node.data)
    }

    /// Writes every dirty node (and the index header, when this manager
    /// owns one) back to the container.
    pub fn flush(&mut self) -> Result<()> {
        let dirty_ids: Vec<u32> = self
            .dirty
            .iter()
            .filter(|&(_, &d)| d)
            .map(|(&id, _)| id)
            .collect();

        for id in dirty_ids {
            let node = self.cache.get(&id).cloned();
            if let Some(node) = node {
                self.write_node(&node)?;
            }
            self.dirty.insert(id, false);
        }

        if self.has_header {
            self.write_header()?;
        }

        self.container.lock().flush()
    }
}
